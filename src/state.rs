//! # Application State
//!
//! Shared by every HTTP handler (actix clones it into each worker).
//!
//! ## Contents:
//! - **config**: the live configuration, updated by `PUT /api/v1/session/settings`
//! - **metrics**: request counters fed by the metrics middleware
//! - **agent**: handle to the voice-agent loop (commands in, snapshots out)
//! - **issuer**: backs `POST /api/authenticate`
//!
//! The voice agent itself is not behind a lock: it owns its state and is only
//! reached through its command channel.

use crate::agent::AgentHandle;
use crate::config::AppConfig;
use crate::credentials::KeyIssuer;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub agent: AgentHandle,
    pub issuer: KeyIssuer,
    pub start_time: Instant,
}

/// Request counters, overall and per `METHOD /path`.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub credentials_issued: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, agent: AgentHandle) -> Self {
        let issuer = KeyIssuer::new(config.credentials.clone());
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            agent,
            issuer,
            start_time: Instant::now(),
        }
    }

    // poisoned locks are recovered
    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    pub fn increment_credentials_issued(&self) {
        self.write_metrics().credentials_issued += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::tests::spawn_test_agent;

    pub(crate) fn test_state() -> AppState {
        AppState::new(AppConfig::default(), spawn_test_agent())
    }

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let state = test_state();
        let mut config = state.get_config();
        config.session.sleep_timeout_secs = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().session.sleep_timeout_secs, 30);
    }
}
