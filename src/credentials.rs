//! # Credentials
//!
//! Two sides of the short-lived key flow:
//! - **Client** (`Authenticator`): the transport asks for a fresh key on every
//!   connection attempt. `HttpAuthenticator` POSTs to the credential endpoint
//!   and reads `{ "key": ... }`.
//! - **Server** (`KeyIssuer`): backs `POST /api/authenticate`. With the
//!   `provided` strategy the configured key is returned as-is; with
//!   `temporary` a short-lived key is minted through the management API.

use crate::config::{CredentialsConfig, KeyStrategy};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

/// Source of the key presented when opening the agent socket.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn fetch_key(&self) -> AppResult<String>;
}

/// Success payload of the credential endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResponse {
    pub key: String,
}

/// Fetches keys from the credential endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthenticator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn fetch_key(&self) -> AppResult<String> {
        let response = self.client.post(&self.url).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;

        match body.get("key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => {
                debug!("obtained agent key");
                Ok(key.to_string())
            }
            _ => Err(AppError::Credential(format!(
                "credential endpoint returned {} without a key: {}",
                status, body
            ))),
        }
    }
}

/// A fixed key, used when the credential endpoint is not served.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator(pub String);

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn fetch_key(&self) -> AppResult<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    #[serde(default)]
    projects: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    project_id: String,
}

#[derive(Debug, Serialize)]
struct NewKeyRequest<'a> {
    comment: &'a str,
    scopes: Vec<&'a str>,
    tags: Vec<&'a str>,
    time_to_live_in_seconds: u64,
}

/// Issues keys for `POST /api/authenticate`.
#[derive(Debug, Clone)]
pub struct KeyIssuer {
    client: reqwest::Client,
    config: CredentialsConfig,
}

impl KeyIssuer {
    pub fn new(config: CredentialsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Produce the credential payload. On success the JSON carries `key`.
    pub async fn issue(&self) -> AppResult<Value> {
        let api_key = self.config.api_key.as_deref().filter(|k| !k.is_empty());

        if self.config.strategy == KeyStrategy::Provided {
            return match api_key {
                Some(key) => Ok(serde_json::to_value(KeyResponse {
                    key: key.to_string(),
                })?),
                None => Err(AppError::Credential(
                    "Can't do local development without setting a `DEEPGRAM_API_KEY` environment variable."
                        .to_string(),
                )),
            };
        }

        let api_key = api_key.unwrap_or_default();
        let base = self.config.management_url.trim_end_matches('/');

        let projects: ProjectList = self
            .client
            .get(format!("{}/projects", base))
            .header("Authorization", format!("Token {}", api_key))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                error!(error = %e, "error listing projects");
                AppError::Credential(format!("cannot list projects: {}", e))
            })?
            .json()
            .await?;

        let project = projects.projects.into_iter().next().ok_or_else(|| {
            error!("no project found");
            AppError::Credential(
                "Cannot find a project. Please create a project first.".to_string(),
            )
        })?;
        info!(project_id = %project.project_id, "found project");

        let request = NewKeyRequest {
            comment: "Temporary API key",
            scopes: vec!["usage:write"],
            tags: vec!["voiceagent"],
            time_to_live_in_seconds: self.config.key_ttl_secs,
        };

        let created: Value = self
            .client
            .post(format!("{}/projects/{}/keys", base, project.project_id))
            .header("Authorization", format!("Token {}", api_key))
            .json(&request)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                error!(error = %e, "error creating project key");
                AppError::Credential(format!("cannot create project key: {}", e))
            })?
            .json()
            .await?;

        info!("created temporary key");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(strategy: KeyStrategy, key: Option<&str>, url: &str) -> CredentialsConfig {
        CredentialsConfig {
            strategy,
            api_key: key.map(str::to_string),
            management_url: url.to_string(),
            key_ttl_secs: 10,
        }
    }

    #[tokio::test]
    async fn test_http_authenticator_reads_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "short-lived"})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = HttpAuthenticator::new(format!("{}/api/authenticate", server.uri()));
        assert_eq!(auth.fetch_key().await.unwrap(), "short-lived");
    }

    #[tokio::test]
    async fn test_http_authenticator_error_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(502).set_body_json(json!({"error": {"message": "nope"}})),
            )
            .mount(&server)
            .await;

        let auth = HttpAuthenticator::new(server.uri());
        assert!(matches!(auth.fetch_key().await, Err(AppError::Credential(_))));
    }

    #[tokio::test]
    async fn test_provided_strategy() {
        let issuer = KeyIssuer::new(credentials(KeyStrategy::Provided, Some("dg-key"), "http://unused"));
        assert_eq!(issuer.issue().await.unwrap(), json!({"key": "dg-key"}));

        let issuer = KeyIssuer::new(credentials(KeyStrategy::Provided, None, "http://unused"));
        assert!(matches!(issuer.issue().await, Err(AppError::Credential(_))));
    }

    #[tokio::test]
    async fn test_temporary_strategy_mints_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects"))
            .and(header("Authorization", "Token dg-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "projects": [{"project_id": "p1", "name": "demo"}, {"project_id": "p2"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/projects/p1/keys"))
            .and(body_partial_json(json!({
                "comment": "Temporary API key",
                "scopes": ["usage:write"],
                "time_to_live_in_seconds": 10
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "api_key_id": "k1", "key": "temp-key", "comment": "Temporary API key"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let issuer = KeyIssuer::new(credentials(KeyStrategy::Temporary, Some("dg-key"), &server.uri()));
        let payload = issuer.issue().await.unwrap();
        assert_eq!(payload["key"], "temp-key");
    }

    #[tokio::test]
    async fn test_temporary_strategy_without_projects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"projects": []})))
            .mount(&server)
            .await;

        let issuer = KeyIssuer::new(credentials(KeyStrategy::Temporary, Some("dg-key"), &server.uri()));
        assert!(matches!(issuer.issue().await, Err(AppError::Credential(_))));
    }
}
