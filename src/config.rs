//! # Configuration Management
//!
//! Loads the session configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, nested keys separated by `__`)
//! - Deployment specials: `HOST`, `PORT`, `DEEPGRAM_API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment specials
//! 2. Environment variables (APP_SERVER__PORT, APP_SESSION__SLEEP_TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::error::AppResult;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// Split into logical groups so each component only receives the section it
/// needs (the transport gets `transport`, the capture pipeline gets `audio`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
    pub credentials: CredentialsConfig,
}

/// HTTP server settings (credential endpoint + session API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When false only the session core runs (no HTTP surface).
    pub enabled: bool,
}

/// Remote voice-agent connection settings.
///
/// ## Fields:
/// - `agent_url`: WebSocket endpoint of the agent service
/// - `auth_url`: endpoint returning `{ "key": ... }` for each connection attempt
/// - `keepalive_interval_secs`: heartbeat period; the remote side drops idle sockets
/// - `reconnect_delay_secs`: fixed backoff between a close and the next attempt
/// - `max_reconnect_attempts`: consecutive closes tolerated before rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub agent_url: String,
    pub auth_url: String,
    pub keepalive_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
}

impl TransportConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Audio capture, wire format and playback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Samples per capture block handed to the per-block callback
    pub capture_block_size: usize,

    /// Sample rate of the PCM sent to the agent (16-bit LE mono)
    pub transport_sample_rate: u32,

    /// Sample rate of the PCM the agent sends back
    pub output_sample_rate: u32,

    /// WAV file used as the microphone (headless mode)
    pub input_file: Option<String>,

    /// WAV file receiving rendered agent audio
    pub output_file: Option<String>,

    /// Delay before the single microphone acquisition retry
    pub microphone_retry_delay_ms: u64,

    /// Smoothing constant of the voice-activity analysers, in [0, 1)
    pub analyser_smoothing: f32,
}

/// Conversation state machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds without qualifying activity before the session falls asleep
    pub sleep_timeout_secs: u32,
}

/// Agent behaviour sent in the `Settings` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub listen_model: String,
    pub think_provider: String,
    pub think_model: String,
    /// Voice used for speech synthesis (`UpdateSpeak.model`)
    pub speak_model: String,
    /// Default instructions
    pub prompt: String,
    /// Extra instructions appended to the default prompt
    pub instructions: String,
}

impl AgentConfig {
    /// Join the default prompt and the extra instructions.
    ///
    /// Either part is used alone when the other is empty.
    pub fn combined_instructions(&self) -> String {
        combine_instructions(&self.prompt, &self.instructions)
    }
}

pub fn combine_instructions(default_prompt: &str, extra: &str) -> String {
    match (default_prompt.is_empty(), extra.is_empty()) {
        (false, false) => format!("{}\n{}", default_prompt, extra),
        (false, true) => default_prompt.to_string(),
        (true, _) => extra.to_string(),
    }
}

/// How `POST /api/authenticate` obtains a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Hand out the configured API key as-is
    Provided,
    /// Mint a short-lived key through the management API
    Temporary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub strategy: KeyStrategy,
    pub api_key: Option<String>,
    pub management_url: String,
    pub key_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                enabled: true,
            },
            transport: TransportConfig {
                agent_url: "wss://agent.deepgram.com/agent".to_string(),
                auth_url: "http://127.0.0.1:8080/api/authenticate".to_string(),
                keepalive_interval_secs: 10,
                reconnect_delay_secs: 3,
                max_reconnect_attempts: 5,
            },
            audio: AudioConfig {
                capture_block_size: 4096,
                transport_sample_rate: 16000,
                output_sample_rate: 24000,
                input_file: None,
                output_file: None,
                microphone_retry_delay_ms: 1000,
                analyser_smoothing: 0.96,
            },
            session: SessionConfig {
                sleep_timeout_secs: 30,
            },
            agent: AgentConfig {
                listen_model: "nova-3".to_string(),
                think_provider: "open_ai".to_string(),
                think_model: "gpt-4o-mini".to_string(),
                speak_model: "aura-2-thalia-en".to_string(),
                prompt: "You are a helpful voice assistant. Keep answers short and conversational."
                    .to_string(),
                instructions: String::new(),
            },
            credentials: CredentialsConfig {
                strategy: KeyStrategy::Provided,
                api_key: None,
                management_url: "https://api.deepgram.com/v1".to_string(),
                key_ttl_secs: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUDIO__INPUT_FILE=hello.wav`: Use a WAV file as the microphone
    /// - `APP_CREDENTIALS__STRATEGY=temporary`: Mint short-lived keys
    /// - `DEEPGRAM_API_KEY=...`: The vendor key used by the credential endpoint
    pub fn load() -> AppResult<Self> {
        Self::load_from("config")
    }

    /// Like [`AppConfig::load`] but reads `file` (any extension the `config`
    /// crate knows) instead of `config.*`.
    fn load_from(file: &str) -> AppResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("credentials.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.audio.transport_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if !(0.0..1.0).contains(&self.audio.analyser_smoothing) {
            return Err(anyhow::anyhow!("Analyser smoothing must be within [0, 1)"));
        }

        if self.transport.keepalive_interval_secs == 0 {
            return Err(anyhow::anyhow!("Keep-alive interval must be greater than 0"));
        }

        if self.transport.max_reconnect_attempts == 0 {
            return Err(anyhow::anyhow!("Max reconnect attempts must be greater than 0"));
        }

        if self.session.sleep_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Sleep timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial runtime update of the agent behaviour.
    ///
    /// Only `agent.instructions` and `agent.speak_model` can change while a
    /// session is live; everything else needs a restart.
    ///
    /// ```json
    /// {"agent": {"instructions": "Answer in French", "speak_model": "aura-2-agathe-fr"}}
    /// ```
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(agent) = partial_config.get("agent") {
            if let Some(instructions) = agent.get("instructions").and_then(|v| v.as_str()) {
                self.agent.instructions = instructions.to_string();
            }
            if let Some(voice) = agent.get("speak_model").and_then(|v| v.as_str()) {
                if voice.trim().is_empty() {
                    return Err(anyhow::anyhow!("Voice model cannot be empty"));
                }
                self.agent.speak_model = voice.to_string();
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Copy safe to expose over HTTP (API key redacted).
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if copy.credentials.api_key.is_some() {
            copy.credentials.api_key = Some("***".to_string());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transport.keepalive_interval(), Duration::from_secs(10));
        assert_eq!(config.transport.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.audio.capture_block_size, 4096);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.session.sleep_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_config_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[transport]\nmax_reconnect_attempts = \"many\"\n").unwrap();

        let base = dir.path().join("config");
        let result = AppConfig::load_from(base.to_str().unwrap());
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.transport.max_reconnect_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.analyser_smoothing = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"agent": {"instructions": "Be brief", "speak_model": "aura-2-orion-en"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.agent.instructions, "Be brief");
        assert_eq!(config.agent.speak_model, "aura-2-orion-en");
        assert_eq!(config.server.port, 8080);

        assert!(config
            .update_from_json(r#"{"agent": {"speak_model": " "}}"#)
            .is_err());
    }

    #[test]
    fn test_combine_instructions() {
        assert_eq!(combine_instructions("base", "extra"), "base\nextra");
        assert_eq!(combine_instructions("base", ""), "base");
        assert_eq!(combine_instructions("", "extra"), "extra");
        assert_eq!(combine_instructions("", ""), "");
    }

    #[test]
    fn test_redacted_hides_key() {
        let mut config = AppConfig::default();
        config.credentials.api_key = Some("secret".to_string());
        assert_eq!(config.redacted().credentials.api_key.as_deref(), Some("***"));
    }
}
