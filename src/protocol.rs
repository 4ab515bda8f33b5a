//! # Voice-Agent Wire Protocol
//!
//! JSON control messages exchanged with the remote agent over the socket.
//! Binary frames carry raw PCM and never pass through this module.
//!
//! ## Message Format:
//! - **Client → Agent**: `Settings` (once per connection), `UpdateInstructions`,
//!   `UpdateSpeak`, `KeepAlive`
//! - **Agent → Client**: `Welcome`, `SettingsApplied`, `UserStartedSpeaking`,
//!   `AgentStartedSpeaking`, `ConversationText`, `AgentAudioDone`, `EndOfThought`,
//!   `Error`; anything else decodes as `Unknown`

use crate::config::{AgentConfig, AudioConfig};
use serde::{Deserialize, Serialize};

/// Control messages sent to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Session configuration, sent right after the socket opens
    Settings {
        audio: AudioSettings,
        agent: AgentSettings,
    },

    /// Replace the agent's instructions (default prompt + extras)
    UpdateInstructions { instructions: String },

    /// Switch the synthesis voice
    UpdateSpeak { model: String },

    /// No-op heartbeat; the agent closes idle connections
    KeepAlive,
}

impl ClientMessage {
    /// Build the `Settings` handshake from the configured audio formats and agent.
    pub fn settings(audio: &AudioConfig, agent: &AgentConfig) -> Self {
        ClientMessage::Settings {
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: "linear16".to_string(),
                    sample_rate: audio.transport_sample_rate,
                    container: None,
                },
                output: AudioFormat {
                    encoding: "linear16".to_string(),
                    sample_rate: audio.output_sample_rate,
                    container: Some("none".to_string()),
                },
            },
            agent: AgentSettings {
                listen: Stage {
                    provider: Provider::deepgram(&agent.listen_model),
                    prompt: None,
                },
                think: Stage {
                    provider: Provider {
                        kind: agent.think_provider.clone(),
                        model: agent.think_model.clone(),
                    },
                    prompt: Some(agent.combined_instructions()),
                },
                speak: Stage {
                    provider: Provider::deepgram(&agent.speak_model),
                    prompt: None,
                },
            },
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Settings { .. } => "Settings",
            ClientMessage::UpdateInstructions { .. } => "UpdateInstructions",
            ClientMessage::UpdateSpeak { .. } => "UpdateSpeak",
            ClientMessage::KeepAlive => "KeepAlive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub listen: Stage,
    pub think: Stage,
    pub speak: Stage,
}

/// One stage of the agent pipeline (listen, think or speak).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
}

impl Provider {
    fn deepgram(model: &str) -> Self {
        Self {
            kind: "deepgram".to_string(),
            model: model.to_string(),
        }
    }
}

/// Speaker of a `ConversationText` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Control messages received from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Acknowledges the `Settings` handshake
    SettingsApplied,

    /// The user began talking; in-flight agent audio must stop
    UserStartedSpeaking,

    /// The agent began a reply; latencies are in seconds
    AgentStartedSpeaking {
        #[serde(default)]
        tts_latency: Option<f64>,
        #[serde(default)]
        ttt_latency: Option<f64>,
        #[serde(default)]
        total_latency: Option<f64>,
    },

    ConversationText { role: Role, content: String },

    /// The agent finished sending audio for this turn
    AgentAudioDone,

    EndOfThought,

    Error {
        #[serde(default, alias = "message")]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
