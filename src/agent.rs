//! # Voice Agent Orchestrator
//!
//! The single owner of the session: transport, capture pipeline, playback
//! pipeline, status machine and conversation log. Everything that can happen
//! (socket events, captured audio blocks, microphone acquisition results,
//! one-second ticks, commands from the HTTP API) arrives on a channel and is
//! handled to completion by one loop, so no component state is ever touched
//! concurrently.
//!
//! ## Bring-up:
//! 1. Start the speaker and begin acquiring the microphone (off-thread).
//! 2. Connect the transport.
//! 3. Once the socket is connected and the microphone ready, start the
//!    microphone.
//! 4. Once the socket is connected, the microphone open and the session not
//!    rate limited, leave `NONE` for `LISTENING`.
//!
//! ## Observation:
//! A `watch` channel carries an `AgentSnapshot` after every handled event and
//! the conversation log is shared behind an `RwLock`.

use crate::audio::analyser::AnalyserTap;
use crate::audio::capture::{
    CapturePipeline, CapturedBlock, MicrophoneSource, MicrophoneState, MicrophoneStream,
    SetupRequest,
};
use crate::audio::devices::SpeakerOutput;
use crate::audio::playback::{PlaybackMixer, PlaybackPipeline};
use crate::config::{combine_instructions, AppConfig};
use crate::conversation::{
    BehindTheScenesEvent, ConversationLog, LatencyRecord, StatusMachine, VoiceStatus,
};
use crate::credentials::Authenticator;
use crate::error::{AppError, AppResult};
use crate::protocol::{ClientMessage, Role, ServerMessage};
use crate::transport::{
    Inbound, SocketState, TaggedEvent, TransportEvent, TransportSession, TransportSnapshot,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Requests from outside the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    /// The single user action: ignored before the conversation started,
    /// otherwise toggles sleep
    VoiceBotAction,
    /// Replace the extra instructions appended to the default prompt
    UpdateInstructions(String),
    /// Switch the synthesis voice
    UpdateVoice(String),
    Shutdown,
}

/// What the session is doing right now.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub status: VoiceStatus,
    pub transport: TransportSnapshot,
    pub microphone: MicrophoneState,
    pub microphone_unavailable: bool,
    pub waiting_for_user_voice: bool,
    pub inactivity_secs: u32,
    pub input_level: f32,
    pub output_level: f32,
    /// Agent audio scheduled but not yet played, in seconds
    pub queued_audio_secs: f64,
    pub instructions: String,
    pub voice: String,
}

/// Cheap, cloneable access to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::UnboundedSender<AgentCommand>,
    snapshot: watch::Receiver<AgentSnapshot>,
    log: Arc<RwLock<ConversationLog>>,
}

impl AgentHandle {
    pub fn send(&self, command: AgentCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .map_err(|_| AppError::Internal("voice agent is not running".to_string()))
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentSnapshot> {
        self.snapshot.clone()
    }

    pub fn log(&self) -> Arc<RwLock<ConversationLog>> {
        self.log.clone()
    }
}

type MicrophoneResult = AppResult<Box<dyn MicrophoneStream>>;

pub struct VoiceAgent {
    config: AppConfig,
    status: StatusMachine,
    transport: TransportSession,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    microphone: Arc<dyn MicrophoneSource>,
    speaker: Box<dyn SpeakerOutput>,
    speaker_failed: bool,
    output_level: AnalyserTap,
    log: Arc<RwLock<ConversationLog>>,
    microphone_retried: bool,
    microphone_unavailable: bool,
    snapshot_tx: watch::Sender<AgentSnapshot>,
    transport_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    blocks_tx: mpsc::UnboundedSender<CapturedBlock>,
    blocks_rx: mpsc::UnboundedReceiver<CapturedBlock>,
    microphone_tx: mpsc::UnboundedSender<MicrophoneResult>,
    microphone_rx: mpsc::UnboundedReceiver<MicrophoneResult>,
    commands_rx: mpsc::UnboundedReceiver<AgentCommand>,
}

impl VoiceAgent {
    pub fn new(
        config: AppConfig,
        microphone: Box<dyn MicrophoneSource>,
        speaker: Box<dyn SpeakerOutput>,
        authenticator: Arc<dyn Authenticator>,
    ) -> (Self, AgentHandle) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (blocks_tx, blocks_rx) = mpsc::unbounded_channel();
        let (microphone_tx, microphone_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let transport = TransportSession::new(
            config.transport.clone(),
            authenticator,
            ClientMessage::settings(&config.audio, &config.agent),
            transport_tx,
        );

        let smoothing = config.audio.analyser_smoothing;
        let capture = CapturePipeline::new(
            config.audio.transport_sample_rate,
            AnalyserTap::new(smoothing),
        );
        let output_level = AnalyserTap::new(smoothing);
        let playback = PlaybackPipeline::new(PlaybackMixer::new(
            config.audio.output_sample_rate,
            output_level.clone(),
        ));

        let log = Arc::new(RwLock::new(ConversationLog::new()));
        let status = StatusMachine::new(config.session.sleep_timeout_secs);

        let mut agent = Self {
            config,
            status,
            transport,
            capture,
            playback,
            microphone: Arc::from(microphone),
            speaker,
            speaker_failed: false,
            output_level,
            log: log.clone(),
            microphone_retried: false,
            microphone_unavailable: false,
            // replaced right below, once the agent can describe itself
            snapshot_tx: watch::channel(placeholder_snapshot()).0,
            transport_rx,
            blocks_tx,
            blocks_rx,
            microphone_tx,
            microphone_rx,
            commands_rx,
        };

        let (snapshot_tx, snapshot_rx) = watch::channel(agent.snapshot());
        agent.snapshot_tx = snapshot_tx;

        let handle = AgentHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            log,
        };
        (agent, handle)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            status: self.status.status(),
            transport: self.transport.snapshot(),
            microphone: self.capture.state(),
            microphone_unavailable: self.microphone_unavailable,
            waiting_for_user_voice: self.status.is_waiting_for_user_voice(),
            inactivity_secs: self.status.inactivity_secs(),
            input_level: self.capture.analyser().level(),
            output_level: self.output_level.level(),
            queued_audio_secs: self.playback.queued_seconds(),
            instructions: self.config.agent.instructions.clone(),
            voice: self.config.agent.speak_model.clone(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Run until `Shutdown` arrives or every handle is dropped.
    pub async fn run(mut self) {
        info!(microphone = %self.microphone.describe(), "voice agent starting");

        self.start_speaker();
        self.begin_microphone_setup(Duration::ZERO);
        if let Err(e) = self.transport.connect() {
            error!(error = %e, "cannot connect to voice agent");
        }

        let second = Duration::from_secs(1);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + second, second);

        loop {
            self.publish();
            tokio::select! {
                Some((generation, event)) = self.transport_rx.recv() => {
                    self.on_transport_event(generation, event).await;
                }
                Some(block) = self.blocks_rx.recv() => self.on_captured_block(&block),
                Some(result) = self.microphone_rx.recv() => self.on_microphone_result(result),
                _ = ticker.tick() => {
                    self.status.tick();
                }
                command = self.commands_rx.recv() => match command {
                    Some(AgentCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }

        self.shutdown();
        self.publish();
    }

    /// Without a running speaker nothing renders the mixer, so agent audio
    /// is not scheduled at all.
    fn start_speaker(&mut self) {
        if let Err(e) = self.speaker.start(self.playback.mixer().clone()) {
            error!(error = %e, "speaker unavailable; agent audio will not be heard");
            self.speaker_failed = true;
        }
    }

    fn shutdown(&mut self) {
        self.transport.shutdown();
        self.capture.teardown();
        self.playback.clear_audio_buffer();
        self.speaker.stop();
        info!("voice agent stopped");
    }

    /// Start acquiring the microphone after `delay`, off the loop.
    fn begin_microphone_setup(&mut self, delay: Duration) {
        if self.capture.begin_setup() == SetupRequest::AlreadyInProgress {
            return;
        }
        let source = self.microphone.clone();
        let block_size = self.config.audio.capture_block_size;
        let blocks = self.blocks_tx.clone();
        let results = self.microphone_tx.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = tokio::task::spawn_blocking(move || source.acquire(block_size, blocks))
                .await
                .unwrap_or_else(|e| {
                    Err(AppError::Device(format!("microphone acquisition panicked: {}", e)))
                });
            let _ = results.send(result);
        });
    }

    fn on_microphone_result(&mut self, result: MicrophoneResult) {
        match self.capture.complete_setup(result) {
            Ok(()) => {
                self.microphone_unavailable = false;
                self.maybe_start_microphone();
                self.maybe_begin_listening();
            }
            Err(e) if !self.microphone_retried => {
                self.microphone_retried = true;
                let delay = Duration::from_millis(self.config.audio.microphone_retry_delay_ms);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "retrying microphone setup");
                self.begin_microphone_setup(delay);
            }
            Err(e) => {
                self.microphone_unavailable = true;
                error!(error = %e, "microphone unavailable");
            }
        }
    }

    fn maybe_start_microphone(&mut self) {
        if self.transport.is_connected() && self.capture.state() == MicrophoneState::Ready {
            self.capture.start();
        }
    }

    fn maybe_begin_listening(&mut self) {
        if self.transport.is_connected()
            && self.capture.state() == MicrophoneState::Open
            && !self.transport.is_rate_limited()
            && self.status.status() == VoiceStatus::None
        {
            self.status.start_listening();
        }
    }

    fn on_captured_block(&mut self, block: &CapturedBlock) {
        let may_send = self.transport.is_connected() && !self.status.is_sleeping();
        if let Some(bytes) = self.capture.process_block(block, may_send) {
            self.transport.send_audio(bytes);
        }
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        match self.transport.handle_event(generation, event) {
            Some(Inbound::Connected) => {
                self.maybe_start_microphone();
                self.maybe_begin_listening();
            }
            Some(Inbound::Disconnected) => {
                if self.transport.is_rate_limited() {
                    error!(
                        attempts = self.transport.reconnect_attempts(),
                        "voice agent rate limited; releasing the microphone"
                    );
                    self.capture.teardown();
                    self.playback.clear_audio_buffer();
                }
            }
            Some(Inbound::Audio(bytes)) => self.on_agent_audio(&bytes),
            Some(Inbound::Control(message)) => self.on_control(message).await,
            None => {}
        }
    }

    fn on_agent_audio(&mut self, bytes: &[u8]) {
        if self.speaker_failed
            || self.status.is_sleeping()
            || self.status.is_waiting_for_user_voice()
        {
            debug!(len = bytes.len(), "dropping agent audio");
            return;
        }
        self.playback.buffer_audio(bytes);
    }

    async fn on_control(&mut self, message: ServerMessage) {
        let mut log = self.log.write().await;
        let status_before = self.status.status();

        match message {
            ServerMessage::Welcome { request_id } => {
                debug!(?request_id, "voice agent welcome");
            }
            ServerMessage::SettingsApplied => {
                info!("settings applied");
                log.push_event(BehindTheScenesEvent::SettingsApplied);
            }
            ServerMessage::UserStartedSpeaking => {
                if status_before == VoiceStatus::Speaking {
                    log.push_event(BehindTheScenesEvent::Interruption);
                }
                log.push_event(BehindTheScenesEvent::UserStartedSpeaking);

                self.status.user_voice_detected();
                self.playback.clear_audio_buffer();
                self.status.start_listening();
            }
            ServerMessage::AgentStartedSpeaking {
                tts_latency,
                ttt_latency,
                total_latency,
            } => {
                log.push_event(BehindTheScenesEvent::AgentStartedSpeaking);
                match LatencyRecord::from_fields(tts_latency, ttt_latency, total_latency) {
                    Some(record) => log.push_latency(record),
                    None => debug!("partial latency measurement dropped"),
                }
            }
            ServerMessage::ConversationText { role, content } => {
                log.push_event(BehindTheScenesEvent::ConversationText {
                    role,
                    content: content.clone(),
                });
                match role {
                    Role::User => {
                        if !self.status.is_sleeping() {
                            log.push_utterance(Role::User, content);
                        }
                        self.status.reset_timer();
                    }
                    Role::Assistant => {
                        if !self.status.is_sleeping() && !self.status.is_waiting_for_user_voice() {
                            self.status.start_speaking();
                            log.push_utterance(Role::Assistant, content);
                        }
                    }
                }
            }
            ServerMessage::AgentAudioDone => {
                // audio may still be playing; listening starts slightly early
                if !self.status.finish_speaking() {
                    debug!(status = ?status_before, "agent audio done; status kept");
                }
            }
            ServerMessage::EndOfThought => {
                log.push_event(BehindTheScenesEvent::EndOfThought);
            }
            ServerMessage::Error { description, code } => {
                warn!(?code, ?description, "voice agent reported an error");
            }
            ServerMessage::Unknown => debug!("ignoring unknown control message"),
        }
    }

    fn on_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::VoiceBotAction => {
                if self.status.status() == VoiceStatus::None {
                    debug!("voice bot action ignored: conversation not started");
                } else {
                    self.status.toggle_sleep();
                }
            }
            AgentCommand::UpdateInstructions(instructions) => {
                if instructions == self.config.agent.instructions {
                    return;
                }
                self.config.agent.instructions = instructions;
                self.refresh_settings();
                let combined =
                    combine_instructions(&self.config.agent.prompt, &self.config.agent.instructions);
                self.transport.send(&ClientMessage::UpdateInstructions {
                    instructions: combined,
                });
            }
            AgentCommand::UpdateVoice(voice) => {
                if voice == self.config.agent.speak_model {
                    return;
                }
                self.config.agent.speak_model = voice.clone();
                self.refresh_settings();
                self.transport.send(&ClientMessage::UpdateSpeak { model: voice });
            }
            AgentCommand::Shutdown => {}
        }
    }

    /// Make future handshakes carry the current agent configuration.
    fn refresh_settings(&mut self) {
        self.transport
            .set_settings(ClientMessage::settings(&self.config.audio, &self.config.agent));
    }
}

fn placeholder_snapshot() -> AgentSnapshot {
    AgentSnapshot {
        status: VoiceStatus::None,
        transport: TransportSnapshot {
            state: SocketState::Disconnected,
            state_code: -1,
            reconnect_attempts: 0,
            rate_limited: false,
        },
        microphone: MicrophoneState::NotSetUp,
        microphone_unavailable: false,
        waiting_for_user_voice: false,
        inactivity_secs: 0,
        input_level: 0.0,
        output_level: 0.0,
        queued_audio_secs: 0.0,
        instructions: String::new(),
        voice: String::new(),
    }
}
