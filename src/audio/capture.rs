//! # Capture Pipeline
//!
//! Owns the microphone: acquires the device, re-blocks its audio into fixed
//! size blocks, and turns each block into wire-format PCM when the session is
//! allowed to send.
//!
//! ## Lifecycle:
//! ```text
//! NotSetUp --setup--> SettingUp --acquired--> Ready --start--> Open
//!     ^                   |                     |                |
//!     |                   +--failed--> Error    +------stop------+
//!     +------------------------------------------------------ TearingDown
//! ```
//! `SettingUp` and `TearingDown` are the in-progress states: a second setup
//! while one is in flight is rejected structurally instead of via flags.
//!
//! ## Device seam:
//! Devices implement `MicrophoneSource` (acquire) and `MicrophoneStream`
//! (connect/disconnect). Acquisition may block on a permission prompt, so the
//! session loop runs it off-thread and reports the result back as an event.

use crate::audio::analyser::AnalyserTap;
use crate::audio::codec::{downsample, encode_for_transport};
use crate::error::{AppError, AppResult};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One fixed-size block of mono samples from the microphone.
#[derive(Debug, Clone)]
pub struct CapturedBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Acquires a microphone. Implementations may block.
pub trait MicrophoneSource: Send + Sync {
    /// Acquire the device and build the capture graph.
    ///
    /// Blocks of exactly `block_size` samples are sent to `blocks` once the
    /// returned stream is connected.
    fn acquire(
        &self,
        block_size: usize,
        blocks: mpsc::UnboundedSender<CapturedBlock>,
    ) -> AppResult<Box<dyn MicrophoneStream>>;

    fn describe(&self) -> String;
}

/// An acquired capture graph.
pub trait MicrophoneStream: Send {
    /// Native sample rate of the blocks this stream produces.
    fn sample_rate(&self) -> u32;

    /// Start flowing audio (source → processor → sink).
    fn connect(&mut self) -> AppResult<()>;

    /// Disconnect all nodes and release the device. Must be idempotent.
    fn disconnect(&mut self);
}

/// Splits arbitrarily sized device callbacks into fixed-size blocks.
#[derive(Debug)]
pub struct BlockAccumulator {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAccumulator {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            pending: Vec::with_capacity(block_size.max(1)),
        }
    }

    /// Append samples, returning every block that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut blocks = Vec::new();
        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            blocks.push(std::mem::replace(&mut self.pending, rest));
        }
        blocks
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Microphone lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MicrophoneState {
    NotSetUp,
    SettingUp,
    Ready,
    Open,
    TearingDown,
    Error,
}

/// Result of asking the pipeline to set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupRequest {
    /// Caller should run the acquisition now.
    Proceed,
    /// An acquisition is already in flight; this call collapsed into it.
    AlreadyInProgress,
}

pub struct CapturePipeline {
    state: MicrophoneState,
    stream: Option<Box<dyn MicrophoneStream>>,
    transport_sample_rate: u32,
    analyser: AnalyserTap,
}

impl CapturePipeline {
    pub fn new(transport_sample_rate: u32, analyser: AnalyserTap) -> Self {
        Self {
            state: MicrophoneState::NotSetUp,
            stream: None,
            transport_sample_rate,
            analyser,
        }
    }

    pub fn state(&self) -> MicrophoneState {
        self.state
    }

    pub fn analyser(&self) -> &AnalyserTap {
        &self.analyser
    }

    /// Enter `SettingUp`, releasing any existing graph first.
    pub fn begin_setup(&mut self) -> SetupRequest {
        if self.state == MicrophoneState::SettingUp {
            debug!("microphone setup already in progress");
            return SetupRequest::AlreadyInProgress;
        }
        if self.stream.is_some() {
            self.teardown();
        }
        self.state = MicrophoneState::SettingUp;
        SetupRequest::Proceed
    }

    /// Record the outcome of an acquisition started by `begin_setup`.
    pub fn complete_setup(
        &mut self,
        result: AppResult<Box<dyn MicrophoneStream>>,
    ) -> AppResult<()> {
        match result {
            Ok(mut stream) => {
                if self.state != MicrophoneState::SettingUp {
                    // torn down while acquiring
                    stream.disconnect();
                    return Ok(());
                }
                info!(sample_rate = stream.sample_rate(), "microphone ready");
                self.stream = Some(stream);
                self.state = MicrophoneState::Ready;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "microphone setup failed");
                self.release();
                self.state = MicrophoneState::Error;
                Err(err)
            }
        }
    }

    /// Start the audio flowing. Missing components are a warning, not fatal.
    pub fn start(&mut self) {
        if self.state != MicrophoneState::Ready {
            warn!(state = ?self.state, "cannot start microphone: missing required components");
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            warn!("cannot start microphone: missing required components");
            return;
        };
        match stream.connect() {
            Ok(()) => {
                info!("microphone started");
                self.state = MicrophoneState::Open;
            }
            Err(err) => warn!(error = %err, "error starting microphone"),
        }
    }

    /// Disconnect every node and release the device. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        match self.state {
            MicrophoneState::TearingDown => return,
            MicrophoneState::NotSetUp if self.stream.is_none() => return,
            _ => {}
        }
        self.state = MicrophoneState::TearingDown;
        self.release();
        self.analyser.reset();
        self.state = MicrophoneState::NotSetUp;
        info!("microphone stopped");
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.disconnect();
        }
    }

    /// Per-block callback.
    ///
    /// Returns the wire bytes to send when `may_send` (socket connected and
    /// not sleeping) holds; otherwise the block is dropped. Audio is never
    /// queued: stale speech is useless to the remote agent.
    pub fn process_block(&self, block: &CapturedBlock, may_send: bool) -> Option<Vec<u8>> {
        self.analyser.observe(&block.samples);
        if !may_send || self.state != MicrophoneState::Open {
            return None;
        }
        let resampled = downsample(&block.samples, block.sample_rate, self.transport_sample_rate);
        if resampled.is_empty() {
            return None;
        }
        Some(encode_for_transport(&resampled))
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("state", &self.state)
            .field("has_stream", &self.stream.is_some())
            .field("transport_sample_rate", &self.transport_sample_rate)
            .finish()
    }
}

/// Convenience for sources that cannot be acquired at all.
pub fn unavailable(reason: &str) -> AppError {
    AppError::Device(format!("microphone unavailable: {}", reason))
}
