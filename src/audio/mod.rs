//! # Audio Module
//!
//! Local audio for the voice agent: the microphone capture pipeline, the
//! agent-audio playback scheduler, and the codec between them and the wire.
//!
//! ## Key Components:
//! - **Codec**: block-average downsampling, float → PCM16 encoding, PCM16 → playable buffers
//! - **Capture Pipeline**: microphone lifecycle state machine and per-block processing
//! - **Playback Pipeline**: contiguous scheduling of agent audio with hard flush
//! - **Analysers**: level meters on both graphs, observational only
//! - **Devices**: WAV-file and (optionally) system audio adapters
//!
//! ## Audio Format Requirements:
//! - **Outbound**: 16kHz, 16-bit PCM, mono, little-endian
//! - **Inbound**: 24kHz, 16-bit PCM, mono, little-endian

pub mod analyser;
pub mod capture;
pub mod codec;
pub mod devices;
pub mod playback;
