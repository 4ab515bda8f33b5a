//! Conversation state: the status machine and the logs it writes to.

pub mod log;
pub mod status;

pub use log::{BehindTheScenesEvent, ConversationLog, EntryKind, LatencyRecord, LogEntry};
pub use status::{StatusMachine, VoiceStatus};
