//! Append-only conversation records.
//!
//! Two ordered logs: the conversation log (utterances and latency records,
//! interleaved in arrival order) and the behind-the-scenes log of protocol
//! events. Neither offers a way to remove or edit an entry.

use crate::protocol::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One speaker turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Timing of one assistant turn, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyRecord {
    pub tts_latency: f64,
    pub ttt_latency: f64,
    pub total_latency: Option<f64>,
    pub at: DateTime<Utc>,
}

impl LatencyRecord {
    /// Partial measurements produce no record.
    pub fn from_fields(
        tts_latency: Option<f64>,
        ttt_latency: Option<f64>,
        total_latency: Option<f64>,
    ) -> Option<Self> {
        Some(Self {
            tts_latency: tts_latency?,
            ttt_latency: ttt_latency?,
            total_latency,
            at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Utterance(Utterance),
    Latency(LatencyRecord),
}

/// Filter for reading the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Utterance,
    Latency,
}

impl LogEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            LogEntry::Utterance(_) => EntryKind::Utterance,
            LogEntry::Latency(_) => EntryKind::Latency,
        }
    }
}

/// Protocol events worth showing next to the transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum BehindTheScenesEvent {
    SettingsApplied,
    UserStartedSpeaking,
    /// The user started speaking while the agent was speaking
    Interruption,
    AgentStartedSpeaking,
    ConversationText { role: Role, content: String },
    EndOfThought,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent {
    #[serde(flatten)]
    pub event: BehindTheScenesEvent,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConversationLog {
    entries: Vec<LogEntry>,
    events: Vec<RecordedEvent>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_utterance(&mut self, role: Role, content: impl Into<String>) {
        self.entries.push(LogEntry::Utterance(Utterance {
            role,
            content: content.into(),
            at: Utc::now(),
        }));
    }

    pub fn push_latency(&mut self, record: LatencyRecord) {
        self.entries.push(LogEntry::Latency(record));
    }

    pub fn push_event(&mut self, event: BehindTheScenesEvent) {
        self.events.push(RecordedEvent {
            event,
            at: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EntryKind) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_requires_both_measurements() {
        assert!(LatencyRecord::from_fields(Some(0.2), None, Some(0.7)).is_none());
        assert!(LatencyRecord::from_fields(None, Some(0.5), None).is_none());
        let record = LatencyRecord::from_fields(Some(0.2), Some(0.5), None).unwrap();
        assert_eq!(record.total_latency, None);
    }

    #[test]
    fn test_entries_keep_arrival_order() {
        let mut log = ConversationLog::new();
        log.push_utterance(Role::User, "hello");
        log.push_latency(LatencyRecord::from_fields(Some(0.1), Some(0.2), Some(0.3)).unwrap());
        log.push_utterance(Role::Assistant, "hi there");

        let kinds: Vec<EntryKind> = log.entries().iter().map(LogEntry::kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Utterance, EntryKind::Latency, EntryKind::Utterance]
        );
        assert_eq!(log.entries_of(EntryKind::Latency).len(), 1);
        assert_eq!(log.entries_of(EntryKind::Utterance).len(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let mut log = ConversationLog::new();
        log.push_event(BehindTheScenesEvent::ConversationText {
            role: Role::Assistant,
            content: "ok".to_string(),
        });
        let json = serde_json::to_value(&log.events()[0]).unwrap();
        assert_eq!(json["type"], "ConversationText");
        assert_eq!(json["role"], "assistant");
        assert!(json["at"].is_string());

        let entry = serde_json::to_value(LogEntry::Utterance(Utterance {
            role: Role::User,
            content: "x".to_string(),
            at: Utc::now(),
        }))
        .unwrap();
        assert_eq!(entry["kind"], "utterance");
    }
}
