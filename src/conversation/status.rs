//! # Conversation Status Machine
//!
//! ```text
//! NONE --start_listening--> LISTENING <--> SPEAKING
//!                               ^   \        /
//!                               |    v      v
//!                               +---- SLEEPING
//! ```
//! - `SLEEPING` is reachable from any state except `NONE` and only returns to
//!   `LISTENING`.
//! - The inactivity timer is ticked once per second while listening or
//!   speaking and reset by every transition and qualifying activity. Past the
//!   threshold the machine falls asleep, once.
//! - Agent activity never leaves `NONE` or `SLEEPING`; only bring-up and the
//!   user leave those.
//! - Waking from sleep arms the "waiting for user voice" flag: until the user
//!   actually speaks, assistant activity still in flight is ignored.

use serde::Serialize;
use tracing::info;

/// Exactly one of these holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoiceStatus {
    None,
    Listening,
    Speaking,
    Sleeping,
}

#[derive(Debug, Clone)]
pub struct StatusMachine {
    status: VoiceStatus,
    inactivity_secs: u32,
    sleep_timeout_secs: u32,
    waiting_for_user_voice: bool,
}

impl StatusMachine {
    pub fn new(sleep_timeout_secs: u32) -> Self {
        Self {
            status: VoiceStatus::None,
            inactivity_secs: 0,
            sleep_timeout_secs,
            waiting_for_user_voice: false,
        }
    }

    pub fn status(&self) -> VoiceStatus {
        self.status
    }

    pub fn inactivity_secs(&self) -> u32 {
        self.inactivity_secs
    }

    pub fn is_sleeping(&self) -> bool {
        self.status == VoiceStatus::Sleeping
    }

    pub fn is_waiting_for_user_voice(&self) -> bool {
        self.waiting_for_user_voice
    }

    fn transition(&mut self, to: VoiceStatus) {
        let from = self.status;
        self.status = to;
        self.inactivity_secs = 0;
        if from != to {
            info!(from = ?from, to = ?to, "status transition");
        }
    }

    pub fn start_listening(&mut self) {
        self.transition(VoiceStatus::Listening);
    }

    /// Returns false (and changes nothing) while sleeping or before the
    /// conversation started.
    pub fn start_speaking(&mut self) -> bool {
        if matches!(self.status, VoiceStatus::Sleeping | VoiceStatus::None) {
            return false;
        }
        self.transition(VoiceStatus::Speaking);
        true
    }

    /// The agent finished sending audio. Only an active conversation goes
    /// back to listening; sleep and `NONE` are kept.
    pub fn finish_speaking(&mut self) -> bool {
        if !matches!(self.status, VoiceStatus::Listening | VoiceStatus::Speaking) {
            return false;
        }
        self.start_listening();
        true
    }

    /// Returns false while `NONE`: there is no conversation to put to sleep.
    pub fn start_sleeping(&mut self) -> bool {
        if self.status == VoiceStatus::None {
            return false;
        }
        self.transition(VoiceStatus::Sleeping);
        true
    }

    /// Sleeping wakes to listening; anything else falls asleep.
    pub fn toggle_sleep(&mut self) {
        if self.is_sleeping() {
            self.waiting_for_user_voice = true;
            self.start_listening();
        } else {
            self.start_sleeping();
        }
    }

    /// Qualifying activity without a status change.
    pub fn reset_timer(&mut self) {
        self.inactivity_secs = 0;
    }

    /// The user was actually heard.
    pub fn user_voice_detected(&mut self) {
        self.waiting_for_user_voice = false;
    }

    /// One second passed. Returns true when this tick put the session to sleep.
    pub fn tick(&mut self) -> bool {
        if !matches!(self.status, VoiceStatus::Listening | VoiceStatus::Speaking) {
            return false;
        }
        self.inactivity_secs += 1;
        if self.inactivity_secs > self.sleep_timeout_secs {
            info!(idle_secs = self.inactivity_secs, "inactivity timeout");
            return self.start_sleeping();
        }
        false
    }
}
