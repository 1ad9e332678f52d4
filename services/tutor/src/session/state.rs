//! The observable state of a voice session.

use serde::Serialize;
use std::fmt;

/// Lifecycle of the Live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Active,
    /// Ended in a way that may be retried.
    Closed,
    /// Ended in a way that must not be retried within this session.
    Fatal,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Snapshot published to observers on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    /// Microphone capture is running.
    pub listening: bool,
    /// Tutor audio has been scheduled for the current turn.
    pub speaking: bool,
    /// Text of the current (or most recent) tutor turn.
    pub last_transcript: String,
    /// Why the last attempt or connection ended. Cleared when an attempt
    /// starts and when it succeeds; a local disconnect leaves it unset.
    pub last_error: Option<String>,
    #[serde(skip)]
    transcript_closed: bool,
}

/// Outcome of asking whether a connect attempt may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Proceed(u32),
    AlreadyActive,
    Busy,
    Fatal,
    Exhausted(u32),
}

impl SessionState {
    pub fn connected(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    pub fn connecting(&self) -> bool {
        self.status == ConnectionStatus::Connecting
    }

    pub fn fatal(&self) -> bool {
        self.status == ConnectionStatus::Fatal
    }

    /// Closed by the server or the network rather than by a local
    /// `disconnect()`, and still retryable.
    pub fn closed_remotely(&self) -> bool {
        self.status == ConnectionStatus::Closed && self.last_error.is_some()
    }

    pub(crate) fn mark_fatal(&mut self, message: impl Into<String>) {
        self.status = ConnectionStatus::Fatal;
        self.last_error = Some(message.into());
    }

    /// Moves to Closed unless the session is already Fatal.
    pub(crate) fn mark_closed(&mut self, message: Option<String>) {
        if self.status != ConnectionStatus::Fatal {
            self.status = ConnectionStatus::Closed;
        }
        if message.is_some() {
            self.last_error = message;
        }
    }

    /// Adds text to the tutor's current turn; the first text after a
    /// completed turn replaces the previous transcript.
    pub(crate) fn append_transcript(&mut self, text: &str) {
        if self.transcript_closed {
            self.last_transcript.clear();
            self.transcript_closed = false;
        }
        self.last_transcript.push_str(text);
    }

    pub(crate) fn close_turn(&mut self) {
        self.transcript_closed = true;
        self.speaking = false;
    }

    pub(crate) fn reset_flags(&mut self) {
        self.listening = false;
        self.speaking = false;
    }

    /// Decides whether a connect call may open a transport, counting the
    /// attempt when it may. Crossing `max_attempts` turns the session Fatal.
    pub(crate) fn begin_attempt(&mut self, max_attempts: u32) -> Gate {
        match self.status {
            ConnectionStatus::Active => return Gate::AlreadyActive,
            ConnectionStatus::Connecting => return Gate::Busy,
            ConnectionStatus::Fatal => return Gate::Fatal,
            ConnectionStatus::Idle | ConnectionStatus::Closed => {}
        }
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > max_attempts {
            self.mark_fatal(format!(
                "Gave up after {max_attempts} failed connection attempts"
            ));
            return Gate::Exhausted(max_attempts);
        }
        self.status = ConnectionStatus::Connecting;
        self.last_error = None;
        Gate::Proceed(self.reconnect_attempts)
    }
}
