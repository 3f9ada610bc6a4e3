//! Line protocol spoken with the controlling process.
//!
//! Both directions carry one JSON object per newline-terminated, UTF-8 line.
//! Inbound lines are [`Command`]s, outbound lines are [`Event`]s. The session
//! index is the only correlation key that crosses the process boundary.

use serde::{Deserialize, Serialize};

/// Index carried by error events about lines that never became a session
/// (malformed JSON, empty fields, unusable URLs). Real sessions count up
/// from zero, so the controller can always tell the two apart.
pub const VALIDATION_INDEX: i64 = -1;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Command {
    /// `{"url": "...", "path": "..."}` — start a new download.
    Download { url: String, path: String },
    /// `{"cancel": <index>}` — abort the session with that index.
    Cancel { cancel: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Completed,
    Error,
    Cancelled,
}

/// One outbound message. A session emits any number of `Progress` events
/// followed by exactly one `Terminal`, after which its index falls silent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Event {
    Terminal {
        index: i64,
        progress: u8,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Progress {
        index: i64,
        progress: u8,
    },
}

impl Event {
    pub fn progress(index: i64, progress: u8) -> Self {
        Event::Progress { index, progress }
    }

    pub fn completed(index: i64) -> Self {
        Event::Terminal { index, progress: 100, status: Status::Completed, error: None }
    }

    pub fn failed(index: i64, error: impl Into<String>) -> Self {
        Event::Terminal { index, progress: 0, status: Status::Error, error: Some(error.into()) }
    }

    pub fn cancelled(index: i64) -> Self {
        Event::Terminal { index, progress: 0, status: Status::Cancelled, error: None }
    }

    /// Terminal error for a request that was rejected before it got a session.
    pub fn rejected(error: impl Into<String>) -> Self {
        Event::failed(VALIDATION_INDEX, error)
    }

    pub fn index(&self) -> i64 {
        match self {
            Event::Terminal { index, .. } | Event::Progress { index, .. } => *index,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Terminal { .. })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

pub fn decode_command(line: &str) -> serde_json::Result<Command> {
    serde_json::from_str(line)
}
