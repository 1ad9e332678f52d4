//! The latest-value conversation context read when events are sent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

/// Name used when the participant has not told us theirs.
pub const DEFAULT_PARTICIPANT_NAME: &str = "the player";

/// The side the participant plays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    White,
    Black,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::White => f.write_str("White"),
            Side::Black => f.write_str("Black"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "white" | "w" => Ok(Side::White),
            "black" | "b" => Ok(Side::Black),
            other => Err(format!("'{other}' is not a side (expected white or black)")),
        }
    }
}

/// An immutable copy of the context at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// The position as FEN, as reported by the game engine.
    pub position: String,
    pub side: Side,
    pub participant_name: String,
}

impl ContextSnapshot {
    pub fn new(position: impl Into<String>, side: Side, participant_name: impl Into<String>) -> Self {
        let participant_name = participant_name.into();
        let participant_name = if participant_name.trim().is_empty() {
            DEFAULT_PARTICIPANT_NAME.to_string()
        } else {
            participant_name.trim().to_string()
        };
        Self {
            position: position.into(),
            side,
            participant_name,
        }
    }
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self::new(String::new(), Side::White, DEFAULT_PARTICIPANT_NAME)
    }
}

/// A single shared record, overwritten wholesale on every update.
///
/// There is no history and no queue: readers always see the most recent
/// write. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    current: Arc<RwLock<ContextSnapshot>>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, position: impl Into<String>, side: Side, participant_name: impl Into<String>) {
        let snapshot = ContextSnapshot::new(position, side, participant_name);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
