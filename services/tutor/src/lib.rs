//! The spoken chess tutor: a realtime voice session over the Gemini Live
//! API, with local microphone capture and gapless speaker playback.

pub mod audio;
pub mod config;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{ConnectError, ConnectionStatus, Session, SessionConfig, SessionState};
