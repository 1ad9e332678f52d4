//! The voice session: one Live connection plus the audio engines around it.

mod controller;
mod state;

pub use controller::{ConnectError, Session, SessionConfig};
pub use state::{ConnectionStatus, SessionState};
