//! Client-side building blocks for the Gemini Live bidirectional API:
//! the frame codec, PCM16 packing, close-code classification and the
//! WebSocket transport.

pub mod close;
pub mod codec;
pub mod pcm;
pub mod transport;

pub use close::{CloseKind, classify_close};
pub use codec::{
    ContentPart, InboundFrame, SetupConfig, decode_frame, encode_audio_input, encode_setup,
    encode_user_turn,
};
pub use pcm::AudioChunk;
pub use transport::{Connector, FrameSink, FrameStream, Transport, TransportEvent, WsConnector};

/// Live API endpoint, without the `?key=` query.
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}
