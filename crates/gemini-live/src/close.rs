//! Classification of WebSocket close codes.

/// What a close code means for the session that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Reconnecting would fail the same way; the session must be recreated.
    Fatal,
    /// The caller may retry within its reconnect budget.
    Transient,
}

/// 1005: close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// 1006: connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Classifies a close code. `None` means the frame carried no code.
///
/// Fatal codes: protocol error (1002), unsupported data (1003), invalid
/// payload (1007), policy violation (1008), message too big (1009), missing
/// extension (1010), internal error (1011), TLS failure (1015) and the
/// application range 4000-4999. Everything else is transient.
pub fn classify_close(code: Option<u16>) -> CloseKind {
    match code {
        Some(1002 | 1003 | 1007 | 1008 | 1009 | 1010 | 1011 | 1015) => CloseKind::Fatal,
        Some(4000..=4999) => CloseKind::Fatal,
        _ => CloseKind::Transient,
    }
}
