/// Errors raised by the wire codecs and the upgrade handshake.
///
/// Every variant is fatal to the connection it occurred on and to nothing
/// else.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    // Event frames
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    // WebSocket frames
    #[error("fragmented frames are not supported")]
    Fragmented,
    #[error("unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("payload of {len} bytes exceeds {limit}")]
    PayloadTooLarge { len: u64, limit: usize },
    #[error("close payload must be empty or at least 2 bytes")]
    BadClosePayload,
    #[error("connection closed")]
    ConnectionClosed,

    // Handshake
    #[error("handshake: {0}")]
    Handshake(String),
}

impl ProtocolError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::LineTooLong { .. } | Self::InvalidUtf8(_) => "event_syntax",
            Self::Fragmented
            | Self::UnsupportedOpcode(_)
            | Self::PayloadTooLarge { .. }
            | Self::BadClosePayload => "frame_syntax",
            Self::ConnectionClosed => "closed",
            Self::Handshake(_) => "handshake",
        }
    }
}
