use mavlink::error::ParserError;
use thiserror::Error;

/// Wire-level framing failures. A framing error invalidates at most one
/// frame; the dispatch loop counts it and keeps reading.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("no frame magic found in {0} bytes")]
    NoMagic(usize),
    #[error("truncated frame: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },
    #[error("checksum mismatch for message id {message_id}")]
    BadCrc { message_id: u32 },
    #[error("unsupported incompatibility flags {flags:#04x}")]
    UnsupportedFlags { flags: u8 },
}

/// Errors raised while turning a byte buffer into a decoded frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("payload of message id {message_id} failed to decode: {source}")]
    Payload {
        message_id: u32,
        source: ParserError,
    },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced synchronously to a command caller. Everything else
/// about a command (ACK, rejection) arrives as a `VehicleEvent`.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] mavlink::error::MessageWriteError),
    #[error("transport write failed: {0}")]
    Transport(#[from] LinkError),
}
