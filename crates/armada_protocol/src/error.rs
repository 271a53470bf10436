//! Error types for the protocol layer.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while encoding or decoding protocol data.
///
/// Frame-level variants (`FrameTooLarge`, `VarIntOverflow`) are protocol
/// errors: the connection that produced them must be closed, because the
/// byte stream can no longer be trusted to re-synchronize.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Operation on a buffer whose acquire count already dropped to zero.
    #[error("buffer has been released and is no longer accessible")]
    BufferReleased,

    /// A read requested more bytes than the buffer still holds.
    #[error("buffer underrun: needed {needed} bytes, {available} available")]
    Underrun { needed: usize, available: usize },

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid utf-8 in string payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A variable-length integer ran past its maximum encoded width.
    #[error("variable-length integer overflows 64 bits")]
    VarIntOverflow,

    /// `redo_transaction` was called without a preceding `start_transaction`.
    #[error("no transaction mark to rewind to")]
    NoTransaction,

    /// An encoded frame exceeds the configured size ceiling.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// An unrecognized tag byte in a wire-level discriminant.
    #[error("unknown wire tag {tag} for {context}")]
    UnknownTag { tag: u8, context: &'static str },

    /// Fallback object-mapper (de)serialization failure.
    #[error("object mapper error: {0}")]
    ObjectMapper(#[from] serde_json::Error),

    /// A chunk arrived for a transfer the assembler does not know.
    #[error("chunk for unknown transfer {0}")]
    UnknownTransfer(Uuid),

    /// A chunk arrived out of sequence for an in-progress transfer.
    #[error("transfer {transfer_id} expected chunk {expected}, got {got}")]
    ChunkOutOfSequence {
        transfer_id: Uuid,
        expected: u64,
        got: u64,
    },
}

impl ProtocolError {
    /// Whether this error poisons the surrounding byte stream.
    ///
    /// A poisoned stream cannot be re-synchronized, so the owning channel
    /// must be force-closed rather than skipping the bad input.
    pub fn poisons_stream(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::VarIntOverflow
        )
    }
}
