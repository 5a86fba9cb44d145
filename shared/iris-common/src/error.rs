//! Protocol Errors

use thiserror::Error;

/// Errors arising from the worker wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame type is not valid in the current connection state.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    /// Stream sequence number went backwards for a subtask attempt.
    #[error("Out-of-sequence frame: got {got}, expected at least {expected}")]
    OutOfSequence { got: u64, expected: u64 },

    /// Handshake did not arrive in time.
    #[error("Handshake timed out")]
    HandshakeTimeout,
}
