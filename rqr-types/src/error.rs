//! Error types for ReverseQR wire types.

use thiserror::Error;

/// Errors raised while parsing wire values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// Session code is empty, too long or malformed
    #[error("invalid session code: {0}")]
    InvalidCode(String),

    /// Role is neither `receiver` nor `sender`
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// Message type is neither `text` nor `files`
    #[error("invalid message type: {0}")]
    InvalidMessageType(String),

    /// Frame could not be encoded or decoded
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}
