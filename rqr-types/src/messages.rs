//! WebSocket signaling frames.
//!
//! Frames are JSON text messages tagged by a `type` field. The relay only
//! ever sends hints over this channel; message contents are always pulled
//! over HTTP.

use serde::{Deserialize, Serialize};

use crate::{AuthToken, MessageId, MessageKind, Role, SessionCode, TypesError};

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Attach this connection to one role of one session
    Subscribe {
        /// Session code
        code: SessionCode,
        /// Role the client claims
        role: Role,
        /// Token issued to that role by create/join
        token: AuthToken,
    },
    /// Application level keepalive
    Ping,
    /// Any other `type`; ignored by the relay
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Decode a frame from a WebSocket text message.
    pub fn from_text(text: &str) -> Result<Self, TypesError> {
        serde_json::from_str(text).map_err(|e| TypesError::InvalidFrame(e.to_string()))
    }

    /// Encode to JSON text.
    pub fn to_text(&self) -> Result<String, TypesError> {
        serde_json::to_string(self).map_err(|e| TypesError::InvalidFrame(e.to_string()))
    }
}

/// Frames the relay sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Subscription accepted
    Subscribed {
        /// Session code
        code: SessionCode,
        /// Role bound to the connection
        role: Role,
    },
    /// A request on this connection failed; the connection stays open
    Error {
        /// Human readable reason
        message: String,
    },
    /// The sender's public key is available (sent to receivers)
    #[serde(rename_all = "camelCase")]
    SenderKeyAvailable {
        /// Opaque sender public key
        responder_public_key: String,
    },
    /// The receiver's public key is available (sent to senders)
    #[serde(rename_all = "camelCase")]
    ReceiverKeyAvailable {
        /// Opaque receiver public key
        initiator_public_key: String,
    },
    /// The mailbox holds messages; fetch them over HTTP
    #[serde(rename_all = "camelCase")]
    MessageAvailable {
        /// Number of messages in the mailbox
        count: usize,
        /// Id of the newest message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        /// Kind of the newest message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_type: Option<MessageKind>,
    },
    /// Reply to a client `ping`
    Pong,
}

impl ServerFrame {
    /// Build an `error` frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Encode to JSON text.
    pub fn to_text(&self) -> Result<String, TypesError> {
        serde_json::to_string(self).map_err(|e| TypesError::InvalidFrame(e.to_string()))
    }

    /// Decode from JSON text.
    pub fn from_text(text: &str) -> Result<Self, TypesError> {
        serde_json::from_str(text).map_err(|e| TypesError::InvalidFrame(e.to_string()))
    }
}
