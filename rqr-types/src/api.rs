//! REST request and response bodies.
//!
//! Every payload field (ciphertext, IVs, hashes, encrypted file names, public
//! keys) is an opaque string the relay stores and returns untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{AuthToken, MessageId, SessionCode, TypesError};

/// `POST /api/session/create`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Receiver public key, if already generated
    #[serde(default, alias = "initiatorDhPublicKey")]
    pub initiator_public_key: Option<String>,
}

/// Response to session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    /// Pairing code to display
    pub code: SessionCode,
    /// Token for the receiver's WebSocket subscription
    pub receiver_token: AuthToken,
    /// Same as `receiver_token`, under the name older clients read
    pub ws_token: AuthToken,
    /// Public base URL of the relay
    pub base_url: String,
    /// URL a QR image for this session encodes
    pub join_url: String,
    /// Session expiry, milliseconds since the Unix epoch
    pub expires_at: u64,
}

/// `POST /api/session/join`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    /// Code read from the receiver
    pub code: SessionCode,
    /// Sender public key
    #[serde(default, alias = "responderDhPublicKey")]
    pub responder_public_key: Option<String>,
}

/// Response to a successful join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    /// Always true
    pub success: bool,
    /// Normalized code
    pub code: SessionCode,
    /// Receiver public key, if the receiver supplied one
    pub initiator_public_key: Option<String>,
    /// Sender public key as stored
    pub responder_public_key: Option<String>,
    /// Token for the sender's WebSocket subscription
    pub sender_token: AuthToken,
    /// Same as `sender_token`, under the name older clients read
    pub ws_token: AuthToken,
}

/// `POST /api/session/key`: receiver supplies its key after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverKeyRequest {
    /// Session code
    pub code: SessionCode,
    /// Receiver token from session creation
    pub token: AuthToken,
    /// Receiver public key
    #[serde(alias = "initiatorDhPublicKey")]
    pub initiator_public_key: String,
}

/// Pairing progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No sender key yet
    Waiting,
    /// Both sides can derive the shared key
    Established,
}

/// `GET /api/session/status/:code`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    /// Pairing progress
    pub status: SessionStatus,
    /// Receiver public key
    pub initiator_public_key: Option<String>,
    /// Sender public key
    pub responder_public_key: Option<String>,
    /// Session expiry, milliseconds since the Unix epoch
    pub expires_at: u64,
}

/// Kind of a mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Encrypted text
    Text,
    /// One or more uploaded blobs
    Files,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Files => "files",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "files" => Ok(Self::Files),
            other => Err(TypesError::InvalidMessageType(other.to_string())),
        }
    }
}

/// Text fields of `POST /api/message/send` when sent as JSON or a plain form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTextRequest {
    /// Session code
    #[serde(default)]
    pub code: String,
    /// `text` or `files`; defaults to `text`
    #[serde(default)]
    pub message_type: Option<String>,
    /// Encrypted text
    #[serde(default)]
    pub ciphertext: String,
    /// Encryption IV
    #[serde(default)]
    pub iv: String,
    /// Authentication tag, when not appended to the ciphertext
    #[serde(default)]
    pub auth_tag: String,
    /// Integrity hash computed by the client
    #[serde(default)]
    pub hash: String,
    /// Legacy plaintext field
    #[serde(default)]
    pub text: Option<String>,
}

/// Encrypted text message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPayload {
    /// Encrypted text
    pub ciphertext: String,
    /// Encryption IV
    pub iv: String,
    /// Authentication tag
    #[serde(default)]
    pub auth_tag: String,
    /// Integrity hash
    #[serde(default)]
    pub hash: String,
    /// Legacy plaintext field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One uploaded file inside a `files` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Generated blob name, used for download
    pub filename: String,
    /// Stored size in bytes
    pub size: u64,
    /// File encryption IV
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// Encrypted original file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_name: Option<String>,
    /// IV for the encrypted name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_iv: Option<String>,
}

/// Files message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesPayload {
    /// Uploaded files in upload order
    pub files: Vec<FileEntry>,
    /// Integrity hash
    #[serde(default)]
    pub hash: String,
}

/// Message body as stored in a session mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePayload {
    /// Encrypted text
    Text(TextPayload),
    /// Uploaded blobs
    Files(FilesPayload),
}

impl MessagePayload {
    /// The kind of this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Files(_) => MessageKind::Files,
        }
    }
}

/// A mailbox entry as returned by retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Ordering key within the session
    pub message_id: MessageId,
    /// Store time, milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Message body
    #[serde(flatten)]
    pub payload: MessagePayload,
}

/// Response to `POST /api/message/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    /// Always true
    pub success: bool,
    /// Id assigned to the stored message
    pub message_id: MessageId,
}

/// Response to `GET /api/message/retrieve/:code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveMessagesResponse {
    /// Full mailbox in insertion order
    pub messages: Vec<StoredMessage>,
}

/// `GET /api/config`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Largest accepted upload in bytes
    pub max_file_size: u64,
    /// `max_file_size` for display
    pub max_file_size_formatted: String,
}

/// Body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human readable reason
    pub error: String,
}
