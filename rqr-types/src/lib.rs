//! # reverseqr-types
//!
//! Wire format types for the ReverseQR pairing relay.
//!
//! - [`SessionCode`], [`AuthToken`], [`Role`], [`MessageId`] - Identity and ordering types
//! - [`ClientFrame`], [`ServerFrame`] - WebSocket signaling frames
//! - REST bodies for session, message and config endpoints
//! - [`TypesError`] - Parse errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod api;
mod error;
mod ids;
mod messages;

pub use api::{
    ClientConfig, CreateSessionRequest, CreateSessionResponse, ErrorBody, FileEntry,
    FilesPayload, JoinSessionRequest, JoinSessionResponse, MessageKind, MessagePayload,
    ReceiverKeyRequest, RetrieveMessagesResponse, SendMessageResponse, SendTextRequest,
    SessionStatus, SessionStatusResponse, StoredMessage, TextPayload,
};
pub use error::TypesError;
pub use ids::{AuthToken, MessageId, Role, SessionCode, MAX_CODE_LEN};
pub use messages::{ClientFrame, ServerFrame};
