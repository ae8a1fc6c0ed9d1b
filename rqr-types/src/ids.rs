//! Identity types for ReverseQR pairing sessions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

use crate::TypesError;

/// Number of random bytes behind a generated session code.
const CODE_BYTES: usize = 3;

/// Longest code accepted from clients.
pub const MAX_CODE_LEN: usize = 32;

/// Number of random bytes in an auth token.
const TOKEN_BYTES: usize = 32;

/// Short code correlating a receiver and a sender for one pairing.
///
/// Generated codes are 6 uppercase hex characters. Codes supplied by clients
/// are trimmed and uppercased before use, so `"a1b2c3"` and `"A1B2C3"` name
/// the same session.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Create a new random code.
    pub fn random() -> Self {
        let mut bytes = [0u8; CODE_BYTES];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(hex::encode_upper(bytes))
    }

    /// Parse and normalize a client supplied code.
    pub fn parse(raw: &str) -> Result<Self, TypesError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TypesError::InvalidCode("code is required".into()));
        }
        if trimmed.len() > MAX_CODE_LEN {
            return Err(TypesError::InvalidCode(format!(
                "code longer than {MAX_CODE_LEN} characters"
            )));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TypesError::InvalidCode(
                "code contains invalid characters".into(),
            ));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// The normalized code text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionCode {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionCode({})", self.0)
    }
}

/// Bearer token binding a WebSocket subscription to one role of one session.
///
/// 32 random bytes, hex encoded on the wire. Never printed by `Debug`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    /// Create a new random token.
    pub fn random() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(hex::encode(bytes))
    }

    /// Wrap a token received from a client.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The token text, for handing back to the client that owns it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compare two tokens without short-circuiting on the first differing byte.
    pub fn ct_eq(&self, other: &AuthToken) -> bool {
        let a = self.0.as_bytes();
        let b = other.0.as_bytes();
        // ConstantTimeEq on slices already returns false for unequal lengths.
        a.ct_eq(b).into()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

/// Which side of a pairing a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Session initiator; displays the code and receives messages.
    Receiver,
    /// Joins with the code and sends messages.
    Sender,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receiver => "receiver",
            Self::Sender => "sender",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receiver" => Ok(Self::Receiver),
            "sender" => Ok(Self::Sender),
            other => Err(TypesError::InvalidRole(other.to_string())),
        }
    }
}

/// Ordering key of a message within a session mailbox.
///
/// Milliseconds since the Unix epoch, bumped when needed so that ids are
/// strictly increasing within one session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Create a MessageId with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this MessageId.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Smallest id that orders after `self` and is not before `now_ms`.
    pub fn next_after(&self, now_ms: u64) -> Self {
        Self(now_ms.max(self.0.saturating_add(1)))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}
