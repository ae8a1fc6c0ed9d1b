//! # reverseqr-relay
//!
//! Pairing and signaling relay for ReverseQR end-to-end encrypted transfers.
//!
//! A receiver creates a short-lived session and shows its code as a QR image.
//! A sender joins with the code, both sides exchange public keys through the
//! relay, and the sender posts encrypted text or files into the session
//! mailbox. The relay:
//! - Allocates codes and issues per-role tokens
//! - Lets exactly one sender hold a session at a time
//! - Pushes hints over WebSocket when keys or messages arrive
//! - Stores uploaded ciphertext on disk and sweeps it after a retention window
//! - Never sees plaintext or key material it could use
//!
//! ## Architecture
//!
//! ```text
//! Receiver ──┐                          ┌── Sender
//!            │   HTTP + WebSocket       │
//!        ┌───┴──────────────────────────┴───┐
//!        │         reverseqr-relay          │
//!        │  SessionStore   SignalingHub     │
//!        │  ┌────────────────────────────┐  │
//!        │  │   BlobStore (upload dir)   │  │
//!        │  └────────────────────────────┘  │
//!        └──────────────────────────────────┘
//! ```
//!
//! ## Signaling
//!
//! Clients send `subscribe` with code, role and token, then receive
//! `sender-key-available`, `receiver-key-available` and `message-available`
//! hints. Contents are always fetched over HTTP.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod server;
pub mod session;
pub mod signaling;
pub mod storage;

pub use config::Config;
pub use server::{serve, Relay};
