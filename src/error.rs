// src/error.rs
// Crate-wide error taxonomy. Every operation exposed by C1-C7 returns
// `Result<_, ChatError>`; the receive pipeline in `client.rs` logs and
// swallows variants that represent malformed or unverifiable inbound
// traffic instead of propagating them to the subscription callback site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("AEAD authentication failed")]
    AeadAuth,

    #[error("malformed wire data: {0}")]
    DecodeWire(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("user is not a member of the conversation: {0}")]
    NotMember(String),

    #[error("permission denied for this operation")]
    PermissionDenied,

    #[error("stale key version: expected > {current}, got {attempted}")]
    StaleKeyVersion { current: u32, attempted: u32 },

    #[error("identity mismatch: re-derived key material does not match stored identity")]
    IdentityMismatch,

    #[error("publish failed: no peer accepted the message")]
    Publish,

    #[error("send exhausted after {attempts} attempts: {last_error}")]
    SendExhausted { attempts: u32, last_error: String },

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid content topic: {0}")]
    InvalidTopic(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("invalid message id: {0}")]
    InvalidMessageId(String),

    #[error("invalid conversation id: {0}")]
    InvalidConversationId(String),

    #[error("persistence backend error: {0}")]
    Persistence(String),

    #[error("JSON (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, ChatError>;
