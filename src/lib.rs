// src/lib.rs
// Core engine for a decentralized, end-to-end encrypted chat protocol
// built on a pub/sub overlay transport. This crate has no UI: it exposes
// the identity, conversation, and message pipeline types that an
// application shell (desktop, mobile, CLI) wires up to a concrete
// transport and persistence backend.

pub mod client;
pub mod config;
pub mod conversation;
pub mod crypto;
pub mod dedupe;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod ids;
pub mod persistence;
pub mod pubkey_resolver;
pub mod transport;
pub mod wire;

pub use client::{ChatClient, ControlPayload, IncomingEvent};
pub use config::ChatClientConfig;
pub use conversation::{Conversation, ConversationType, GroupInvite, RevokeRule};
pub use error::{ChatError, Result};
pub use identity::Identity;
pub use ids::{ConversationId, MessageId, UserId};
pub use persistence::{MemoryStore, Store};
pub use pubkey_resolver::{InMemoryPublicKeyResolver, PublicKeyResolver};
pub use transport::{ConnectionState, Transport};
