// src/ids.rs
// Validating newtype wrappers around the hex identifier strings threaded
// through the rest of the crate, following the pack's convention of
// wrapping raw key/id bytes instead of passing bare `String`s at API
// boundaries (see the secure-channel crypto crate's `PublicKeyBytes`).

use std::fmt;

use crate::error::ChatError;

fn is_lowercase_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

macro_rules! hex_id {
    ($name:ident, $len:expr, $err:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Parse and validate a lowercase-hex identifier of the exact expected length.
            pub fn parse(s: impl Into<String>) -> Result<Self, ChatError> {
                let s = s.into();
                if s.len() != $len || !is_lowercase_hex(&s) {
                    return Err(ChatError::$err(s));
                }
                Ok(Self(s))
            }

            /// Wrap an already-validated string without re-checking (internal use only).
            pub(crate) fn from_validated(s: String) -> Self {
                debug_assert!(s.len() == $len && is_lowercase_hex(&s));
                Self(s)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

hex_id!(UserId, 40, InvalidUserId);
// ConversationId is variable-width (32 hex for direct, 44 hex for group) so
// it gets a looser constructor below instead of the fixed-length macro.
hex_id!(MessageId, 64, InvalidMessageId);

/// `id` is 32 hex chars for direct conversations, 44 hex chars for group
/// conversations (§3: `timestamp_ms_as_12_hex || random16Bytes`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn parse(s: impl Into<String>) -> Result<Self, ChatError> {
        let s = s.into();
        if (s.len() != 32 && s.len() != 44) || !is_lowercase_hex(&s) {
            return Err(ChatError::InvalidConversationId(s));
        }
        Ok(Self(s))
    }

    pub(crate) fn from_validated(s: String) -> Self {
        debug_assert!((s.len() == 32 || s.len() == 44) && is_lowercase_hex(&s));
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
