// src/pubkey_resolver.rs
// Resolves a user id to the long-term public key needed to verify an
// inbound signature (§4.7 step 5). The wire protocol never carries the
// signer's public key directly, so the client needs this out-of-band
// lookup — backed here by a simple in-memory registry that callers
// populate from contact lists, group rosters, or a directory service.

use std::collections::HashMap;
use std::sync::Mutex;

use secp256k1::PublicKey;

use crate::ids::UserId;

pub trait PublicKeyResolver: Send + Sync {
    fn get_public_key(&self, user_id: &UserId) -> Option<PublicKey>;
    fn register_public_key(&self, user_id: UserId, public_key: PublicKey);
}

#[derive(Default)]
pub struct InMemoryPublicKeyResolver {
    keys: Mutex<HashMap<UserId, PublicKey>>,
}

impl InMemoryPublicKeyResolver {
    pub fn new() -> Self {
        InMemoryPublicKeyResolver { keys: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, PublicKey>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PublicKeyResolver for InMemoryPublicKeyResolver {
    fn get_public_key(&self, user_id: &UserId) -> Option<PublicKey> {
        self.lock().get(user_id).copied()
    }

    fn register_public_key(&self, user_id: UserId, public_key: PublicKey) {
        self.lock().insert(user_id, public_key);
    }
}
