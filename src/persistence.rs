// src/persistence.rs
// Storage contract for conversation/identity/message state (§6). A flat
// string-valued key-value contract lets any backend (SQLite, sled, a
// remote KV store) sit behind `Store`, while `MemoryStore` ships as the
// default, dependency-free implementation used by tests and by callers
// with no durability requirement. Per §6, values are strings only — binary
// material (session keys, signatures, ciphertext) is hex-encoded by the
// caller before it ever reaches `set`.
//
// Key schema prescribed by §6, all populated by `ChatClient`:
//   identity:<uid>       password-encrypted identity export JSON
//   conversation:<cid>   `ConversationRecord` JSON
//   message:<cid>:<mid>  `MessageRecord` JSON
//   revoked:<mid>        revoke record JSON (revoker_id, reason, revoked_at)
//   deleted:<mid>        presence marks a message hidden from this client only
//   processed:<mid>      presence marks a message_id as already dispatched

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{ChatError, Result};

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Returns every key with the given prefix, in ascending order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn clear(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// In-memory KV store behind a mutex-guarded sorted map, giving `list` a
/// cheap ordered prefix scan with no extra index.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { data: Mutex::new(BTreeMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON convenience layer over a raw `Store`, for callers that want typed
/// values without hand-rolling serialization at each call site.
pub fn get_json<T: serde::de::DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(text) => {
            let value = serde_json::from_str(&text)
                .map_err(|e| ChatError::Persistence(format!("corrupt record at {key}: {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub fn set_json<T: serde::Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    store.set(key, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete_round_trip() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn list_returns_prefix_matches_only() {
        let store = MemoryStore::new();
        store.set("conv:1", "x").unwrap();
        store.set("conv:2", "x").unwrap();
        store.set("identity:1", "x").unwrap();

        let mut keys = store.list("conv:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["conv:1".to_string(), "conv:2".to_string()]);
    }

    #[test]
    fn clear_empties_store() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        store.clear().unwrap();
        assert_eq!(store.list("").unwrap().len(), 0);
    }

    #[test]
    fn json_helpers_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Row {
            n: u32,
        }
        let store = MemoryStore::new();
        set_json(&store, "row", &Row { n: 7 }).unwrap();
        let got: Option<Row> = get_json(&store, "row").unwrap();
        assert_eq!(got, Some(Row { n: 7 }));
    }
}
