//! The in-memory key-value map backing the replicated state machine.
//!
//! The map is mutated only through the apply path of the replicated log, so
//! every replica that has applied the same prefix of the log holds an
//! identical map. Reads (gRPC handlers, the health endpoint) take the shared
//! handle and read under the same lock.
//!
//! Snapshots clone the map under a brief exclusive section; serialization
//! happens outside the lock. Restore swaps the whole map in one step.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::command::Command;

/// Result of applying a single command, surfaced to the local submitter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Applied {
    pub ok: bool,
    pub detail: String,
}

impl Applied {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Shared handle to the KV map. Cheap to clone.
#[derive(Clone, Default)]
pub struct KvStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// All pairs, cloned out. Used by `GetAllPairs` and the snapshot builder.
    pub fn dump(&self) -> HashMap<String, String> {
        self.inner.read().unwrap().clone()
    }

    /// Replace the whole map. Used by snapshot restore.
    pub fn replace(&self, pairs: HashMap<String, String>) {
        *self.inner.write().unwrap() = pairs;
    }

    /// Apply one decoded command. SetPair inserts or overwrites; DeletePair
    /// on a missing key is a no-op success.
    pub fn apply(&self, command: &Command) -> Applied {
        match command {
            Command::SetPair { key, value } => {
                self.inner
                    .write()
                    .unwrap()
                    .insert(key.clone(), value.clone());
                Applied::ok(format!("set {key}"))
            }
            Command::DeletePair { key } => {
                let removed = self.inner.write().unwrap().remove(key).is_some();
                if removed {
                    Applied::ok(format!("deleted {key}"))
                } else {
                    Applied::ok(format!("{key} not present"))
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Command {
        Command::SetPair {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn del(key: &str) -> Command {
        Command::DeletePair {
            key: key.to_string(),
        }
    }

    #[test]
    fn set_inserts_and_overwrites() {
        let kv = KvStore::new();
        assert!(kv.apply(&set("a", "1")).ok);
        assert_eq!(kv.get("a").as_deref(), Some("1"));

        assert!(kv.apply(&set("a", "2")).ok);
        assert_eq!(kv.get("a").as_deref(), Some("2"));
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn delete_missing_key_is_noop_success() {
        let kv = KvStore::new();
        let outcome = kv.apply(&del("ghost"));
        assert!(outcome.ok);
        assert!(kv.is_empty());
    }

    #[test]
    fn delete_removes_present_key() {
        let kv = KvStore::new();
        kv.apply(&set("a", "1"));
        assert!(kv.apply(&del("a")).ok);
        assert_eq!(kv.get("a"), None);
    }

    #[test]
    fn same_command_sequence_yields_identical_state() {
        // Two replicas applying the same committed prefix end up byte-identical.
        let commands = vec![
            set("a", "1"),
            set("b", "2"),
            del("a"),
            set("c", "3"),
            set("b", "4"),
            del("missing"),
        ];

        let left = KvStore::new();
        let right = KvStore::new();
        for cmd in &commands {
            left.apply(cmd);
            right.apply(cmd);
        }
        assert_eq!(left.dump(), right.dump());
    }

    #[test]
    fn replace_swaps_full_state() {
        let kv = KvStore::new();
        kv.apply(&set("old", "x"));

        let mut pairs = HashMap::new();
        pairs.insert("new".to_string(), "y".to_string());
        kv.replace(pairs);

        assert_eq!(kv.get("old"), None);
        assert_eq!(kv.get("new").as_deref(), Some("y"));
    }

    #[test]
    fn dump_then_replace_is_identity() {
        let kv = KvStore::new();
        kv.apply(&set("a", "1"));
        kv.apply(&set("b", "2"));

        let snapshot = kv.dump();
        let restored = KvStore::new();
        restored.replace(snapshot);
        assert_eq!(restored.dump(), kv.dump());
    }
}
