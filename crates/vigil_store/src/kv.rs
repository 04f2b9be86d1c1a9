//! Key-value engine and key bucketing.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use vigil_witness::witness::KEY_BUCKET_COUNT;

pub trait KvEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: Vec<u8>, value: Vec<u8>);
    /// Remove a key, reporting whether it was present.
    fn del(&self, key: &[u8]) -> bool;
}

/// Hash a primary key into the witness GC bucket space for the logical
/// database `db_id`. Witnesses shard held records by this bucket; only the
/// output range and the db-id seeding are contractual.
pub fn key_bucket(db_id: u64, key: &[u8]) -> u32 {
    let mut hasher = DefaultHasher::new();
    db_id.hash(&mut hasher);
    key.hash(&mut hasher);
    (hasher.finish() as u32) & (KEY_BUCKET_COUNT - 1)
}

/// In-memory latest-value store.
pub struct MemoryEngine {
    inner: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let guard = self.inner.read().ok()?;
        guard.get(key).cloned()
    }

    fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        if let Ok(mut guard) = self.inner.write() {
            guard.insert(key, value);
        }
    }

    fn del(&self, key: &[u8]) -> bool {
        match self.inner.write() {
            Ok(mut guard) => guard.remove(key).is_some(),
            Err(_) => false,
        }
    }
}
