//! # Document Store
//!
//! Purpose: The in-memory data service behind the loopback core. Documents
//! live in hash-sharded maps guarded by per-shard locks, carry a CAS value
//! and an optional expiry, and are checked for expiry on access.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: Per-shard `RwLock`s keep concurrent sessions from
//!    serializing on a single map.
//! 2. **Shared Buffers**: Values are `Bytes`, so reads hand out a reference
//!    counted view instead of a copy.
//! 3. **Expiry On Access**: A read of an expired document removes it and
//!    reports `document_not_found`; `purge_expired` sweeps the rest.
//! 4. **Monotonic CAS**: Every mutation draws a fresh CAS from one counter, so
//!    a CAS observed by a reader is never reissued.
//!
//! ## Structure Overview
//!
//! ```text
//! DocumentStore
//!   └── shards: Vec<Shard>
//!         └── RwLock<HashMap<DocumentId, Entry>>
//!               └── Entry { value, cas, flags, expires_at }
//! ```

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

use csm_common::{DocumentId, ErrorCode, KeyValueErrc};

use crate::request::{GetResult, MutationKind};

/// Largest document body the data service accepts (20 MiB).
pub const MAX_VALUE_SIZE: usize = 20 * 1024 * 1024;

/// Number of virtual partitions used for mutation tokens.
pub const PARTITION_COUNT: u16 = 1024;

const DEFAULT_SHARD_MULTIPLIER: usize = 4;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    cas: u64,
    flags: u32,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[derive(Debug)]
struct Shard {
    docs: RwLock<HashMap<DocumentId, Entry, RandomState>>,
}

/// What a successful mutation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMutation {
    pub cas: u64,
    pub partition_id: u16,
    pub sequence_number: u64,
}

/// A mutation to apply to one document.
#[derive(Debug, Clone)]
pub struct Write {
    pub kind: MutationKind,
    pub value: Bytes,
    pub flags: u32,
    pub expiry: Option<Duration>,
    /// Expected CAS; only honoured by `replace`.
    pub cas: Option<u64>,
}

/// Sharded in-memory document store.
#[derive(Debug)]
pub struct DocumentStore {
    shards: Vec<Shard>,
    shard_mask: usize,
    hash_state: RandomState,
    next_cas: AtomicU64,
    next_seqno: AtomicU64,
}

impl DocumentStore {
    /// Creates a store with a shard count derived from CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a store with `shards` shards, rounded up to a power of two.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                docs: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            })
            .collect();

        DocumentStore {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
            next_cas: AtomicU64::new(1),
            next_seqno: AtomicU64::new(1),
        }
    }

    /// Reads a live document.
    pub fn get(&self, id: &DocumentId, now: Instant) -> Result<GetResult, ErrorCode> {
        let shard = self.shard_for(id);
        {
            let docs = shard.docs.read();
            match docs.get(id) {
                None => return Err(KeyValueErrc::DocumentNotFound.into()),
                Some(entry) if !entry.is_expired(now) => {
                    return Ok(GetResult {
                        value: entry.value.clone(),
                        cas: entry.cas,
                        flags: entry.flags,
                    });
                }
                Some(_) => {}
            }
        }

        // Expired: upgrade to a write lock and drop it, unless a writer beat us.
        let mut docs = shard.docs.write();
        if docs.get(id).map(|entry| entry.is_expired(now)).unwrap_or(false) {
            docs.remove(id);
        }
        Err(KeyValueErrc::DocumentNotFound.into())
    }

    /// Applies an upsert, insert or replace.
    ///
    /// **Logic**:
    /// - `insert` fails with `document_exists` on a live document.
    /// - `replace` fails with `document_not_found` on a missing one, and with
    ///   `cas_mismatch` when a non-zero expected CAS differs.
    /// - `upsert` always succeeds.
    pub fn write(&self, id: &DocumentId, write: Write, now: Instant) -> Result<StoredMutation, ErrorCode> {
        if write.value.len() > MAX_VALUE_SIZE {
            return Err(KeyValueErrc::ValueTooLarge.into());
        }

        let shard = self.shard_for(id);
        let mut docs = shard.docs.write();
        let live = docs.get(id).filter(|entry| !entry.is_expired(now));

        match (write.kind, live) {
            (MutationKind::Insert, Some(_)) => return Err(KeyValueErrc::DocumentExists.into()),
            (MutationKind::Replace, None) => return Err(KeyValueErrc::DocumentNotFound.into()),
            (MutationKind::Replace, Some(entry)) => {
                if let Some(expected) = write.cas.filter(|cas| *cas != 0) {
                    if expected != entry.cas {
                        return Err(csm_common::CommonErrc::CasMismatch.into());
                    }
                }
            }
            _ => {}
        }

        let cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
        docs.insert(
            id.clone(),
            Entry {
                value: write.value,
                cas,
                flags: write.flags,
                expires_at: write.expiry.map(|ttl| now + ttl),
            },
        );
        Ok(self.stored(id, cas))
    }

    /// Removes a live document, checking `cas` when it is non-zero.
    pub fn remove(&self, id: &DocumentId, cas: Option<u64>, now: Instant) -> Result<StoredMutation, ErrorCode> {
        let shard = self.shard_for(id);
        let mut docs = shard.docs.write();
        let entry = match docs.get(id) {
            Some(entry) if !entry.is_expired(now) => entry,
            Some(_) => {
                docs.remove(id);
                return Err(KeyValueErrc::DocumentNotFound.into());
            }
            None => return Err(KeyValueErrc::DocumentNotFound.into()),
        };

        if let Some(expected) = cas.filter(|cas| *cas != 0) {
            if expected != entry.cas {
                return Err(csm_common::CommonErrc::CasMismatch.into());
            }
        }

        docs.remove(id);
        let cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
        Ok(self.stored(id, cas))
    }

    /// Drops every document of `bucket`; returns how many were removed.
    pub fn flush_bucket(&self, bucket: &str) -> usize {
        self.retain(|id| id.bucket != bucket)
    }

    /// Drops every document of one collection.
    pub fn drop_collection(&self, bucket: &str, scope: &str, collection: &str) -> usize {
        self.retain(|id| !(id.bucket == bucket && id.scope == scope && id.collection == collection))
    }

    /// Drops every document of one scope.
    pub fn drop_scope(&self, bucket: &str, scope: &str) -> usize {
        self.retain(|id| !(id.bucket == bucket && id.scope == scope))
    }

    /// Removes expired documents across all shards.
    ///
    /// This is an O(n) scan meant for an occasional sweep.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut docs = shard.docs.write();
            let before = docs.len();
            docs.retain(|_, entry| !entry.is_expired(now));
            removed += before - docs.len();
        }
        removed
    }

    /// Number of stored documents, expired ones included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.docs.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&DocumentId) -> bool,
    {
        let mut removed = 0;
        for shard in &self.shards {
            let mut docs = shard.docs.write();
            let before = docs.len();
            docs.retain(|id, _| keep(id));
            removed += before - docs.len();
        }
        removed
    }

    fn stored(&self, id: &DocumentId, cas: u64) -> StoredMutation {
        StoredMutation {
            cas,
            partition_id: self.partition_of(id),
            sequence_number: self.next_seqno.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Partition a key maps to; stable for the lifetime of the store.
    pub fn partition_of(&self, id: &DocumentId) -> u16 {
        let mut hasher = self.hash_state.build_hasher();
        id.key.hash(&mut hasher);
        (hasher.finish() % u64::from(PARTITION_COUNT)) as u16
    }

    fn shard_for(&self, id: &DocumentId) -> &Shard {
        let mut hasher = self.hash_state.build_hasher();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csm_common::CommonErrc;

    fn doc(key: &str) -> DocumentId {
        DocumentId::in_default_collection("travel", key)
    }

    fn write(kind: MutationKind, value: &'static str) -> Write {
        Write {
            kind,
            value: Bytes::from_static(value.as_bytes()),
            flags: 0,
            expiry: None,
            cas: None,
        }
    }

    #[test]
    fn upsert_then_get() {
        let store = DocumentStore::with_shard_count(4);
        let now = Instant::now();
        let stored = store.write(&doc("a"), write(MutationKind::Upsert, "{}"), now).unwrap();
        let got = store.get(&doc("a"), now).unwrap();
        assert_eq!(got.cas, stored.cas);
        assert_eq!(&got.value[..], b"{}");
    }

    #[test]
    fn insert_conflicts_and_replace_requires_document() {
        let store = DocumentStore::with_shard_count(2);
        let now = Instant::now();
        assert_eq!(
            store.write(&doc("a"), write(MutationKind::Replace, "1"), now),
            Err(KeyValueErrc::DocumentNotFound.into())
        );
        store.write(&doc("a"), write(MutationKind::Insert, "1"), now).unwrap();
        assert_eq!(
            store.write(&doc("a"), write(MutationKind::Insert, "2"), now),
            Err(KeyValueErrc::DocumentExists.into())
        );
    }

    #[test]
    fn replace_checks_cas() {
        let store = DocumentStore::with_shard_count(2);
        let now = Instant::now();
        let first = store.write(&doc("a"), write(MutationKind::Upsert, "1"), now).unwrap();

        let mut stale = write(MutationKind::Replace, "2");
        stale.cas = Some(first.cas + 100);
        assert_eq!(store.write(&doc("a"), stale, now), Err(CommonErrc::CasMismatch.into()));

        let mut fresh = write(MutationKind::Replace, "2");
        fresh.cas = Some(first.cas);
        let second = store.write(&doc("a"), fresh, now).unwrap();
        assert!(second.cas > first.cas);
    }

    #[test]
    fn expired_documents_read_as_missing() {
        let store = DocumentStore::with_shard_count(2);
        let now = Instant::now();
        let mut short = write(MutationKind::Upsert, "1");
        short.expiry = Some(Duration::from_secs(1));
        store.write(&doc("a"), short, now).unwrap();

        let later = now + Duration::from_secs(2);
        assert_eq!(store.get(&doc("a"), later), Err(KeyValueErrc::DocumentNotFound.into()));
        assert!(store.is_empty());
    }

    #[test]
    fn purge_expired_removes_only_expired() {
        let store = DocumentStore::with_shard_count(2);
        let now = Instant::now();
        let mut short = write(MutationKind::Upsert, "1");
        short.expiry = Some(Duration::from_millis(10));
        store.write(&doc("a"), short, now).unwrap();
        store.write(&doc("b"), write(MutationKind::Upsert, "2"), now).unwrap();

        assert_eq!(store.purge_expired(now + Duration::from_secs(1)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn oversized_values_are_rejected() {
        let store = DocumentStore::with_shard_count(1);
        let mut big = write(MutationKind::Upsert, "");
        big.value = Bytes::from(vec![b'x'; MAX_VALUE_SIZE + 1]);
        assert_eq!(
            store.write(&doc("a"), big, Instant::now()),
            Err(KeyValueErrc::ValueTooLarge.into())
        );
    }

    #[test]
    fn flush_and_drop_collection_scope_documents() {
        let store = DocumentStore::with_shard_count(4);
        let now = Instant::now();
        store
            .write(&DocumentId::new("travel", "inventory", "hotel", "h1"), write(MutationKind::Upsert, "1"), now)
            .unwrap();
        store.write(&doc("a"), write(MutationKind::Upsert, "1"), now).unwrap();
        store
            .write(&DocumentId::in_default_collection("beer", "b"), write(MutationKind::Upsert, "1"), now)
            .unwrap();

        assert_eq!(store.drop_collection("travel", "inventory", "hotel"), 1);
        assert_eq!(store.flush_bucket("travel"), 1);
        assert_eq!(store.len(), 1);
    }
}
