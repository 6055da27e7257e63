// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory content-addressed blob store.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{content_hash, BlobStore, CasError, ContentHash};

/// In-memory content-addressed blob store.
///
/// Holds the file payloads of one bundle. Identical payloads are stored
/// once, so a jar shipped in several module slots costs its bytes only once.
#[derive(Debug, Clone, Default)]
pub struct MemoryTier {
    blobs: BTreeMap<ContentHash, Arc<[u8]>>,
    byte_count: usize,
}

impl MemoryTier {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns `true` if no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total bytes stored across all blobs.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    fn insert(&mut self, hash: ContentHash, bytes: &[u8]) {
        if !self.blobs.contains_key(&hash) {
            self.byte_count += bytes.len();
            self.blobs.insert(hash, Arc::from(bytes));
        }
    }
}

impl BlobStore for MemoryTier {
    fn put(&mut self, bytes: &[u8]) -> ContentHash {
        let hash = content_hash(bytes);
        self.insert(hash, bytes);
        hash
    }

    fn put_verified(&mut self, expected: ContentHash, bytes: &[u8]) -> Result<(), CasError> {
        let computed = content_hash(bytes);
        if computed != expected {
            return Err(CasError::HashMismatch { expected, computed });
        }
        self.insert(computed, bytes);
        Ok(())
    }

    fn get(&self, hash: &ContentHash) -> Option<Arc<[u8]>> {
        self.blobs.get(hash).cloned()
    }

    fn has(&self, hash: &ContentHash) -> bool {
        self.blobs.contains_key(hash)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── put + get round-trip ────────────────────────────────────────────

    #[test]
    fn put_get_round_trip() {
        let mut store = MemoryTier::new();
        let data = b"hello strata";
        let hash = store.put(data);
        assert_eq!(&*store.get(&hash).unwrap(), data);
    }

    // ── put_verified mismatch does NOT mutate store ─────────────────────

    #[test]
    fn put_verified_mismatch_leaves_store_unchanged() {
        let mut store = MemoryTier::new();
        let bad_hash = ContentHash([0xFF; 32]);
        let err = store.put_verified(bad_hash, b"should not be stored").unwrap_err();
        match err {
            CasError::HashMismatch { expected, .. } => assert_eq!(expected, bad_hash),
            CasError::InvalidHash(_) => unreachable!(),
        }
        assert!(store.is_empty());
        assert_eq!(store.byte_count(), 0);
    }

    // ── duplicate puts are stored once ──────────────────────────────────

    #[test]
    fn put_idempotence_and_byte_count() {
        let mut store = MemoryTier::new();
        let h1 = store.put(b"aaaa");
        let h2 = store.put(b"aaaa");
        assert_eq!(h1, h2);
        store.put(b"bbbbbb");
        assert_eq!(store.len(), 2);
        assert_eq!(store.byte_count(), 10);
    }

    #[test]
    fn missing_hash_is_absent_not_error() {
        let store = MemoryTier::new();
        let hash = ContentHash([0xBB; 32]);
        assert!(store.get(&hash).is_none());
        assert!(!store.has(&hash));
    }
}
