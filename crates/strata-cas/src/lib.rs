// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content hashes and blob storage for Strata patch bundles.
//!
//! `strata-cas` provides the [`ContentHash`] newtype used everywhere a patch
//! names content, and a [`BlobStore`] trait for content-addressed storage keyed
//! by BLAKE3 hash. [`MemoryTier`] carries the file payloads of a patch bundle
//! while it is read, merged, or written.
//!
//! # Hash Domain Policy
//!
//! Blob hashes are content-only: `BLAKE3(bytes)` with no domain prefix, so the
//! hash of a misc file in a bundle equals the hash of the same file on disk.
//! Module directories are hashed one layer up (`strata-core::hashing`) with a
//! domain-prefixed tree hash over these blob hashes.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod memory;
pub use memory::MemoryTier;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 32-byte BLAKE3 content hash.
///
/// The inner bytes are public for zero-cost access; `Display` renders
/// lowercase hex and serde uses the same hex form so descriptors and ledgers
/// stay readable.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// View the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl FromStr for ContentHash {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CasError::InvalidHash(s.to_owned()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CasError::InvalidHash(s.to_owned()))?;
        Ok(Self(arr))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the BLAKE3 content hash of `bytes`.
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    let hash = blake3::hash(bytes);
    ContentHash(*hash.as_bytes())
}

/// Errors that can occur during CAS operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CasError {
    /// Blob bytes did not match the declared hash.
    #[error("[CAS_HASH_MISMATCH] expected {expected}, computed {computed}")]
    HashMismatch {
        /// The hash that was declared/expected.
        expected: ContentHash,
        /// The hash actually computed from the bytes.
        computed: ContentHash,
    },
    /// A hex string did not decode to 32 bytes.
    #[error("[CAS_INVALID_HASH] not a 64-digit hex hash: {0:?}")]
    InvalidHash(String),
}

/// Content-addressed blob store.
///
/// [`get`](BlobStore::get) returns `None` for missing blobs; absence is not an
/// error. Error variants are reserved for integrity violations.
pub trait BlobStore {
    /// Compute hash and store. Returns the content hash.
    fn put(&mut self, bytes: &[u8]) -> ContentHash;

    /// Store with a pre-computed hash. Rejects if `BLAKE3(bytes) != expected`.
    ///
    /// On mismatch the store is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::HashMismatch`] if the computed hash differs from
    /// `expected`.
    fn put_verified(&mut self, expected: ContentHash, bytes: &[u8]) -> Result<(), CasError>;

    /// Retrieve blob by hash. Returns `None` if not stored.
    fn get(&self, hash: &ContentHash) -> Option<Arc<[u8]>>;

    /// Check existence without retrieving.
    fn has(&self, hash: &ContentHash) -> bool;
}
