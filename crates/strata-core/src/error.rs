// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Errors surfaced by the patch store.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use strata_app_core::config::ConfigError;
use strata_cas::ContentHash;
use thiserror::Error;

use crate::bundle::BundleError;
use crate::model::{ContentTarget, ModelError};

/// One content item whose current hash differs from what a patch expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictItem {
    /// Offending item.
    pub target: ContentTarget,
    /// Hash the patch expected (`None` = expected absent).
    pub expected: Option<ContentHash>,
    /// Hash found in the installation (`None` = absent).
    pub actual: Option<ContentHash>,
}

fn show(hash: Option<&ContentHash>) -> String {
    hash.map_or_else(|| "<absent>".to_owned(), ContentHash::short)
}

impl fmt::Display for ConflictItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (expected {}, found {})",
            self.target,
            show(self.expected.as_ref()),
            show(self.actual.as_ref())
        )
    }
}

fn join(items: &[ConflictItem]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by [`crate::PatchStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure; the store has restored the pre-call tree.
    #[error("[STRATA_IO] {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Settings could not be loaded or saved.
    #[error("[STRATA_CONFIG] {0}")]
    Config(#[from] ConfigError),
    /// Descriptor is structurally invalid.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Bundle is incomplete or inconsistent.
    #[error(transparent)]
    Bundle(#[from] BundleError),
    /// Ledger file could not be parsed.
    #[error("[STRATA_LEDGER_CORRUPT] {path}: {source}")]
    LedgerCorrupt {
        /// Ledger path.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },
    /// No installation metadata at the given root.
    #[error("[STRATA_NOT_INITIALIZED] no patch ledger under {0}")]
    NotInitialized(PathBuf),
    /// Installation metadata already present.
    #[error("[STRATA_ALREADY_INITIALIZED] {0} already has a patch ledger")]
    AlreadyInitialized(PathBuf),
    /// Another process holds the writer lock.
    #[error("[STRATA_LOCKED] {0} is locked by another patch operation")]
    Locked(PathBuf),
    /// Stream is not known to the installation.
    #[error("[STRATA_UNKNOWN_STREAM] unknown patch stream {0}")]
    UnknownStream(String),
    /// Stream already registered.
    #[error("[STRATA_STREAM_EXISTS] patch stream {0} already exists")]
    StreamExists(String),
    /// Patch targets a layer the installation does not have.
    #[error("[STRATA_UNKNOWN_LAYER] {patch_id} targets unknown layer {layer}")]
    UnknownLayer {
        /// Patch id.
        patch_id: String,
        /// Offending layer.
        layer: String,
    },
    /// Patch id is already applied.
    #[error("[STRATA_ALREADY_APPLIED] patch {0} is already applied")]
    AlreadyApplied(String),
    /// Cumulative patch authored against another version.
    #[error(
        "[STRATA_VERSION_MISMATCH] {patch_id} applies to {stream} {expected}, installed is {installed}"
    )]
    VersionMismatch {
        /// Patch id.
        patch_id: String,
        /// Stream name.
        stream: String,
        /// Version the patch expects.
        expected: String,
        /// Installed version.
        installed: String,
    },
    /// Content does not match the patch preconditions.
    #[error("[STRATA_CONFLICT] {patch_id}: {}", join(.items))]
    Conflict {
        /// Patch id being applied or rolled back.
        patch_id: String,
        /// Every mismatching item.
        items: Vec<ConflictItem>,
    },
    /// Rollback requested for a patch below the top of its stack.
    #[error("[STRATA_NOT_TOP_OF_STACK] {patch_id} is not the most recent patch; roll back {top} first")]
    NotTopOfStack {
        /// Requested patch.
        patch_id: String,
        /// Patch currently on top.
        top: String,
    },
    /// No such applied patch in the stream.
    #[error("[STRATA_PATCH_NOT_FOUND] patch {patch_id} is not applied to {stream}")]
    PatchNotFound {
        /// Stream name.
        stream: String,
        /// Requested patch.
        patch_id: String,
    },
    /// Stream has no applied patches.
    #[error("[STRATA_NOTHING_TO_ROLLBACK] no patches applied to {0}")]
    NothingToRollback(String),
    /// Rolling back would need content removed by ageout.
    #[error("[STRATA_AGED_OUT] cannot roll back {patch_id}: history below it ({aged_out}) was aged out")]
    AgedOut {
        /// Requested patch.
        patch_id: String,
        /// Aged-out patch directly below.
        aged_out: String,
    },
    /// Rollback record of an applied patch is missing.
    #[error("[STRATA_MISSING_RECORD] no rollback record for {0}")]
    MissingRecord(String),
}

pub(crate) trait IoAt<T> {
    fn at(self, path: &Path) -> Result<T, StoreError>;
}

impl<T> IoAt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
