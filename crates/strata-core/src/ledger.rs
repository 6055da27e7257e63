// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ordered record of applied patches per stream and per layer.
//!
//! The ledger is the commit point of every store operation: filesystem
//! changes made before it is saved are undone on failure, and nothing a
//! saved ledger refers to is deleted before the save.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoAt, StoreError};
use crate::fsutil;
use crate::model::PatchKind;

/// Current `ledger.json` format.
pub const LEDGER_FORMAT: u32 = 1;

/// Cumulative patch id reported when none has been applied.
pub const BASE_PATCH_ID: &str = "base";

/// A patch in a stream's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppliedPatch {
    /// Patch id.
    pub patch_id: String,
    /// One-off or cumulative.
    pub kind: PatchKind,
    /// Installed version before the patch.
    pub version_before: String,
    /// Installed version after the patch.
    pub version_after: String,
    /// Unix seconds.
    pub applied_at: u64,
    /// Layers holding an overlay of this patch.
    pub layers: Vec<String>,
    /// Superseded content was pruned; the patch can no longer be exposed
    /// again by rollback.
    #[serde(default)]
    pub aged_out: bool,
}

/// One line of a stream's history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryEntry {
    /// Patch id.
    pub patch_id: String,
    /// One-off or cumulative.
    pub kind: PatchKind,
    /// Unix seconds.
    pub applied_at: u64,
    /// Installed version after the patch.
    pub version_after: String,
    /// Pruned by ageout.
    #[serde(default)]
    pub aged_out: bool,
    /// Reverted by rollback.
    #[serde(default)]
    pub rolled_back: bool,
}

/// Per-stream state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamState {
    /// Version before any patch.
    pub base_version: String,
    /// Currently installed version.
    pub installed_version: String,
    /// Applied patches, oldest first.
    #[serde(default)]
    pub stack: Vec<AppliedPatch>,
    /// Append-only log of every apply.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl StreamState {
    fn new(version: &str) -> Self {
        Self {
            base_version: version.to_owned(),
            installed_version: version.to_owned(),
            stack: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Most recently applied patch.
    pub fn top(&self) -> Option<&AppliedPatch> {
        self.stack.last()
    }

    /// Index of the most recent cumulative patch in the stack.
    pub fn latest_cumulative(&self) -> Option<usize> {
        self.stack.iter().rposition(|p| p.kind == PatchKind::Cumulative)
    }

    /// Latest history line for `patch_id` that is still in effect.
    pub(crate) fn live_entry_mut(&mut self, patch_id: &str) -> Option<&mut HistoryEntry> {
        self.history
            .iter_mut()
            .rev()
            .find(|h| h.patch_id == patch_id && !h.rolled_back)
    }
}

/// An overlay in a layer stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OverlayRef {
    /// Patch that owns the overlay.
    pub patch_id: String,
    /// Kind of that patch.
    pub kind: PatchKind,
    /// Stream of that patch.
    pub stream: String,
}

/// Ordered overlays of one layer; the last one is on top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerState {
    /// Overlays, bottom first.
    pub overlays: Vec<OverlayRef>,
}

impl LayerState {
    /// Overlay currently on top.
    pub fn top(&self) -> Option<&OverlayRef> {
        self.overlays.last()
    }
}

/// Summary answered by `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PatchInfo {
    /// Installed version.
    pub version: String,
    /// Most recent cumulative patch, or `base`.
    pub cumulative_patch_id: String,
    /// One-offs applied after it, most recent first.
    pub one_off_patches: Vec<String>,
}

impl PatchInfo {
    /// One-off ids comma-joined, or `none`.
    pub fn one_offs(&self) -> String {
        if self.one_off_patches.is_empty() {
            "none".to_owned()
        } else {
            self.one_off_patches.join(",")
        }
    }
}

impl fmt::Display for PatchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version: {}", self.version)?;
        writeln!(f, "Cumulative patch ID: {}", self.cumulative_patch_id)?;
        write!(f, "One-off patches: {}", self.one_offs())
    }
}

/// Per-layer part of a verbose `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayerPatchInfo {
    /// Layer name.
    pub layer: String,
    /// Most recent cumulative overlay of the stream in this layer, or `base`.
    pub cumulative_patch_id: String,
    /// One-off overlays above it, most recent first.
    pub one_off_patches: Vec<String>,
}

/// `info` plus the active overlays of each layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VerbosePatchInfo {
    /// Stream summary.
    #[serde(flatten)]
    pub info: PatchInfo,
    /// Layers with an overlay from the stream.
    pub layers: Vec<LayerPatchInfo>,
}

fn partition<'a>(entries: impl DoubleEndedIterator<Item = (&'a str, PatchKind)>) -> (String, Vec<String>) {
    let mut one_offs = Vec::new();
    for (id, kind) in entries.rev() {
        if kind == PatchKind::Cumulative {
            return (id.to_owned(), one_offs);
        }
        one_offs.push(id.to_owned());
    }
    (BASE_PATCH_ID.to_owned(), one_offs)
}

/// Persisted patch ledger of an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ledger {
    /// File format.
    pub format_version: u32,
    /// Product the installation was created with.
    pub base_stream: String,
    /// Known streams.
    pub streams: BTreeMap<String, StreamState>,
    /// Overlay stacks by layer.
    #[serde(default)]
    pub layers: BTreeMap<String, LayerState>,
}

impl Ledger {
    /// Empty ledger for `product` at `version`.
    pub fn new(product: &str, version: &str) -> Self {
        Self {
            format_version: LEDGER_FORMAT,
            base_stream: product.to_owned(),
            streams: BTreeMap::from([(product.to_owned(), StreamState::new(version))]),
            layers: BTreeMap::new(),
        }
    }

    /// Read `ledger.json`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let root = path
                    .parent()
                    .and_then(Path::parent)
                    .unwrap_or(path)
                    .to_path_buf();
                return Err(StoreError::NotInitialized(root));
            }
            Err(err) => return Err(err).at(path),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::LedgerCorrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replace `ledger.json`.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| StoreError::LedgerCorrupt {
            path: path.to_path_buf(),
            source,
        })?;
        fsutil::atomic_write(path, &bytes).at(path)
    }

    /// State of `stream`.
    pub fn stream(&self, stream: &str) -> Result<&StreamState, StoreError> {
        self.streams
            .get(stream)
            .ok_or_else(|| StoreError::UnknownStream(stream.to_owned()))
    }

    pub(crate) fn stream_mut(&mut self, stream: &str) -> Result<&mut StreamState, StoreError> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::UnknownStream(stream.to_owned()))
    }

    /// Register a new stream at `version`.
    pub fn add_stream(&mut self, stream: &str, version: &str) -> Result<(), StoreError> {
        if self.streams.contains_key(stream) {
            return Err(StoreError::StreamExists(stream.to_owned()));
        }
        self.streams.insert(stream.to_owned(), StreamState::new(version));
        Ok(())
    }

    /// Overlay stack of `layer` (empty when untouched).
    pub fn layer(&self, layer: &str) -> Option<&LayerState> {
        self.layers.get(layer)
    }

    /// Stream whose stack currently holds `patch_id`.
    pub fn applied_in(&self, patch_id: &str) -> Option<&str> {
        self.streams
            .iter()
            .find(|(_, s)| s.stack.iter().any(|p| p.patch_id == patch_id))
            .map(|(name, _)| name.as_str())
    }

    /// Version, latest cumulative and the one-offs above it.
    pub fn info(&self, stream: &str) -> Result<PatchInfo, StoreError> {
        let state = self.stream(stream)?;
        let (cumulative_patch_id, one_off_patches) =
            partition(state.stack.iter().map(|p| (p.patch_id.as_str(), p.kind)));
        Ok(PatchInfo {
            version: state.installed_version.clone(),
            cumulative_patch_id,
            one_off_patches,
        })
    }

    /// [`info`](Self::info) plus one line per layer the stream has overlays in.
    pub fn info_verbose(&self, stream: &str) -> Result<VerbosePatchInfo, StoreError> {
        let info = self.info(stream)?;
        let layers = self
            .layers
            .iter()
            .filter_map(|(layer, state)| {
                let ours: Vec<(&str, PatchKind)> = state
                    .overlays
                    .iter()
                    .filter(|o| o.stream == stream)
                    .map(|o| (o.patch_id.as_str(), o.kind))
                    .collect();
                if ours.is_empty() {
                    return None;
                }
                let (cumulative_patch_id, one_off_patches) = partition(ours.into_iter());
                Some(LayerPatchInfo {
                    layer: layer.clone(),
                    cumulative_patch_id,
                    one_off_patches,
                })
            })
            .collect();
        Ok(VerbosePatchInfo { info, layers })
    }

    /// History entries still in effect, most recent first.
    pub fn history(&self, stream: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .stream(stream)?
            .history
            .iter()
            .rev()
            .filter(|h| !h.rolled_back)
            .cloned()
            .collect())
    }

    /// Base stream first, then every other stream that has seen a patch.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names = vec![self.base_stream.clone()];
        names.extend(
            self.streams
                .iter()
                .filter(|(name, s)| **name != self.base_stream && !s.history.is_empty())
                .map(|(name, _)| name.clone()),
        );
        names
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn push(ledger: &mut Ledger, stream: &str, id: &str, kind: PatchKind) {
        let state = ledger.stream_mut(stream).unwrap();
        let version = state.installed_version.clone();
        state.stack.push(AppliedPatch {
            patch_id: id.into(),
            kind,
            version_before: version.clone(),
            version_after: version.clone(),
            applied_at: 0,
            layers: vec!["base".into()],
            aged_out: false,
        });
        state.history.push(HistoryEntry {
            patch_id: id.into(),
            kind,
            applied_at: 0,
            version_after: version,
            aged_out: false,
            rolled_back: false,
        });
        ledger.layers.entry("base".into()).or_default().overlays.push(OverlayRef {
            patch_id: id.into(),
            kind,
            stream: stream.into(),
        });
    }

    #[test]
    fn info_on_fresh_ledger_reports_base_and_none() {
        let ledger = Ledger::new("Product", "1.0.0");
        let info = ledger.info("Product").unwrap();
        assert_eq!(info.cumulative_patch_id, "base");
        assert_eq!(info.one_offs(), "none");
        assert_eq!(info.version, "1.0.0");
    }

    #[test]
    fn info_lists_one_offs_after_latest_cumulative_most_recent_first() {
        let mut ledger = Ledger::new("Product", "1.0.0");
        push(&mut ledger, "Product", "early", PatchKind::OneOff);
        push(&mut ledger, "Product", "CP1", PatchKind::Cumulative);
        push(&mut ledger, "Product", "one-off1", PatchKind::OneOff);
        push(&mut ledger, "Product", "one-off2", PatchKind::OneOff);
        let info = ledger.info("Product").unwrap();
        assert_eq!(info.cumulative_patch_id, "CP1");
        assert_eq!(info.one_offs(), "one-off2,one-off1");

        let verbose = ledger.info_verbose("Product").unwrap();
        assert_eq!(verbose.layers.len(), 1);
        assert_eq!(verbose.layers[0].cumulative_patch_id, "CP1");
    }

    #[test]
    fn history_skips_rolled_back_entries() {
        let mut ledger = Ledger::new("Product", "1.0.0");
        push(&mut ledger, "Product", "a", PatchKind::OneOff);
        push(&mut ledger, "Product", "b", PatchKind::OneOff);
        ledger
            .stream_mut("Product")
            .unwrap()
            .live_entry_mut("b")
            .unwrap()
            .rolled_back = true;
        let ids: Vec<_> = ledger
            .history("Product")
            .unwrap()
            .into_iter()
            .map(|h| h.patch_id)
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn stream_names_hide_unused_streams() {
        let mut ledger = Ledger::new("Product", "1.0.0");
        ledger.add_stream("ProductA", "1.0.0").unwrap();
        ledger.add_stream("ProductB", "2.0.0").unwrap();
        assert_eq!(ledger.stream_names(), vec!["Product"]);
        push(&mut ledger, "ProductB", "b1", PatchKind::OneOff);
        assert_eq!(ledger.stream_names(), vec!["Product", "ProductB"]);
        assert!(matches!(
            ledger.add_stream("ProductA", "1.0.0"),
            Err(StoreError::StreamExists(_))
        ));
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".installation/ledger.json");
        let mut ledger = Ledger::new("Product", "1.0.0");
        push(&mut ledger, "Product", "CP1", PatchKind::Cumulative);
        ledger.save(&path).unwrap();
        assert_eq!(Ledger::load(&path).unwrap(), ledger);

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            Ledger::load(&path),
            Err(StoreError::LedgerCorrupt { .. })
        ));
    }
}
