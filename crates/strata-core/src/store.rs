// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The patch store: apply, rollback and ageout over an installation.
//!
//! Module content is never modified in place. Each applied patch adds one
//! overlay directory per touched layer, and the active content of a module
//! is found in the topmost overlay that holds it (a tombstone meaning the
//! module was removed), falling back to the base layer. Misc files are
//! replaced in place with a backup kept in the patch's rollback record.
//!
//! Every mutating call takes the installation's writer lock, re-reads the
//! ledger, journals its filesystem steps and commits by saving the ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use strata_app_core::settings::StoreSettings;
use strata_cas::ContentHash;
use tracing::{debug, info, instrument, warn};

use crate::bundle::{BundleError, PatchBundle, DESCRIPTOR_FILE, MISC_DIR};
use crate::error::{ConflictItem, IoAt, StoreError};
use crate::fsutil;
use crate::hashing::{self, TOMBSTONE};
use crate::installation::Installation;
use crate::journal::Journal;
use crate::ledger::{
    AppliedPatch, HistoryEntry, Ledger, OverlayRef, PatchInfo, VerbosePatchInfo,
};
use crate::lock::StoreLock;
use crate::model::{ContentTarget, Modification, PatchDescriptor, PatchKind};

const CONFIGURATION_DIR: &str = "configuration";

/// Outcome of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatchRecord {
    /// Applied patch.
    pub patch_id: String,
    /// Stream it was applied to.
    pub stream: String,
    /// One-off or cumulative.
    pub kind: PatchKind,
    /// Installed version afterwards.
    pub version: String,
    /// New hash of every modified target (`None` = removed).
    pub new_hashes: BTreeMap<ContentTarget, Option<ContentHash>>,
    /// Whether running processes must restart to see the change.
    pub restart_required: bool,
}

impl AppliedPatchRecord {
    /// New hash recorded for `target`, if the patch touched it.
    pub fn new_hash(&self, target: &ContentTarget) -> Option<Option<ContentHash>> {
        self.new_hashes.get(target).copied()
    }
}

/// Rollback switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Also restore the configuration directories captured at apply time.
    pub reset_configuration: bool,
}

/// Outcome of a successful rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackRecord {
    /// Reverted patch.
    pub patch_id: String,
    /// Its stream.
    pub stream: String,
    /// Its kind.
    pub kind: PatchKind,
    /// Installed version afterwards.
    pub version: String,
    /// Whether configuration directories were restored.
    pub configuration_reset: bool,
    /// Whether running processes must restart to see the change.
    pub restart_required: bool,
}

/// A patch pruned by ageout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgedPatch {
    /// Stream of the patch.
    pub stream: String,
    /// Patch id.
    pub patch_id: String,
}

/// Outcome of an ageout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgeoutReport {
    /// Patches newly flagged aged out, oldest first per stream.
    pub aged_out: Vec<AgedPatch>,
    /// Overlay items deleted because a later overlay shadows them.
    pub removed_items: usize,
    /// Overlay directories deleted because they were left empty.
    pub removed_overlays: usize,
}

/// Handle on one installation and its ledger.
#[derive(Debug)]
pub struct PatchStore {
    installation: Installation,
    ledger: Ledger,
}

impl PatchStore {
    /// Initialize `root` for `product` at `version` with default settings.
    pub fn init(root: &Path, product: &str, version: &str) -> Result<Self, StoreError> {
        Self::init_with(root, product, version, StoreSettings::default())
    }

    /// Initialize `root` with explicit settings.
    #[instrument(skip(settings))]
    pub fn init_with(
        root: &Path,
        product: &str,
        version: &str,
        settings: StoreSettings,
    ) -> Result<Self, StoreError> {
        let installation = Installation::init(root, settings)?;
        let ledger = Ledger::new(product, version);
        ledger.save(&installation.ledger_path())?;
        info!(root = %root.display(), "installation initialized");
        Ok(Self {
            installation,
            ledger,
        })
    }

    /// Open an initialized installation.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let installation = Installation::open(root)?;
        let ledger = Ledger::load(&installation.ledger_path())?;
        Ok(Self {
            installation,
            ledger,
        })
    }

    /// The installation.
    pub fn installation(&self) -> &Installation {
        &self.installation
    }

    /// Ledger as of the last operation.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Stream used when a caller names none.
    pub fn default_stream(&self) -> &str {
        self.installation
            .settings()
            .default_stream
            .as_deref()
            .unwrap_or(&self.ledger.base_stream)
    }

    /// Register a product stream at `version`.
    #[instrument(skip(self))]
    pub fn register_stream(&mut self, stream: &str, version: &str) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let mut ledger = self.ledger.clone();
        ledger.add_stream(stream, version)?;
        ledger.save(&self.installation.ledger_path())?;
        self.ledger = ledger;
        info!("stream registered");
        Ok(())
    }

    /// Make `stream` the stream used when a caller names none.
    #[instrument(skip(self))]
    pub fn set_default_stream(&mut self, stream: &str) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        self.ledger.stream(stream)?;
        let mut settings = self.installation.settings().clone();
        settings.default_stream = Some(stream.to_owned());
        self.installation.update_settings(settings)?;
        info!("default stream set");
        Ok(())
    }

    /// See [`Ledger::info`].
    pub fn info(&self, stream: &str) -> Result<PatchInfo, StoreError> {
        self.ledger.info(stream)
    }

    /// See [`Ledger::info_verbose`].
    pub fn info_verbose(&self, stream: &str) -> Result<VerbosePatchInfo, StoreError> {
        self.ledger.info_verbose(stream)
    }

    /// See [`Ledger::history`].
    pub fn history(&self, stream: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        self.ledger.history(stream)
    }

    /// See [`Ledger::stream_names`].
    pub fn stream_names(&self) -> Vec<String> {
        self.ledger.stream_names()
    }

    fn lock(&mut self) -> Result<StoreLock, StoreError> {
        let lock = StoreLock::acquire(&self.installation.lock_path())?;
        self.ledger = Ledger::load(&self.installation.ledger_path())?;
        Ok(lock)
    }

    /// Hash of the content currently active for `target` (`None` = absent).
    pub fn current_hash(&self, target: &ContentTarget) -> Result<Option<ContentHash>, StoreError> {
        match target {
            ContentTarget::Misc { .. } => {
                let path = self.installation.misc_path(target);
                hashing::file_hash(&path).at(&path)
            }
            ContentTarget::Module { layer, .. } => {
                let rel = target.relative_path();
                if let Some(state) = self.ledger.layer(layer) {
                    for overlay in state.overlays.iter().rev() {
                        let dir = self
                            .installation
                            .overlay_dir(layer, &overlay.patch_id)
                            .join(&rel);
                        if !dir.is_dir() {
                            continue;
                        }
                        if hashing::is_tombstoned(&dir) {
                            return Ok(None);
                        }
                        // a directory holding only nested modules is not this module
                        if let Some(hash) = hashing::module_hash(&dir).at(&dir)? {
                            return Ok(Some(hash));
                        }
                    }
                }
                let dir = self.installation.layer_dir(layer).join(&rel);
                hashing::module_hash(&dir).at(&dir)
            }
        }
    }

    fn conflicts<'a>(
        &self,
        expectations: impl Iterator<Item = (&'a ContentTarget, Option<ContentHash>)>,
    ) -> Result<Vec<ConflictItem>, StoreError> {
        let mut items = Vec::new();
        for (target, expected) in expectations {
            let actual = self.current_hash(target)?;
            if actual != expected {
                items.push(ConflictItem {
                    target: target.clone(),
                    expected,
                    actual,
                });
            }
        }
        Ok(items)
    }

    /// Apply a verified bundle.
    ///
    /// Nothing is written unless every precondition holds; an I/O failure
    /// part-way restores the pre-call tree.
    #[instrument(skip_all, fields(patch_id = %bundle.patch_id()))]
    pub fn apply(&mut self, bundle: &PatchBundle) -> Result<AppliedPatchRecord, StoreError> {
        bundle.verify()?;
        let _lock = self.lock()?;
        let descriptor = &bundle.descriptor;
        let patch_id = descriptor.patch_id.as_str();
        let stream = descriptor.identity.product_name.as_str();

        let state = self.ledger.stream(stream)?;
        if self.ledger.applied_in(patch_id).is_some() {
            return Err(StoreError::AlreadyApplied(patch_id.to_owned()));
        }
        let known_layers = &self.installation.settings().layers;
        if let Some(layer) = descriptor.layers().into_iter().find(|l| !known_layers.contains(l)) {
            return Err(StoreError::UnknownLayer {
                patch_id: patch_id.to_owned(),
                layer,
            });
        }
        if descriptor.kind == PatchKind::Cumulative
            && descriptor.identity.from_version != state.installed_version
        {
            return Err(StoreError::VersionMismatch {
                patch_id: patch_id.to_owned(),
                stream: stream.to_owned(),
                expected: descriptor.identity.from_version.clone(),
                installed: state.installed_version.clone(),
            });
        }
        let items = self.conflicts(
            descriptor
                .modifications()
                .map(|m| (m.target(), m.item.existing_hash)),
        )?;
        if !items.is_empty() {
            warn!(conflicts = items.len(), "apply refused");
            return Err(StoreError::Conflict {
                patch_id: patch_id.to_owned(),
                items,
            });
        }

        let mut journal = Journal::default();
        match self.write_patch(bundle, &mut journal) {
            Ok(ledger) => {
                journal.commit();
                self.ledger = ledger;
            }
            Err(err) => {
                warn!(%err, "apply failed, restoring installation");
                journal.undo();
                return Err(err);
            }
        }

        let record = AppliedPatchRecord {
            patch_id: patch_id.to_owned(),
            stream: stream.to_owned(),
            kind: descriptor.kind,
            version: self.ledger.stream(stream)?.installed_version.clone(),
            new_hashes: descriptor
                .modifications()
                .map(|m| (m.target().clone(), m.item.new_hash))
                .collect(),
            restart_required: descriptor.modifications().next().is_some(),
        };
        info!(stream, version = %record.version, "patch applied");
        Ok(record)
    }

    fn write_patch(&self, bundle: &PatchBundle, journal: &mut Journal) -> Result<Ledger, StoreError> {
        let descriptor = &bundle.descriptor;
        let patch_id = descriptor.patch_id.as_str();
        let record = self.write_record(descriptor, journal)?;

        for element in &descriptor.elements {
            self.write_overlay(bundle, &element.layer, &element.modifications, journal)?;
        }

        for m in &descriptor.misc {
            let path = self.installation.misc_path(m.target());
            let backup = m
                .item
                .existing_hash
                .map(|_| record.join(MISC_DIR).join(m.target().relative_path()));
            journal.touched_file(path.clone(), backup);
            match m.item.new_hash {
                Some(hash) => {
                    let bytes = bundle
                        .content
                        .file(&hash)
                        .ok_or_else(|| missing_content(m))?;
                    fsutil::atomic_write(&path, &bytes).at(&path)?;
                }
                None => {
                    fs::remove_file(&path).at(&path)?;
                    if let Some(parent) = path.parent() {
                        fsutil::prune_empty_dirs(parent, self.installation.root());
                    }
                }
            }
        }

        let mut ledger = self.ledger.clone();
        let stream = descriptor.identity.product_name.as_str();
        let state = ledger.stream_mut(stream)?;
        let version_before = state.installed_version.clone();
        let version_after = descriptor
            .identity
            .to_version
            .clone()
            .unwrap_or_else(|| version_before.clone());
        let applied_at = fsutil::unix_now();
        let layers = descriptor.layers();
        state.installed_version.clone_from(&version_after);
        state.stack.push(AppliedPatch {
            patch_id: patch_id.to_owned(),
            kind: descriptor.kind,
            version_before,
            version_after: version_after.clone(),
            applied_at,
            layers: layers.clone(),
            aged_out: false,
        });
        state.history.push(HistoryEntry {
            patch_id: patch_id.to_owned(),
            kind: descriptor.kind,
            applied_at,
            version_after,
            aged_out: false,
            rolled_back: false,
        });
        for layer in layers {
            ledger.layers.entry(layer).or_default().overlays.push(OverlayRef {
                patch_id: patch_id.to_owned(),
                kind: descriptor.kind,
                stream: stream.to_owned(),
            });
        }
        ledger.save(&self.installation.ledger_path())?;
        Ok(ledger)
    }

    /// Stage the rollback record (descriptor, misc backups, configuration
    /// snapshot) and move it into place.
    fn write_record(&self, descriptor: &PatchDescriptor, journal: &mut Journal) -> Result<PathBuf, StoreError> {
        let patch_id = descriptor.patch_id.as_str();
        let staging = self.installation.patches_dir().join(format!(".staging-{patch_id}"));
        fsutil::remove_dir_if_exists(&staging).at(&staging)?;
        fs::create_dir_all(&staging).at(&staging)?;
        journal.created_dir(staging.clone());

        let json = serde_json::to_vec_pretty(descriptor).map_err(BundleError::from)?;
        let file = staging.join(DESCRIPTOR_FILE);
        fs::write(&file, json).at(&file)?;

        for m in &descriptor.misc {
            if m.item.existing_hash.is_none() {
                continue;
            }
            let live = self.installation.misc_path(m.target());
            let backup = staging.join(MISC_DIR).join(m.target().relative_path());
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            fs::copy(&live, &backup).at(&live)?;
        }

        for dir in &self.installation.settings().configuration_dirs {
            let live = self.installation.root().join(dir);
            if live.is_dir() {
                let backup = staging.join(CONFIGURATION_DIR).join(dir);
                fsutil::copy_tree(&live, &backup).at(&live)?;
            }
        }

        let record = self.installation.record_dir(patch_id);
        if record.exists() {
            warn!(path = %record.display(), "removing stale rollback record");
            fsutil::remove_dir_if_exists(&record).at(&record)?;
        }
        fs::rename(&staging, &record).at(&record)?;
        journal.moved_dir(staging, record.clone());
        Ok(record)
    }

    fn write_overlay(
        &self,
        bundle: &PatchBundle,
        layer: &str,
        modifications: &[Modification],
        journal: &mut Journal,
    ) -> Result<(), StoreError> {
        let patch_id = bundle.patch_id();
        let overlays = self.installation.overlays_dir(layer);
        let staging = overlays.join(format!(".staging-{patch_id}"));
        fsutil::remove_dir_if_exists(&staging).at(&staging)?;
        fs::create_dir_all(&staging).at(&staging)?;
        journal.created_dir(staging.clone());

        for m in modifications {
            let slot = staging.join(m.target().relative_path());
            fs::create_dir_all(&slot).at(&slot)?;
            match m.item.new_hash {
                Some(hash) => {
                    let files = bundle
                        .content
                        .module_files(&hash)
                        .ok_or_else(|| missing_content(m))?;
                    for (rel, bytes) in files {
                        let file = slot.join(&rel);
                        if let Some(parent) = file.parent() {
                            fs::create_dir_all(parent).at(parent)?;
                        }
                        fs::write(&file, &bytes).at(&file)?;
                    }
                }
                None => {
                    let marker = slot.join(TOMBSTONE);
                    fs::write(&marker, b"").at(&marker)?;
                }
            }
        }

        let overlay = self.installation.overlay_dir(layer, patch_id);
        if overlay.exists() {
            warn!(path = %overlay.display(), "removing stale overlay");
            fsutil::remove_dir_if_exists(&overlay).at(&overlay)?;
        }
        fs::rename(&staging, &overlay).at(&overlay)?;
        journal.moved_dir(staging, overlay);
        debug!(layer, "overlay written");
        Ok(())
    }

    fn read_record(&self, patch_id: &str) -> Result<PatchDescriptor, StoreError> {
        let path = self.installation.record_dir(patch_id).join(DESCRIPTOR_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingRecord(patch_id.to_owned()))
            }
            Err(err) => return Err(err).at(&path),
        };
        Ok(serde_json::from_slice(&bytes).map_err(BundleError::from)?)
    }

    /// Roll back the most recent patch of `stream`.
    pub fn rollback_last(&mut self, stream: &str, options: RollbackOptions) -> Result<RollbackRecord, StoreError> {
        self.rollback(stream, None, options)
    }

    /// Roll back `patch_id` (or the top of the stack) in `stream`.
    ///
    /// Only the top of the stream's stack can be rolled back, and only while
    /// it is also on top of every layer it touched.
    #[instrument(skip(self))]
    pub fn rollback(
        &mut self,
        stream: &str,
        patch_id: Option<&str>,
        options: RollbackOptions,
    ) -> Result<RollbackRecord, StoreError> {
        let _lock = self.lock()?;
        let state = self.ledger.stream(stream)?;
        let top = state
            .top()
            .ok_or_else(|| StoreError::NothingToRollback(stream.to_owned()))?
            .clone();
        if let Some(id) = patch_id {
            if id != top.patch_id {
                return Err(if state.stack.iter().any(|p| p.patch_id == id) {
                    StoreError::NotTopOfStack {
                        patch_id: id.to_owned(),
                        top: top.patch_id,
                    }
                } else {
                    StoreError::PatchNotFound {
                        stream: stream.to_owned(),
                        patch_id: id.to_owned(),
                    }
                });
            }
        }
        for layer in &top.layers {
            let layer_top = self.ledger.layer(layer).and_then(|l| l.top());
            if let Some(other) = layer_top.filter(|o| o.patch_id != top.patch_id) {
                return Err(StoreError::NotTopOfStack {
                    patch_id: top.patch_id.clone(),
                    top: other.patch_id.clone(),
                });
            }
        }
        if let [.., below, _] = state.stack.as_slice() {
            if below.aged_out {
                return Err(StoreError::AgedOut {
                    patch_id: top.patch_id.clone(),
                    aged_out: below.patch_id.clone(),
                });
            }
        }

        let descriptor = self.read_record(&top.patch_id)?;
        let items = self.conflicts(descriptor.misc.iter().map(|m| (m.target(), m.item.new_hash)))?;
        if !items.is_empty() {
            warn!(conflicts = items.len(), "rollback refused");
            return Err(StoreError::Conflict {
                patch_id: top.patch_id,
                items,
            });
        }
        let record = self.installation.record_dir(&top.patch_id);
        for m in descriptor.misc.iter().filter(|m| m.item.existing_hash.is_some()) {
            if !record.join(MISC_DIR).join(m.target().relative_path()).is_file() {
                return Err(StoreError::MissingRecord(top.patch_id));
            }
        }

        let mut journal = Journal::default();
        let scratch = self
            .installation
            .patches_dir()
            .join(format!(".rollback-{}", top.patch_id));
        let result = self.unwrite_patch(stream, &top, &descriptor, options, &scratch, &mut journal);
        let (ledger, trash, configuration_reset) = match result {
            Ok(done) => {
                journal.commit();
                done
            }
            Err(err) => {
                warn!(%err, "rollback failed, restoring installation");
                journal.undo();
                return Err(err);
            }
        };
        self.ledger = ledger;

        for dir in trash.iter().chain([&scratch, &record]) {
            if let Err(err) = fsutil::remove_dir_if_exists(dir) {
                warn!(path = %dir.display(), %err, "could not clean up after rollback");
            }
        }
        let version = self.ledger.stream(stream)?.installed_version.clone();
        info!(patch_id = %top.patch_id, %version, "patch rolled back");
        Ok(RollbackRecord {
            patch_id: top.patch_id,
            stream: stream.to_owned(),
            kind: top.kind,
            version,
            configuration_reset,
            restart_required: true,
        })
    }

    fn unwrite_patch(
        &self,
        stream: &str,
        top: &AppliedPatch,
        descriptor: &PatchDescriptor,
        options: RollbackOptions,
        scratch: &Path,
        journal: &mut Journal,
    ) -> Result<(Ledger, Vec<PathBuf>, bool), StoreError> {
        let patch_id = top.patch_id.as_str();
        let record = self.installation.record_dir(patch_id);

        let mut trash = Vec::new();
        for layer in &top.layers {
            let overlay = self.installation.overlay_dir(layer, patch_id);
            if !overlay.exists() {
                continue;
            }
            let aside = self.installation.overlay_dir(layer, &format!(".trash-{patch_id}"));
            fsutil::remove_dir_if_exists(&aside).at(&aside)?;
            fs::rename(&overlay, &aside).at(&overlay)?;
            journal.moved_dir(overlay, aside.clone());
            trash.push(aside);
        }

        fsutil::remove_dir_if_exists(scratch).at(scratch)?;
        fs::create_dir_all(scratch).at(scratch)?;
        journal.created_dir(scratch.to_path_buf());

        for m in &descriptor.misc {
            let rel = m.target().relative_path();
            let live = self.installation.misc_path(m.target());
            let saved = match m.item.new_hash {
                Some(_) => {
                    let saved = scratch.join(MISC_DIR).join(&rel);
                    if let Some(parent) = saved.parent() {
                        fs::create_dir_all(parent).at(parent)?;
                    }
                    fs::copy(&live, &saved).at(&live)?;
                    Some(saved)
                }
                None => None,
            };
            journal.touched_file(live.clone(), saved);
            if m.item.existing_hash.is_some() {
                let backup = record.join(MISC_DIR).join(&rel);
                let bytes = fs::read(&backup).at(&backup)?;
                fsutil::atomic_write(&live, &bytes).at(&live)?;
            } else {
                fs::remove_file(&live).at(&live)?;
                if let Some(parent) = live.parent() {
                    fsutil::prune_empty_dirs(parent, self.installation.root());
                }
            }
        }

        let mut configuration_reset = false;
        if options.reset_configuration {
            for dir in &self.installation.settings().configuration_dirs {
                let backup = record.join(CONFIGURATION_DIR).join(dir);
                if !backup.is_dir() {
                    continue;
                }
                let live = self.installation.root().join(dir);
                if live.exists() {
                    let aside = scratch.join(CONFIGURATION_DIR).join(dir);
                    if let Some(parent) = aside.parent() {
                        fs::create_dir_all(parent).at(parent)?;
                    }
                    fs::rename(&live, &aside).at(&live)?;
                    journal.moved_dir(live.clone(), aside);
                }
                journal.created_dir(live.clone());
                fsutil::copy_tree(&backup, &live).at(&live)?;
                configuration_reset = true;
            }
        }

        let mut ledger = self.ledger.clone();
        let state = ledger.stream_mut(stream)?;
        state.stack.pop();
        state.installed_version.clone_from(&top.version_before);
        if let Some(entry) = state.live_entry_mut(patch_id) {
            entry.rolled_back = true;
        }
        for layer in &top.layers {
            if let Some(layer_state) = ledger.layers.get_mut(layer) {
                layer_state.overlays.pop();
            }
        }
        ledger.layers.retain(|_, l| !l.overlays.is_empty());
        ledger.save(&self.installation.ledger_path())?;
        Ok((ledger, trash, configuration_reset))
    }

    /// Prune history below the most recent cumulative patch of `stream`, or
    /// of every stream when `None`.
    ///
    /// The ledger is committed first; content is deleted afterwards, so a
    /// failure while deleting leaves only unreferenced files behind.
    #[instrument(skip(self))]
    pub fn ageout(&mut self, stream: Option<&str>) -> Result<AgeoutReport, StoreError> {
        let _lock = self.lock()?;
        let streams: Vec<String> = match stream {
            Some(name) => {
                self.ledger.stream(name)?;
                vec![name.to_owned()]
            }
            None => self.ledger.streams.keys().cloned().collect(),
        };

        let mut ledger = self.ledger.clone();
        let mut report = AgeoutReport::default();
        let mut pruned: Vec<(&str, AppliedPatch, BTreeSet<String>)> = Vec::new();
        for name in &streams {
            let state = ledger.stream_mut(name)?;
            let Some(cumulative) = state.latest_cumulative() else { continue };
            // Entries up to the cumulative can never be popped again, so only
            // their overlays may stand in for pruned content.
            let pinned: BTreeSet<String> = state.stack[..=cumulative]
                .iter()
                .map(|p| p.patch_id.clone())
                .collect();
            let newly: Vec<AppliedPatch> = state.stack[..cumulative]
                .iter_mut()
                .filter(|p| !p.aged_out)
                .map(|p| {
                    p.aged_out = true;
                    p.clone()
                })
                .collect();
            for patch in &newly {
                if let Some(entry) = state.live_entry_mut(&patch.patch_id) {
                    entry.aged_out = true;
                }
                report.aged_out.push(AgedPatch {
                    stream: name.clone(),
                    patch_id: patch.patch_id.clone(),
                });
            }
            pruned.extend(newly.into_iter().map(|p| (name.as_str(), p, pinned.clone())));
        }
        if pruned.is_empty() {
            debug!("nothing to age out");
            return Ok(report);
        }
        ledger.save(&self.installation.ledger_path())?;
        self.ledger = ledger;

        for (name, patch, pinned) in &pruned {
            self.prune(name, patch, pinned, &mut report);
        }
        info!(
            aged_out = report.aged_out.len(),
            removed_items = report.removed_items,
            removed_overlays = report.removed_overlays,
            "ageout complete"
        );
        Ok(report)
    }

    /// Delete what an aged-out patch no longer needs. Failures are logged;
    /// the ledger is already committed.
    /// Drop the backups of an aged-out patch and the overlay items that a
    /// `pinned` overlay of the same stream shadows.
    fn prune(
        &self,
        stream: &str,
        patch: &AppliedPatch,
        pinned: &BTreeSet<String>,
        report: &mut AgeoutReport,
    ) {
        let patch_id = patch.patch_id.as_str();
        let record = self.installation.record_dir(patch_id);
        for sub in [MISC_DIR, CONFIGURATION_DIR] {
            let dir = record.join(sub);
            if let Err(err) = fsutil::remove_dir_if_exists(&dir) {
                warn!(path = %dir.display(), %err, "could not prune backup");
            }
        }
        let descriptor = match self.read_record(patch_id) {
            Ok(d) => d,
            Err(err) => {
                warn!(patch_id, %err, "no record, overlays left in place");
                return;
            }
        };
        for layer in &patch.layers {
            let Some(element) = descriptor.element(layer) else { continue };
            let overlay = self.installation.overlay_dir(layer, patch_id);
            if !overlay.is_dir() {
                continue;
            }
            let above: Vec<PathBuf> = self
                .ledger
                .layer(layer)
                .map(|state| {
                    state
                        .overlays
                        .iter()
                        .skip_while(|o| o.patch_id != patch_id)
                        .skip(1)
                        .filter(|o| o.stream == stream && pinned.contains(&o.patch_id))
                        .map(|o| self.installation.overlay_dir(layer, &o.patch_id))
                        .collect()
                })
                .unwrap_or_default();
            for m in &element.modifications {
                let rel = m.target().relative_path();
                let shadowed = above.iter().any(|dir| {
                    let slot = dir.join(&rel);
                    hashing::is_tombstoned(&slot)
                        || matches!(hashing::module_hash(&slot), Ok(Some(_)))
                });
                if !shadowed {
                    continue;
                }
                match remove_item(&overlay.join(&rel), &overlay) {
                    Ok(()) => report.removed_items += 1,
                    Err(err) => warn!(item = %m.target(), %err, "could not prune overlay item"),
                }
            }
            if fs::remove_dir(&overlay).is_ok() {
                report.removed_overlays += 1;
                debug!(layer, patch_id, "overlay emptied and removed");
            }
        }
    }
}

/// Delete the files that belong to the module at `slot` (nested modules
/// stay), then prune empty directories up to `overlay`.
fn remove_item(slot: &Path, overlay: &Path) -> std::io::Result<()> {
    let mut files = Vec::new();
    hashing::for_each_module_file(slot, |_, path| {
        files.push(path.to_path_buf());
        Ok(())
    })?;
    files.push(slot.join(TOMBSTONE));
    let mut dirs = BTreeSet::new();
    for file in files {
        fsutil::remove_file_if_exists(&file)?;
        if let Some(parent) = file.parent() {
            dirs.insert(parent.to_path_buf());
        }
    }
    // deepest first so parents empty out before they are tried
    for dir in dirs.iter().rev() {
        fsutil::prune_empty_dirs(dir, overlay);
    }
    Ok(())
}

fn missing_content(m: &Modification) -> BundleError {
    BundleError::MissingContent {
        target: m.target().to_string(),
        location: "bundle content".into(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::bundle::PatchBundleBuilder;
    use strata_cas::content_hash;

    fn store() -> (tempfile::TempDir, PatchStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = PatchStore::init(tmp.path(), "Product", "1.0.0").unwrap();
        (tmp, store)
    }

    #[test]
    fn current_hash_prefers_topmost_overlay_and_honors_tombstones() {
        let (_tmp, mut store) = store();
        let target = ContentTarget::module("base", "org.a", "main");
        assert_eq!(store.current_hash(&target).unwrap(), None);

        let p1 = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .add_module("base", "org.a", "main", [("module.xml", "v1")])
            .build()
            .unwrap();
        let v1 = store.apply(&p1).unwrap().new_hash(&target).unwrap().unwrap();
        assert_eq!(store.current_hash(&target).unwrap(), Some(v1));

        let p2 = PatchBundleBuilder::one_off("p2", "Product", "1.0.0")
            .remove_module("base", "org.a", "main", v1)
            .build()
            .unwrap();
        store.apply(&p2).unwrap();
        assert_eq!(store.current_hash(&target).unwrap(), None);
        assert!(store
            .installation()
            .overlay_dir("base", "p2")
            .join("org/a/main")
            .join(TOMBSTONE)
            .is_file());
    }

    #[test]
    fn conflicting_apply_writes_nothing() {
        let (tmp, mut store) = store();
        fs::write(tmp.path().join("README"), b"local edit").unwrap();
        let bundle = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .modify_misc("README", content_hash(b"shipped"), "patched")
            .add_module("base", "org.a", "main", [("module.xml", "a")])
            .build()
            .unwrap();
        let err = store.apply(&bundle).unwrap_err();
        let StoreError::Conflict { items, .. } = err else {
            panic!("expected conflict, got {err}");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].actual, Some(content_hash(b"local edit")));
        assert!(!store.installation().overlay_dir("base", "p1").exists());
        assert!(!store.installation().record_dir("p1").exists());
        assert_eq!(fs::read(tmp.path().join("README")).unwrap(), b"local edit");
    }

    #[test]
    fn failed_write_is_undone() {
        let (tmp, mut store) = store();
        // a plain file where the overlay directory belongs
        fs::write(store.installation().layer_dir("base").join(".overlays"), b"").unwrap();
        let bundle = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .add_module("base", "org.a", "main", [("module.xml", "a")])
            .add_misc("bin/tool", "script")
            .build()
            .unwrap();
        assert!(matches!(store.apply(&bundle), Err(StoreError::Io { .. })));
        assert!(!store.installation().record_dir("p1").exists());
        assert_eq!(
            fs::read_dir(store.installation().metadata_dir().join("patches"))
                .unwrap()
                .count(),
            0
        );
        assert!(!tmp.path().join("bin/tool").exists());
        assert!(store.ledger().stream("Product").unwrap().stack.is_empty());
    }

    #[test]
    fn undone_misc_add_leaves_no_new_directories() {
        let (tmp, mut store) = store();
        fs::create_dir(tmp.path().join("bin")).unwrap();
        // the second write lands on the directory the first one created
        let bundle = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .add_misc("bin/docs/guide/intro.txt", "intro")
            .add_misc("bin/docs/guide", "clash")
            .build()
            .unwrap();
        assert!(matches!(store.apply(&bundle), Err(StoreError::Io { .. })));
        assert!(!tmp.path().join("bin/docs").exists());
        assert!(tmp.path().join("bin").is_dir());
        assert!(store.ledger().stream("Product").unwrap().stack.is_empty());
    }

    #[test]
    fn unknown_layer_and_stream_are_rejected() {
        let (_tmp, mut store) = store();
        let other_layer = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .add_module("extra", "org.a", "main", [("module.xml", "a")])
            .build()
            .unwrap();
        assert!(matches!(
            store.apply(&other_layer),
            Err(StoreError::UnknownLayer { .. })
        ));
        let other_stream = PatchBundleBuilder::one_off("p2", "Other", "1.0.0")
            .add_misc("f", "x")
            .build()
            .unwrap();
        assert!(matches!(
            store.apply(&other_stream),
            Err(StoreError::UnknownStream(_))
        ));
    }

    #[test]
    fn rollback_by_unknown_id_and_on_empty_stream() {
        let (_tmp, mut store) = store();
        assert!(matches!(
            store.rollback_last("Product", RollbackOptions::default()),
            Err(StoreError::NothingToRollback(_))
        ));
        let p1 = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .add_misc("f", "x")
            .build()
            .unwrap();
        store.apply(&p1).unwrap();
        assert!(matches!(
            store.rollback("Product", Some("nope"), RollbackOptions::default()),
            Err(StoreError::PatchNotFound { .. })
        ));
    }

    #[test]
    fn rollback_refuses_modified_misc_file() {
        let (tmp, mut store) = store();
        let p1 = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .add_misc("conf/app.properties", "a=1")
            .build()
            .unwrap();
        store.apply(&p1).unwrap();
        fs::write(tmp.path().join("conf/app.properties"), "a=2").unwrap();
        assert!(matches!(
            store.rollback_last("Product", RollbackOptions::default()),
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.ledger().stream("Product").unwrap().stack.len(), 1);
    }
}
