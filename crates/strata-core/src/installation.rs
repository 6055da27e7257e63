// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! On-disk layout of a patchable installation.
//!
//! ```text
//! <root>/
//!   .installation/                   metadata (ledger, settings, lock, records)
//!     ledger.json
//!     settings.json
//!     lock
//!     patches/<patch-id>/            rollback record: patch.json, misc/, configuration/
//!   modules/system/layers/<layer>/   base modules
//!     .overlays/<patch-id>/          one overlay per applied patch touching the layer
//!   <misc files>
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use strata_app_core::config::ConfigService;
use strata_app_core::settings::{StoreSettings, STORE_SETTINGS_KEY};
use strata_config_fs::FsConfigStore;

use crate::error::{IoAt, StoreError};
use crate::model::ContentTarget;

/// Metadata directory at the installation root.
pub const METADATA_DIR: &str = ".installation";
/// Root-relative directory holding the module layers.
pub const LAYERS_DIR: &str = "modules/system/layers";
/// Overlay directory inside each layer.
pub const OVERLAYS_DIR: &str = ".overlays";

const LEDGER_FILE: &str = "ledger.json";
const LOCK_FILE: &str = "lock";
const PATCHES_DIR: &str = "patches";

/// An installation root with its settings.
pub struct Installation {
    root: PathBuf,
    config: ConfigService<FsConfigStore>,
    settings: StoreSettings,
}

impl std::fmt::Debug for Installation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installation")
            .field("root", &self.root)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Installation {
    /// Create the metadata directory under `root` and persist `settings`.
    ///
    /// Fails with `AlreadyInitialized` when a ledger is already present.
    pub fn init(root: &Path, settings: StoreSettings) -> Result<Self, StoreError> {
        let metadata = root.join(METADATA_DIR);
        if metadata.join(LEDGER_FILE).exists() {
            return Err(StoreError::AlreadyInitialized(root.to_path_buf()));
        }
        fs::create_dir_all(metadata.join(PATCHES_DIR)).at(&metadata)?;
        for layer in &settings.layers {
            let dir = root.join(LAYERS_DIR).join(layer);
            fs::create_dir_all(&dir).at(&dir)?;
        }
        let config = ConfigService::new(FsConfigStore::at(&metadata)?);
        config.save(STORE_SETTINGS_KEY, &settings)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            settings,
        })
    }

    /// Open an initialized installation.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let metadata = root.join(METADATA_DIR);
        if !metadata.join(LEDGER_FILE).is_file() {
            return Err(StoreError::NotInitialized(root.to_path_buf()));
        }
        let config = ConfigService::new(FsConfigStore::at(&metadata)?);
        let settings = config.load_or_default(STORE_SETTINGS_KEY)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            settings,
        })
    }

    /// Installation root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current settings.
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Replace and persist the settings.
    pub fn update_settings(&mut self, settings: StoreSettings) -> Result<(), StoreError> {
        self.config.save(STORE_SETTINGS_KEY, &settings)?;
        self.settings = settings;
        Ok(())
    }

    /// `<root>/.installation`.
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    pub(crate) fn ledger_path(&self) -> PathBuf {
        self.metadata_dir().join(LEDGER_FILE)
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.metadata_dir().join(LOCK_FILE)
    }

    pub(crate) fn patches_dir(&self) -> PathBuf {
        self.metadata_dir().join(PATCHES_DIR)
    }

    /// Rollback record directory of an applied patch.
    pub fn record_dir(&self, patch_id: &str) -> PathBuf {
        self.patches_dir().join(patch_id)
    }

    /// Base directory of `layer`.
    pub fn layer_dir(&self, layer: &str) -> PathBuf {
        self.root.join(LAYERS_DIR).join(layer)
    }

    pub(crate) fn overlays_dir(&self, layer: &str) -> PathBuf {
        self.layer_dir(layer).join(OVERLAYS_DIR)
    }

    /// Overlay directory of `patch_id` in `layer`.
    pub fn overlay_dir(&self, layer: &str, patch_id: &str) -> PathBuf {
        self.overlays_dir(layer).join(patch_id)
    }

    /// Location of a misc file.
    pub fn misc_path(&self, target: &ContentTarget) -> PathBuf {
        self.root.join(target.relative_path())
    }
}
