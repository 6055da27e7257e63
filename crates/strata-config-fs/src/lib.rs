// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem-backed `ConfigStore` for Strata tools.

use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use strata_app_core::config::{ConfigError, ConfigStore};

/// Store configs as JSON files under a base directory.
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Create a store rooted at the user config directory (e.g., `~/.config/strata`).
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("dev", "flyingrobots", "Strata")
            .ok_or_else(|| ConfigError::Other("could not resolve config dir".into()))?;
        Self::at(proj.config_dir())
    }

    /// Create a store rooted at `base`, creating the directory if needed.
    pub fn at(base: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let path = self.path_for(key);
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use strata_app_core::config::ConfigService;
    use strata_app_core::settings::{StoreSettings, STORE_SETTINGS_KEY};

    #[test]
    fn settings_round_trip_through_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = ConfigService::new(FsConfigStore::at(tmp.path().join("meta")).unwrap());
        let mut settings = StoreSettings::default();
        settings.layers.push("extra".into());
        svc.save(STORE_SETTINGS_KEY, &settings).unwrap();

        assert!(tmp.path().join("meta/settings.json").is_file());
        let loaded: StoreSettings = svc.load(STORE_SETTINGS_KEY).unwrap().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsConfigStore::at(tmp.path()).unwrap();
        assert!(matches!(store.load_raw("nope"), Err(ConfigError::NotFound)));
    }
}
