// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Settings persisted through the config port.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Config key for per-installation settings.
pub const STORE_SETTINGS_KEY: &str = "settings";

/// Config key for per-user CLI preferences.
pub const USER_PREFS_KEY: &str = "strata";

/// Per-installation settings, stored next to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Layers patches may target. Elements naming other layers are rejected.
    pub layers: Vec<String>,
    /// Installation-relative directories captured at apply time and restored
    /// by `rollback --reset-configuration=true`.
    pub configuration_dirs: Vec<String>,
    /// Stream used when a command names none; the base product when unset.
    pub default_stream: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            layers: vec!["base".to_owned()],
            configuration_dirs: vec![
                "standalone/configuration".to_owned(),
                "domain/configuration".to_owned(),
            ],
            default_stream: None,
        }
    }
}

/// Per-user defaults for the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPrefs {
    /// Installation used when neither `--installation` nor `STRATA_HOME` is set.
    pub default_installation: Option<PathBuf>,
}
