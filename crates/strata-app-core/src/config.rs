// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config port and the JSON service Strata tools read settings through.
//!
//! Installations keep their [`StoreSettings`](crate::settings::StoreSettings)
//! next to the ledger; the CLI keeps per-user defaults in the platform config
//! directory. Both go through [`ConfigService`], which only knows keys and
//! bytes from its [`ConfigStore`].

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Byte-level storage behind a [`ConfigService`], addressed by key.
pub trait ConfigStore {
    /// Bytes stored under `key`, or [`ConfigError::NotFound`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace the bytes stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Config failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("[STRATA_CONFIG_NOT_FOUND] no such config entry")]
    NotFound,
    /// Backing storage failed.
    #[error("[STRATA_CONFIG_IO] {0}")]
    Io(#[from] std::io::Error),
    /// Stored JSON does not match the expected shape.
    #[error("[STRATA_CONFIG_PARSE] {key}: {source}")]
    Parse {
        /// Key being loaded.
        key: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// Value could not be encoded.
    #[error("[STRATA_CONFIG_ENCODE] {0}")]
    Encode(#[from] serde_json::Error),
    /// Store-specific failure.
    #[error("[STRATA_CONFIG] {0}")]
    Other(String),
}

/// Typed JSON access over a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Wrap `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Value under `key`; `None` when absent or stored empty.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => return Ok(None),
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                key: key.to_owned(),
                source,
            })
    }

    /// Value under `key`, or `T::default()` when absent.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, ConfigError> {
        Ok(self.load(key)?.unwrap_or_default())
    }

    /// Store `value` under `key` as pretty JSON.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }

    /// Load (or default) the value under `key`, let `edit` change it, save it
    /// back and return the saved value.
    pub fn update<T, F>(&self, key: &str, edit: F) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T),
    {
        let mut value = self.load_or_default(key)?;
        edit(&mut value);
        self.save(key, &value)?;
        Ok(value)
    }
}
