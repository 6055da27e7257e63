// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Process-exclusive writer lock on an installation.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use tracing::debug;

use crate::error::{IoAt, StoreError};

/// Held for the duration of one mutating store operation. Released on drop.
#[derive(Debug)]
pub(crate) struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .at(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(lock = %path.display(), "writer lock acquired");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                Err(StoreError::Locked(path.to_path_buf()))
            }
            Err(err) => Err(err).at(path),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if FileExt::unlock(&self.file).is_ok() {
            debug!(lock = %self.path.display(), "writer lock released");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock");
        let held = StoreLock::acquire(&path).unwrap();
        assert!(matches!(StoreLock::acquire(&path), Err(StoreError::Locked(_))));
        drop(held);
        assert!(StoreLock::acquire(&path).is_ok());
    }

    #[test]
    fn lock_is_exclusive_against_other_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lock");
        let _held = StoreLock::acquire(&path).unwrap();
        let other = OpenOptions::new().write(true).open(&path).unwrap();
        let err = FileExt::try_lock_exclusive(&other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }
}
