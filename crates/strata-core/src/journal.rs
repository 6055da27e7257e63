// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Undo journal for apply/rollback.
//!
//! Every filesystem step that changes visible state records how to reverse
//! it before (or right after) it happens. If the operation fails before the
//! ledger is committed, the steps are undone newest-first and the tree is back
//! to its pre-call state. A committed journal is simply dropped.

use std::fs;
use std::path::PathBuf;

use tracing::warn;

use crate::fsutil;

#[derive(Debug)]
enum Undo {
    /// Remove a directory created by the operation.
    RemoveDir(PathBuf),
    /// Move a directory back to where it was.
    Rename { from: PathBuf, to: PathBuf },
    /// Put a file back: copy `saved` over `path`, or delete `path` when it
    /// did not exist, along with the empty directories below `kept`.
    RestoreFile {
        path: PathBuf,
        saved: Option<PathBuf>,
        kept: Option<PathBuf>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct Journal {
    steps: Vec<Undo>,
}

impl Journal {
    pub(crate) fn created_dir(&mut self, path: PathBuf) {
        self.steps.push(Undo::RemoveDir(path));
    }

    pub(crate) fn moved_dir(&mut self, from: PathBuf, to: PathBuf) {
        // undo moves `to` back to `from`
        self.steps.push(Undo::Rename { from: to, to: from });
    }

    /// Record `path` before it is written. `saved` holds its old bytes; when
    /// there are none, the deepest directory that exists now is remembered so
    /// undo also drops the parents the write creates.
    pub(crate) fn touched_file(&mut self, path: PathBuf, saved: Option<PathBuf>) {
        let kept = match saved {
            Some(_) => None,
            None => path.ancestors().skip(1).find(|dir| dir.is_dir()).map(PathBuf::from),
        };
        self.steps.push(Undo::RestoreFile { path, saved, kept });
    }

    /// The operation committed; nothing to undo.
    pub(crate) fn commit(mut self) {
        self.steps.clear();
    }

    /// Reverse every recorded step, newest first. Failures are logged and the
    /// remaining steps still run.
    pub(crate) fn undo(mut self) {
        while let Some(step) = self.steps.pop() {
            let result = match &step {
                Undo::RemoveDir(path) => fsutil::remove_dir_if_exists(path),
                Undo::Rename { from, to } => fs::rename(from, to),
                Undo::RestoreFile { path, saved: Some(saved), .. } => fs::read(saved)
                    .and_then(|bytes| fsutil::atomic_write(path, &bytes)),
                Undo::RestoreFile { path, saved: None, kept } => {
                    let removed = fsutil::remove_file_if_exists(path);
                    if let (Ok(()), Some(parent), Some(kept)) = (&removed, path.parent(), kept) {
                        fsutil::prune_empty_dirs(parent, kept);
                    }
                    removed
                }
            };
            if let Err(err) = result {
                warn!(?step, %err, "undo step failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn undo_runs_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        let saved = tmp.path().join("saved");
        fs::write(&saved, b"original").unwrap();

        let mut journal = Journal::default();
        journal.touched_file(file.clone(), Some(saved.clone()));
        fs::write(&file, b"first").unwrap();
        journal.touched_file(file.clone(), None);
        fs::write(&file, b"second").unwrap();

        // newest undo deletes, then the older one restores the original
        journal.undo();
        assert_eq!(fs::read(&file).unwrap(), b"original");
    }

    #[test]
    fn new_file_is_removed_with_the_directories_it_needed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("docs")).unwrap();
        let file = tmp.path().join("docs/new/deeper/notes.txt");

        let mut journal = Journal::default();
        journal.touched_file(file.clone(), None);
        fsutil::atomic_write(&file, b"notes").unwrap();

        journal.undo();
        assert!(!tmp.path().join("docs/new").exists());
        // already there before the write, so it stays even though empty
        assert!(tmp.path().join("docs").is_dir());
    }

    #[test]
    fn commit_keeps_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("made");
        fs::create_dir(&dir).unwrap();
        let mut journal = Journal::default();
        journal.created_dir(dir.clone());
        journal.commit();
        assert!(dir.is_dir());
    }

    #[test]
    fn moved_dir_is_moved_back() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::rename(&a, &b).unwrap();
        let mut journal = Journal::default();
        journal.moved_dir(a.clone(), b.clone());
        journal.undo();
        assert!(a.is_dir());
        assert!(!b.exists());
    }
}
