// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content hashing for misc files and module slot directories.
//!
//! A module's hash covers the files of its own slot directory only. Nested
//! directories that hold another module (they contain [`MODULE_DESCRIPTOR`])
//! are a different content root and are skipped, so a submodule update never
//! changes its parent module's hash.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use strata_cas::{content_hash, ContentHash};
use walkdir::{DirEntry, WalkDir};

/// File that marks a directory as a module root.
pub const MODULE_DESCRIPTOR: &str = "module.xml";

/// Marker written into an overlay slot directory when a patch removes the module.
pub const TOMBSTONE: &str = ".strata-removed";

const TREE_DOMAIN: &[u8] = b"strata:tree:v1\0";

/// Files of one module slot: `/`-joined relative path → blob hash.
pub type ModuleTree = BTreeMap<String, ContentHash>;

/// Hash of a module tree; `None` for an empty tree (no module).
pub fn tree_hash(tree: &ModuleTree) -> Option<ContentHash> {
    if tree.is_empty() {
        return None;
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(TREE_DOMAIN);
    for (path, hash) in tree {
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(hash.as_bytes());
    }
    Some(ContentHash(*hasher.finalize().as_bytes()))
}

/// Hash of the file at `path`, or `None` when it does not exist.
pub fn file_hash(path: &Path) -> io::Result<Option<ContentHash>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(content_hash(&bytes))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn is_nested_module_root(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.path().join(MODULE_DESCRIPTOR).is_file()
}

/// Visit every file belonging to the module rooted at `dir`, in path order.
///
/// Skips nested module roots and the tombstone marker. A missing directory
/// yields nothing.
pub fn for_each_module_file(
    dir: &Path,
    mut visit: impl FnMut(String, &Path) -> io::Result<()>,
) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_nested_module_root(e));
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() || entry.file_name() == TOMBSTONE {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(io::Error::other)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        visit(rel, entry.path())?;
    }
    Ok(())
}

/// Keep the `/`-joined paths that [`for_each_module_file`] would visit once
/// written out: tombstones and files under a nested module root are dropped.
pub fn own_module_files<B>(files: Vec<(String, B)>) -> Vec<(String, B)> {
    let nested: BTreeSet<String> = files
        .iter()
        .filter_map(|(path, _)| path.strip_suffix(MODULE_DESCRIPTOR)?.strip_suffix('/'))
        .filter(|dir| !dir.is_empty())
        .map(str::to_owned)
        .collect();
    files
        .into_iter()
        .filter(|(path, _)| {
            path.rsplit('/').next() != Some(TOMBSTONE)
                && !path.match_indices('/').any(|(i, _)| nested.contains(&path[..i]))
        })
        .collect()
}

/// Read the tree of the module rooted at `dir` (empty when absent).
pub fn read_module_tree(dir: &Path) -> io::Result<ModuleTree> {
    let mut tree = ModuleTree::new();
    for_each_module_file(dir, |rel, path| {
        tree.insert(rel, content_hash(&fs::read(path)?));
        Ok(())
    })?;
    Ok(tree)
}

/// Hash of the module rooted at `dir`, `None` when it holds no files.
pub fn module_hash(dir: &Path) -> io::Result<Option<ContentHash>> {
    Ok(tree_hash(&read_module_tree(dir)?))
}

/// Whether `dir` carries the removal marker.
pub fn is_tombstoned(dir: &Path) -> bool {
    dir.join(TOMBSTONE).is_file()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, data).unwrap();
    }

    #[test]
    fn empty_tree_has_no_hash() {
        assert!(tree_hash(&ModuleTree::new()).is_none());
        let tmp = tempfile::tempdir().unwrap();
        assert!(module_hash(&tmp.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn tree_hash_depends_on_paths_and_content() {
        let h = content_hash(b"x");
        let a: ModuleTree = [("a.jar".to_string(), h)].into();
        let b: ModuleTree = [("b.jar".to_string(), h)].into();
        assert_ne!(tree_hash(&a), tree_hash(&b));
    }

    #[test]
    fn nested_module_roots_are_a_separate_content_root() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = tmp.path().join("org/foo/main");
        write(&slot, "module.xml", b"<module name=\"org.foo\"/>");
        write(&slot, "foo.jar", b"foo-1");
        let before = module_hash(&slot).unwrap();

        // org.foo.main:sub lives inside org/foo/main
        write(&slot, "sub/module.xml", b"<module name=\"org.foo.main\" slot=\"sub\"/>");
        write(&slot, "sub/sub.jar", b"sub-1");
        assert_eq!(module_hash(&slot).unwrap(), before);

        write(&slot, "lib/native.so", b"so");
        assert_ne!(module_hash(&slot).unwrap(), before);
    }

    #[test]
    fn tombstone_is_not_content() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), TOMBSTONE, b"");
        assert!(is_tombstoned(tmp.path()));
        assert!(module_hash(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn own_module_files_match_what_a_walk_visits() {
        let tmp = tempfile::tempdir().unwrap();
        let files = vec![
            ("module.xml".to_owned(), "m"),
            ("lib/a.jar".to_owned(), "a"),
            ("sub/module.xml".to_owned(), "s"),
            ("sub/deep/s.jar".to_owned(), "s"),
            ("submarine.jar".to_owned(), "x"),
        ];
        for (rel, data) in &files {
            write(tmp.path(), rel, data.as_bytes());
        }
        let kept: Vec<String> = own_module_files(files).into_iter().map(|(p, _)| p).collect();
        assert_eq!(kept, vec!["module.xml", "lib/a.jar", "submarine.jar"]);
        let walked: Vec<String> = read_module_tree(tmp.path()).unwrap().into_keys().collect();
        assert_eq!(walked, vec!["lib/a.jar", "module.xml", "submarine.jar"]);
    }

    #[test]
    fn file_hash_matches_blob_hash() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "f", b"test content");
        assert_eq!(
            file_hash(&tmp.path().join("f")).unwrap(),
            Some(content_hash(b"test content"))
        );
        assert!(file_hash(&tmp.path().join("nope")).unwrap().is_none());
    }
}
