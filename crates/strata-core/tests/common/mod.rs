// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use strata_core::hashing;
use strata_core::installation::METADATA_DIR;
use strata_core::{ContentHash, ContentTarget, PatchStore};
use walkdir::WalkDir;

pub const PRODUCT: &str = "Product";

/// Fresh installation of `Product 1.0.0` in a temp dir.
pub fn installation() -> (tempfile::TempDir, PatchStore) {
    let tmp = tempfile::tempdir().unwrap();
    let store = PatchStore::init(tmp.path(), PRODUCT, "1.0.0").unwrap();
    (tmp, store)
}

pub fn write(root: &Path, rel: &str, data: impl AsRef<[u8]>) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

/// Write a base-layer module slot.
pub fn base_module(root: &Path, name: &str, slot: &str, files: &[(&str, &str)]) -> ContentHash {
    let dir = root
        .join("modules/system/layers/base")
        .join(name.replace('.', "/"))
        .join(slot);
    for (rel, data) in files {
        write(&dir, rel, data);
    }
    hashing::module_hash(&dir).unwrap().unwrap()
}

/// Every file under `root` outside the metadata directory, with its bytes.
pub fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != METADATA_DIR)
        .map(Result::unwrap)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Effective hash of each target.
pub fn view(store: &PatchStore, targets: &[ContentTarget]) -> Vec<Option<ContentHash>> {
    targets
        .iter()
        .map(|t| store.current_hash(t).unwrap())
        .collect()
}

pub fn stack(store: &PatchStore, stream: &str) -> Vec<String> {
    store
        .ledger()
        .stream(stream)
        .unwrap()
        .stack
        .iter()
        .map(|p| p.patch_id.clone())
        .collect()
}
