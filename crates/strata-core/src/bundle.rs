// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Patch bundles: a descriptor plus the content it references.
//!
//! On disk a bundle is a directory (or a `.tar.gz` of one):
//!
//! ```text
//! patch.json                                    descriptor
//! misc/<path>                                   misc file content
//! <element-id>/modules/<name path>/<slot>/...   module content
//! ```
//!
//! Only content named by a `new_hash` is loaded, and every payload is checked
//! against its declared hash before the bundle is handed out.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use strata_cas::{BlobStore, CasError, ContentHash, MemoryTier};
use thiserror::Error;
use tracing::debug;

use crate::hashing::{self, tree_hash, ModuleTree, MODULE_DESCRIPTOR, TOMBSTONE};
use crate::model::{
    ContentTarget, ModelError, Modification, PatchDescriptor, PatchElement, PatchIdentity,
    PatchKind,
};

/// Descriptor file name at the bundle root.
pub const DESCRIPTOR_FILE: &str = "patch.json";
/// Directory holding misc content.
pub const MISC_DIR: &str = "misc";
/// Directory (inside an element directory) holding module content.
pub const MODULES_DIR: &str = "modules";

/// Errors raised while reading, writing, or checking a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Descriptor failed validation.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Filesystem failure.
    #[error("[STRATA_BUNDLE_IO] {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// `patch.json` could not be parsed or written.
    #[error("[STRATA_BUNDLE_DESCRIPTOR] {0}")]
    Descriptor(#[from] serde_json::Error),
    /// Bundle has no `patch.json`.
    #[error("[STRATA_BUNDLE_DESCRIPTOR] no {DESCRIPTOR_FILE} in {0}")]
    MissingDescriptor(PathBuf),
    /// Content named by a modification is absent.
    #[error("[STRATA_BUNDLE_MISSING_CONTENT] {target}: nothing at {location}")]
    MissingContent {
        /// Target whose content is missing.
        target: String,
        /// Where it was expected.
        location: String,
    },
    /// Content does not hash to the declared value.
    #[error("[STRATA_BUNDLE_HASH_MISMATCH] {target}: expected {expected}, computed {computed:?}")]
    HashMismatch {
        /// Target whose content is wrong.
        target: String,
        /// Declared hash.
        expected: ContentHash,
        /// Hash of what was found (`None` for an empty module).
        computed: Option<ContentHash>,
    },
    /// Archive entry or module file path escapes its root.
    #[error("[STRATA_BUNDLE_UNSAFE_PATH] {0:?}")]
    UnsafePath(String),
    /// Neither a directory nor a `.tar.gz`/`.tgz` archive.
    #[error("[STRATA_BUNDLE_FORMAT] {0} is not a bundle directory or .tar.gz archive")]
    UnknownFormat(PathBuf),
    /// Blob storage rejected a payload.
    #[error(transparent)]
    Cas(CasError),
    /// Refusing to overwrite an existing output.
    #[error("[STRATA_BUNDLE_EXISTS] {0} already exists")]
    Exists(PathBuf),
}

trait IoAt<T> {
    fn at(self, path: &Path) -> Result<T, BundleError>;
}

impl<T> IoAt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, BundleError> {
        self.map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Content payloads of a bundle: file blobs and module trees.
#[derive(Debug, Clone, Default)]
pub struct BundleContent {
    blobs: MemoryTier,
    trees: BTreeMap<ContentHash, ModuleTree>,
}

impl BundleContent {
    /// Store a misc file payload.
    pub fn put_file(&mut self, bytes: &[u8]) -> ContentHash {
        self.blobs.put(bytes)
    }

    /// Store a misc file payload that must hash to `expected`.
    pub fn put_file_verified(&mut self, expected: ContentHash, bytes: &[u8]) -> Result<(), CasError> {
        self.blobs.put_verified(expected, bytes)
    }

    /// Store a module's files; returns the tree hash (`None` if no files).
    ///
    /// Files under a nested module root and tombstones are not part of the
    /// module once written out, so they are left out here too.
    pub fn put_module<P, B>(&mut self, files: impl IntoIterator<Item = (P, B)>) -> Option<ContentHash>
    where
        P: Into<String>,
        B: AsRef<[u8]>,
    {
        let files: Vec<(String, B)> = files.into_iter().map(|(p, b)| (p.into(), b)).collect();
        let mut tree = ModuleTree::new();
        for (path, bytes) in hashing::own_module_files(files) {
            tree.insert(path, self.blobs.put(bytes.as_ref()));
        }
        let hash = tree_hash(&tree)?;
        self.trees.insert(hash, tree);
        Some(hash)
    }

    /// Misc payload by hash.
    pub fn file(&self, hash: &ContentHash) -> Option<Arc<[u8]>> {
        self.blobs.get(hash)
    }

    /// Module tree by hash.
    pub fn module(&self, hash: &ContentHash) -> Option<&ModuleTree> {
        self.trees.get(hash)
    }

    /// Module files (path, bytes) by tree hash.
    pub fn module_files(&self, hash: &ContentHash) -> Option<Vec<(String, Arc<[u8]>)>> {
        self.trees
            .get(hash)?
            .iter()
            .map(|(path, blob)| Some((path.clone(), self.blobs.get(blob)?)))
            .collect()
    }

    /// Whether the payload for `target` at `hash` is fully present.
    pub fn contains(&self, target: &ContentTarget, hash: &ContentHash) -> bool {
        match target {
            ContentTarget::Misc { .. } => self.blobs.has(hash),
            ContentTarget::Module { .. } => self
                .trees
                .get(hash)
                .is_some_and(|tree| tree.values().all(|b| self.blobs.has(b))),
        }
    }

    /// Copy the payload for `target` at `hash` from `other`. Returns `false`
    /// when `other` lacks it.
    pub fn import(&mut self, other: &Self, target: &ContentTarget, hash: &ContentHash) -> bool {
        match target {
            ContentTarget::Misc { .. } => match other.file(hash) {
                Some(bytes) => {
                    self.blobs.put(&bytes);
                    true
                }
                None => false,
            },
            ContentTarget::Module { .. } => match other.module_files(hash) {
                Some(files) => {
                    self.put_module(files);
                    true
                }
                None => false,
            },
        }
    }

    /// Number of distinct file payloads.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }
}

/// A patch descriptor with its content.
#[derive(Debug, Clone)]
pub struct PatchBundle {
    /// The descriptor.
    pub descriptor: PatchDescriptor,
    /// Payloads referenced by the descriptor.
    pub content: BundleContent,
}

impl PatchBundle {
    /// Patch id of the descriptor.
    pub fn patch_id(&self) -> &str {
        &self.descriptor.patch_id
    }

    /// Validate the descriptor and check that every `new_hash` has content.
    pub fn verify(&self) -> Result<(), BundleError> {
        self.descriptor.validate()?;
        for m in self.descriptor.modifications() {
            let Some(hash) = m.item.new_hash else { continue };
            if !self.content.contains(m.target(), &hash) {
                return Err(BundleError::MissingContent {
                    target: m.target().to_string(),
                    location: hash.to_hex(),
                });
            }
            if let Some(tree) = self.content.module(&hash) {
                if let Some(bad) = tree.keys().find(|p| !is_safe_relative(p)) {
                    return Err(BundleError::UnsafePath(bad.clone()));
                }
            }
        }
        Ok(())
    }
}

fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains('\\'))
}

fn misc_location(path: &str) -> String {
    format!("{MISC_DIR}/{path}")
}

fn module_location(element: &PatchElement, target: &ContentTarget) -> String {
    format!(
        "{}/{MODULES_DIR}/{}",
        element.element_id,
        target.relative_key()
    )
}

fn is_archive(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase());
    name.is_some_and(|n| n.ends_with(".tar.gz") || n.ends_with(".tgz"))
}

trait BundleSource {
    fn origin(&self) -> &Path;
    fn read(&self, rel: &str) -> Result<Option<Vec<u8>>, BundleError>;
    fn read_module(&self, rel_dir: &str) -> Result<Vec<(String, Vec<u8>)>, BundleError>;
}

struct DirSource {
    root: PathBuf,
}

impl BundleSource for DirSource {
    fn origin(&self) -> &Path {
        &self.root
    }

    fn read(&self, rel: &str) -> Result<Option<Vec<u8>>, BundleError> {
        let path = self.root.join(rel);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).at(&path),
        }
    }

    fn read_module(&self, rel_dir: &str) -> Result<Vec<(String, Vec<u8>)>, BundleError> {
        let dir = self.root.join(rel_dir);
        let mut files = Vec::new();
        hashing::for_each_module_file(&dir, |rel, path| {
            files.push((rel, fs::read(path)?));
            Ok(())
        })
        .at(&dir)?;
        Ok(files)
    }
}

struct ArchiveSource {
    path: PathBuf,
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveSource {
    fn open(path: &Path) -> Result<Self, BundleError> {
        let file = File::open(path).at(path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().at(path)? {
            let mut entry = entry.at(path)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path().at(path)?.to_string_lossy().replace('\\', "/");
            let name = name.trim_start_matches("./").to_owned();
            if !is_safe_relative(&name) {
                return Err(BundleError::UnsafePath(name));
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data).at(path)?;
            entries.insert(name, data);
        }
        // Tolerate archives that wrap the bundle in one top-level directory.
        if !entries.contains_key(DESCRIPTOR_FILE) {
            let prefixes: Vec<String> = entries
                .keys()
                .filter_map(|k| k.strip_suffix(&format!("/{DESCRIPTOR_FILE}")))
                .filter(|p| !p.contains('/'))
                .map(|p| format!("{p}/"))
                .collect();
            if let [prefix] = prefixes.as_slice() {
                entries = entries
                    .into_iter()
                    .filter_map(|(k, v)| k.strip_prefix(prefix.as_str()).map(|s| (s.to_owned(), v)))
                    .collect();
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }
}

impl BundleSource for ArchiveSource {
    fn origin(&self) -> &Path {
        &self.path
    }

    fn read(&self, rel: &str) -> Result<Option<Vec<u8>>, BundleError> {
        Ok(self.entries.get(rel).cloned())
    }

    fn read_module(&self, rel_dir: &str) -> Result<Vec<(String, Vec<u8>)>, BundleError> {
        let prefix = format!("{rel_dir}/");
        let nested_root = |rel: &str| {
            rel.match_indices('/').any(|(i, _)| {
                self.entries
                    .contains_key(&format!("{prefix}{}/{MODULE_DESCRIPTOR}", &rel[..i]))
            })
        };
        Ok(self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (&k[prefix.len()..], v))
            .filter(|&(rel, _)| !nested_root(rel) && !rel.ends_with(TOMBSTONE))
            .map(|(rel, v)| (rel.to_owned(), v.clone()))
            .collect())
    }
}

fn load(src: &dyn BundleSource) -> Result<PatchBundle, BundleError> {
    let raw = src
        .read(DESCRIPTOR_FILE)?
        .ok_or_else(|| BundleError::MissingDescriptor(src.origin().to_path_buf()))?;
    let descriptor: PatchDescriptor = serde_json::from_slice(&raw)?;
    descriptor.validate()?;

    let mut content = BundleContent::default();
    for m in &descriptor.misc {
        let (Some(expected), ContentTarget::Misc { path }) = (m.item.new_hash, m.target()) else {
            continue;
        };
        let location = misc_location(path);
        let bytes = src.read(&location)?.ok_or_else(|| BundleError::MissingContent {
            target: m.target().to_string(),
            location: location.clone(),
        })?;
        content
            .put_file_verified(expected, &bytes)
            .map_err(|err| match err {
                CasError::HashMismatch { computed, .. } => BundleError::HashMismatch {
                    target: m.target().to_string(),
                    expected,
                    computed: Some(computed),
                },
                other => BundleError::Cas(other),
            })?;
    }
    for element in &descriptor.elements {
        for m in &element.modifications {
            let Some(expected) = m.item.new_hash else { continue };
            let location = module_location(element, m.target());
            let files = src.read_module(&location)?;
            if files.is_empty() {
                return Err(BundleError::MissingContent {
                    target: m.target().to_string(),
                    location,
                });
            }
            let computed = content.put_module(files);
            if computed != Some(expected) {
                return Err(BundleError::HashMismatch {
                    target: m.target().to_string(),
                    expected,
                    computed,
                });
            }
        }
    }
    debug!(
        patch_id = %descriptor.patch_id,
        blobs = content.blob_count(),
        bytes = content.blobs.byte_count(),
        "bundle loaded"
    );
    Ok(PatchBundle {
        descriptor,
        content,
    })
}

/// Read a bundle from a directory or a `.tar.gz`/`.tgz` archive.
pub fn read_bundle(path: &Path) -> Result<PatchBundle, BundleError> {
    if path.is_dir() {
        load(&DirSource {
            root: path.to_path_buf(),
        })
    } else if is_archive(path) {
        load(&ArchiveSource::open(path)?)
    } else {
        Err(BundleError::UnknownFormat(path.to_path_buf()))
    }
}

fn bundle_entries(bundle: &PatchBundle) -> Result<Vec<(String, Arc<[u8]>)>, BundleError> {
    let descriptor = &bundle.descriptor;
    let mut entries: Vec<(String, Arc<[u8]>)> = vec![(
        DESCRIPTOR_FILE.to_owned(),
        Arc::from(serde_json::to_vec_pretty(descriptor)?),
    )];
    let missing = |m: &Modification| BundleError::MissingContent {
        target: m.target().to_string(),
        location: "bundle content".into(),
    };
    for m in &descriptor.misc {
        if let (Some(hash), ContentTarget::Misc { path }) = (m.item.new_hash, m.target()) {
            let bytes = bundle.content.file(&hash).ok_or_else(|| missing(m))?;
            entries.push((misc_location(path), bytes));
        }
    }
    for element in &descriptor.elements {
        for m in &element.modifications {
            let Some(hash) = m.item.new_hash else { continue };
            let base = module_location(element, m.target());
            let files = bundle.content.module_files(&hash).ok_or_else(|| missing(m))?;
            entries.extend(files.into_iter().map(|(rel, b)| (format!("{base}/{rel}"), b)));
        }
    }
    Ok(entries)
}

/// Write `bundle` to a directory, or to an archive when `path` ends in
/// `.tar.gz`/`.tgz`. Refuses to overwrite an existing path.
pub fn write_bundle(bundle: &PatchBundle, path: &Path) -> Result<(), BundleError> {
    bundle.verify()?;
    if path.exists() {
        return Err(BundleError::Exists(path.to_path_buf()));
    }
    let entries = bundle_entries(bundle)?;
    if is_archive(path) {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(parent).at(parent)?;
        let mut builder = tar::Builder::new(GzEncoder::new(tmp, Compression::default()));
        for (name, data) in &entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, &data[..]).at(path)?;
        }
        let mut tmp = builder.into_inner().at(path)?.finish().at(path)?;
        tmp.flush().at(path)?;
        tmp.persist(path).map_err(|e| e.error).at(path)?;
    } else {
        for (name, data) in &entries {
            let file = path.join(name);
            if let Some(dir) = file.parent() {
                fs::create_dir_all(dir).at(dir)?;
            }
            fs::write(&file, data).at(&file)?;
        }
    }
    debug!(patch_id = %bundle.patch_id(), path = %path.display(), "bundle written");
    Ok(())
}

/// Programmatic bundle authoring.
///
/// Each call records one modification from the given current hash to the
/// hash of the given content; calls whose hashes are equal are skipped.
#[derive(Debug, Clone)]
pub struct PatchBundleBuilder {
    descriptor: PatchDescriptor,
    content: BundleContent,
}

impl PatchBundleBuilder {
    fn new(patch_id: &str, kind: PatchKind, identity: PatchIdentity) -> Self {
        Self {
            descriptor: PatchDescriptor {
                patch_id: patch_id.to_owned(),
                description: String::new(),
                kind,
                identity,
                elements: Vec::new(),
                misc: Vec::new(),
            },
            content: BundleContent::default(),
        }
    }

    /// Start a one-off patch for `product` at `version`.
    pub fn one_off(patch_id: &str, product: &str, version: &str) -> Self {
        Self::new(
            patch_id,
            PatchKind::OneOff,
            PatchIdentity {
                product_name: product.to_owned(),
                from_version: version.to_owned(),
                to_version: None,
            },
        )
    }

    /// Start a cumulative patch upgrading `product` from `from` to `to`.
    pub fn cumulative(patch_id: &str, product: &str, from: &str, to: &str) -> Self {
        Self::new(
            patch_id,
            PatchKind::Cumulative,
            PatchIdentity {
                product_name: product.to_owned(),
                from_version: from.to_owned(),
                to_version: Some(to.to_owned()),
            },
        )
    }

    /// Set the description.
    pub fn description(mut self, text: &str) -> Self {
        text.clone_into(&mut self.descriptor.description);
        self
    }

    /// Change misc file `path` from `existing` to `content` (`None` removes it).
    pub fn misc(mut self, path: &str, existing: Option<ContentHash>, content: Option<&[u8]>) -> Self {
        let new = content.map(|bytes| self.content.put_file(bytes));
        if let Some(m) = Modification::net(ContentTarget::misc(path), existing, new) {
            self.descriptor.misc.push(m);
        }
        self
    }

    /// Add a misc file that must not exist yet.
    pub fn add_misc(self, path: &str, content: impl AsRef<[u8]>) -> Self {
        self.misc(path, None, Some(content.as_ref()))
    }

    /// Replace a misc file currently hashing to `existing`.
    pub fn modify_misc(self, path: &str, existing: ContentHash, content: impl AsRef<[u8]>) -> Self {
        self.misc(path, Some(existing), Some(content.as_ref()))
    }

    /// Remove a misc file currently hashing to `existing`.
    pub fn remove_misc(self, path: &str, existing: ContentHash) -> Self {
        self.misc(path, Some(existing), None)
    }

    /// Change module `name:slot` in `layer` from `existing` to `files`
    /// (`None` removes it).
    pub fn module<P, B, I>(
        mut self,
        layer: &str,
        name: &str,
        slot: &str,
        existing: Option<ContentHash>,
        files: Option<I>,
    ) -> Self
    where
        P: Into<String>,
        B: AsRef<[u8]>,
        I: IntoIterator<Item = (P, B)>,
    {
        let new = files.and_then(|f| self.content.put_module(f));
        let Some(m) = Modification::net(ContentTarget::module(layer, name, slot), existing, new) else {
            return self;
        };
        let patch_id = &self.descriptor.patch_id;
        if let Some(element) = self.descriptor.elements.iter_mut().find(|e| e.layer == layer) {
            element.modifications.push(m);
        } else {
            self.descriptor.elements.push(PatchElement {
                element_id: format!("{layer}-{patch_id}"),
                layer: layer.to_owned(),
                modifications: vec![m],
            });
        }
        self
    }

    /// Add a module slot that must not exist yet.
    pub fn add_module<P, B>(
        self,
        layer: &str,
        name: &str,
        slot: &str,
        files: impl IntoIterator<Item = (P, B)>,
    ) -> Self
    where
        P: Into<String>,
        B: AsRef<[u8]>,
    {
        self.module(layer, name, slot, None, Some(files))
    }

    /// Replace a module slot currently hashing to `existing`.
    pub fn modify_module<P, B>(
        self,
        layer: &str,
        name: &str,
        slot: &str,
        existing: ContentHash,
        files: impl IntoIterator<Item = (P, B)>,
    ) -> Self
    where
        P: Into<String>,
        B: AsRef<[u8]>,
    {
        self.module(layer, name, slot, Some(existing), Some(files))
    }

    /// Remove a module slot currently hashing to `existing`.
    pub fn remove_module(self, layer: &str, name: &str, slot: &str, existing: ContentHash) -> Self {
        self.module::<String, Vec<u8>, Vec<(String, Vec<u8>)>>(layer, name, slot, Some(existing), None)
    }

    /// Finish and verify the bundle.
    pub fn build(self) -> Result<PatchBundle, BundleError> {
        let bundle = PatchBundle {
            descriptor: self.descriptor,
            content: self.content,
        };
        bundle.verify()?;
        Ok(bundle)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use strata_cas::content_hash;

    fn sample() -> PatchBundle {
        PatchBundleBuilder::one_off("oneoff-1", "Product", "1.0.0")
            .description("sample")
            .add_misc("awesomeDirectory/awesomeFile", "test content")
            .add_module(
                "base",
                "org.example.core",
                "main",
                [("module.xml", "<module/>"), ("lib/core.jar", "core-1")],
            )
            .build()
            .unwrap()
    }

    #[test]
    fn builder_groups_modules_per_layer() {
        let bundle = PatchBundleBuilder::cumulative("cp1", "Product", "1.0.0", "1.0.1")
            .add_module("base", "org.a", "main", [("module.xml", "a")])
            .add_module("base", "org.b", "main", [("module.xml", "b")])
            .build()
            .unwrap();
        assert_eq!(bundle.descriptor.elements.len(), 1);
        assert_eq!(bundle.descriptor.elements[0].element_id, "base-cp1");
        assert_eq!(bundle.descriptor.elements[0].modifications.len(), 2);
    }

    #[test]
    fn directory_round_trip_preserves_descriptor_and_content() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("bundle");
        let bundle = sample();
        write_bundle(&bundle, &out).unwrap();
        assert!(out.join("patch.json").is_file());
        assert_eq!(
            fs::read(out.join("misc/awesomeDirectory/awesomeFile")).unwrap(),
            b"test content"
        );
        assert!(out
            .join("base-oneoff-1/modules/org/example/core/main/lib/core.jar")
            .is_file());

        let back = read_bundle(&out).unwrap();
        assert_eq!(back.descriptor, bundle.descriptor);
        assert!(back.verify().is_ok());
    }

    #[test]
    fn archive_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("oneoff-1.tar.gz");
        let bundle = sample();
        write_bundle(&bundle, &out).unwrap();
        let back = read_bundle(&out).unwrap();
        assert_eq!(back.descriptor, bundle.descriptor);
        let misc_hash = content_hash(b"test content");
        assert_eq!(&*back.content.file(&misc_hash).unwrap(), b"test content");
    }

    #[test]
    fn nested_module_files_stay_out_of_the_declared_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("bundle");
        let bundle = PatchBundleBuilder::one_off("p1", "Product", "1.0.0")
            .add_module(
                "base",
                "org.p",
                "main",
                [
                    ("module.xml", "<module/>"),
                    ("sub/module.xml", "<module name=\"org.p.sub\"/>"),
                    ("sub/s.jar", "s"),
                ],
            )
            .build()
            .unwrap();
        let declared = bundle.descriptor.elements[0].modifications[0].item.new_hash;
        write_bundle(&bundle, &out).unwrap();

        let written = out.join("base-p1/modules/org/p/main");
        assert!(!written.join("sub").exists());
        assert_eq!(hashing::module_hash(&written).unwrap(), declared);
        let back = read_bundle(&out).unwrap();
        assert_eq!(back.descriptor, bundle.descriptor);
    }

    #[test]
    fn tampered_content_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("bundle");
        write_bundle(&sample(), &out).unwrap();
        fs::write(out.join("misc/awesomeDirectory/awesomeFile"), "tampered").unwrap();
        assert!(matches!(
            read_bundle(&out),
            Err(BundleError::HashMismatch { .. })
        ));
    }

    #[test]
    fn missing_module_content_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("bundle");
        write_bundle(&sample(), &out).unwrap();
        fs::remove_dir_all(out.join("base-oneoff-1")).unwrap();
        assert!(matches!(
            read_bundle(&out),
            Err(BundleError::MissingContent { .. })
        ));
    }

    #[test]
    fn write_refuses_existing_output() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            write_bundle(&sample(), tmp.path()),
            Err(BundleError::Exists(_))
        ));
    }
}
