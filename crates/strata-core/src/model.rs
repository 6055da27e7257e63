// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Patch descriptors: content targets, modifications, elements.
//!
//! A [`PatchDescriptor`] is authored once (by a release build or by
//! [`crate::PatchBundleBuilder`]) and never mutated afterwards. Every
//! modification carries the hash its target must have before the patch is
//! applied and the hash it has afterwards, so patches chain explicitly:
//! `existing_hash` of patch N is `new_hash` of patch N-1.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use strata_cas::ContentHash;

/// Identity of one unit of content in an installation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentTarget {
    /// A file relative to the installation root, `/`-separated.
    Misc {
        /// Root-relative path.
        path: String,
    },
    /// A module slot directory inside a layer.
    Module {
        /// Layer holding the module.
        layer: String,
        /// Dotted module name (`org.example.core`).
        name: String,
        /// Module slot (`main`).
        slot: String,
    },
}

impl ContentTarget {
    /// Misc file target.
    pub fn misc(path: impl Into<String>) -> Self {
        Self::Misc { path: path.into() }
    }

    /// Module slot target.
    pub fn module(layer: impl Into<String>, name: impl Into<String>, slot: impl Into<String>) -> Self {
        Self::Module {
            layer: layer.into(),
            name: name.into(),
            slot: slot.into(),
        }
    }

    /// Layer for module targets.
    pub fn layer(&self) -> Option<&str> {
        match self {
            Self::Misc { .. } => None,
            Self::Module { layer, .. } => Some(layer),
        }
    }

    /// Path of the content relative to its root: the installation root for
    /// misc files, the layer (or overlay) directory for modules.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Self::Misc { path } => path.split('/').collect(),
            Self::Module { name, slot, .. } => {
                let mut p: PathBuf = name.split('.').collect();
                p.push(slot);
                p
            }
        }
    }

    /// Same as [`relative_path`](Self::relative_path), `/`-joined.
    pub fn relative_key(&self) -> String {
        match self {
            Self::Misc { path } => path.clone(),
            Self::Module { name, slot, .. } => format!("{}/{slot}", name.replace('.', "/")),
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Self::Misc { path } => {
                check_segments(path.split('/'))?;
                if path.split('/').next() == Some(crate::installation::METADATA_DIR) {
                    return Err("misc path inside installation metadata".into());
                }
                if path.starts_with(crate::installation::LAYERS_DIR) {
                    return Err("misc path inside the module layers".into());
                }
                Ok(())
            }
            Self::Module { layer, name, slot } => {
                check_token(layer).map_err(|e| format!("layer: {e}"))?;
                check_segments(name.split('.')).map_err(|e| format!("module name: {e}"))?;
                check_token(slot).map_err(|e| format!("slot: {e}"))
            }
        }
    }
}

impl fmt::Display for ContentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misc { path } => write!(f, "misc:{path}"),
            Self::Module { layer, name, slot } => write!(f, "module:{layer}:{name}:{slot}"),
        }
    }
}

fn check_token(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("empty".into());
    }
    if s.starts_with('.') {
        return Err(format!("{s:?} starts with '.'"));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!("{s:?} has characters outside [A-Za-z0-9._-]"));
    }
    Ok(())
}

fn check_segments<'a>(mut segments: impl Iterator<Item = &'a str>) -> Result<(), String> {
    segments.try_for_each(|seg| {
        if seg.is_empty() || seg == "." || seg == ".." {
            return Err(format!("bad path segment {seg:?}"));
        }
        if seg.contains(['/', '\\', ':', '\0']) {
            return Err(format!("bad character in segment {seg:?}"));
        }
        Ok(())
    })
}

/// A content target plus its before/after hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// What the item is.
    pub target: ContentTarget,
    /// Hash the content must have before applying; `None` = must not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_hash: Option<ContentHash>,
    /// Hash of the replacement content; `None` = removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<ContentHash>,
}

/// Kind of change a modification makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModificationType {
    /// Content did not exist and is created.
    Add,
    /// Content existed and is replaced.
    Modify,
    /// Content existed and is removed.
    Remove,
}

impl ModificationType {
    /// Type implied by a before/after hash pair. `None` for absent → absent.
    pub fn from_hashes(existing: Option<ContentHash>, new: Option<ContentHash>) -> Option<Self> {
        match (existing, new) {
            (None, Some(_)) => Some(Self::Add),
            (Some(_), Some(_)) => Some(Self::Modify),
            (Some(_), None) => Some(Self::Remove),
            (None, None) => None,
        }
    }
}

impl fmt::Display for ModificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Remove => "remove",
        })
    }
}

/// One change to one content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// The item being changed.
    pub item: ContentItem,
    /// Declared change kind; must agree with the item hashes.
    #[serde(rename = "type")]
    pub modification_type: ModificationType,
}

impl Modification {
    /// Build the modification that moves `target` from `existing` to `new`.
    ///
    /// Returns `None` when the pair is a no-op (equal hashes, including
    /// absent → absent).
    pub fn net(
        target: ContentTarget,
        existing: Option<ContentHash>,
        new: Option<ContentHash>,
    ) -> Option<Self> {
        if existing == new {
            return None;
        }
        let modification_type = ModificationType::from_hashes(existing, new)?;
        Some(Self {
            item: ContentItem {
                target,
                existing_hash: existing,
                new_hash: new,
            },
            modification_type,
        })
    }

    /// Shorthand for `self.item.target`.
    pub fn target(&self) -> &ContentTarget {
        &self.item.target
    }
}

/// Modifications scoped to one layer of the installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchElement {
    /// Element identifier; names the element's content directory in a bundle.
    pub element_id: String,
    /// Target layer.
    pub layer: String,
    /// Ordered module modifications.
    pub modifications: Vec<Modification>,
}

/// Whether a patch changes the installed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchKind {
    /// Leaves the installed version unchanged.
    OneOff,
    /// Upgrades the installed version.
    Cumulative,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OneOff => "one-off",
            Self::Cumulative => "cumulative",
        })
    }
}

/// Product stream and versions a patch applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchIdentity {
    /// Product stream name.
    pub product_name: String,
    /// Version the patch is authored against.
    pub from_version: String,
    /// Version after applying; cumulative patches only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_version: Option<String>,
}

impl PatchIdentity {
    /// Version installed after the patch is applied.
    pub fn resulting_version(&self) -> &str {
        self.to_version.as_deref().unwrap_or(&self.from_version)
    }
}

/// A named, versioned bundle of modifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    /// Unique patch identifier; also names overlay directories.
    pub patch_id: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// One-off or cumulative.
    pub kind: PatchKind,
    /// Stream and versions.
    pub identity: PatchIdentity,
    /// Per-layer module modifications.
    #[serde(default)]
    pub elements: Vec<PatchElement>,
    /// Identity-level modifications of misc files.
    #[serde(default)]
    pub misc: Vec<Modification>,
}

impl PatchDescriptor {
    /// Every modification: element modifications first (in element order),
    /// then misc.
    pub fn modifications(&self) -> impl Iterator<Item = &Modification> {
        self.elements
            .iter()
            .flat_map(|e| e.modifications.iter())
            .chain(self.misc.iter())
    }

    /// Element for `layer`, if the patch touches it.
    pub fn element(&self, layer: &str) -> Option<&PatchElement> {
        self.elements.iter().find(|e| e.layer == layer)
    }

    /// Layers touched by this patch, in element order.
    pub fn layers(&self) -> Vec<String> {
        self.elements.iter().map(|e| e.layer.clone()).collect()
    }

    /// Check the structural invariants of the descriptor.
    pub fn validate(&self) -> Result<(), ModelError> {
        let id = &self.patch_id;
        check_token(id).map_err(|reason| ModelError::InvalidPatchId {
            patch_id: id.clone(),
            reason,
        })?;
        if self.identity.product_name.is_empty() || self.identity.from_version.is_empty() {
            return Err(ModelError::Identity {
                patch_id: id.clone(),
                reason: "product name and from-version are required".into(),
            });
        }
        match (self.kind, &self.identity.to_version) {
            (PatchKind::Cumulative, None) => {
                return Err(ModelError::Identity {
                    patch_id: id.clone(),
                    reason: "cumulative patch without to-version".into(),
                })
            }
            (PatchKind::Cumulative, Some(to)) if *to == self.identity.from_version => {
                return Err(ModelError::Identity {
                    patch_id: id.clone(),
                    reason: format!("cumulative patch does not change version {to}"),
                })
            }
            (PatchKind::OneOff, Some(_)) => {
                return Err(ModelError::Identity {
                    patch_id: id.clone(),
                    reason: "one-off patch declares a to-version".into(),
                })
            }
            _ => {}
        }

        let mut layers = BTreeSet::new();
        let mut element_ids = BTreeSet::new();
        for element in &self.elements {
            check_token(&element.element_id).map_err(|reason| ModelError::InvalidTarget {
                target: format!("element {}", element.element_id),
                reason,
            })?;
            if !element_ids.insert(element.element_id.as_str()) || element.element_id == "misc" {
                return Err(ModelError::DuplicateElement(element.element_id.clone()));
            }
            if !layers.insert(element.layer.as_str()) {
                return Err(ModelError::DuplicateLayer(element.layer.clone()));
            }
            for m in &element.modifications {
                if m.target().layer() != Some(element.layer.as_str()) {
                    return Err(ModelError::TargetOutsideElement {
                        element: element.element_id.clone(),
                        target: m.target().to_string(),
                    });
                }
            }
        }
        if let Some(m) = self.misc.iter().find(|m| m.target().layer().is_some()) {
            return Err(ModelError::TargetOutsideElement {
                element: "misc".into(),
                target: m.target().to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        for m in self.modifications() {
            let target = m.target();
            target.check().map_err(|reason| ModelError::InvalidTarget {
                target: target.to_string(),
                reason,
            })?;
            if !seen.insert(target) {
                return Err(ModelError::DuplicateTarget(target.to_string()));
            }
            let implied = ModificationType::from_hashes(m.item.existing_hash, m.item.new_hash);
            if implied != Some(m.modification_type) {
                return Err(ModelError::TypeMismatch {
                    target: target.to_string(),
                    declared: m.modification_type,
                });
            }
        }
        Ok(())
    }
}

/// Structural problems in a patch descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Patch id is empty or not path-safe.
    #[error("[STRATA_INVALID_PATCH_ID] {patch_id:?}: {reason}")]
    InvalidPatchId {
        /// Offending id.
        patch_id: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Kind and identity disagree.
    #[error("[STRATA_INVALID_IDENTITY] {patch_id}: {reason}")]
    Identity {
        /// Patch id.
        patch_id: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Target path or name is not acceptable.
    #[error("[STRATA_INVALID_TARGET] {target}: {reason}")]
    InvalidTarget {
        /// Offending target.
        target: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Two elements share an id.
    #[error("[STRATA_DUPLICATE_ELEMENT] element {0} declared twice")]
    DuplicateElement(String),
    /// Two elements target the same layer.
    #[error("[STRATA_DUPLICATE_LAYER] layer {0} has more than one element")]
    DuplicateLayer(String),
    /// A modification sits in the wrong element (or misc list).
    #[error("[STRATA_TARGET_OUTSIDE_ELEMENT] {target} does not belong to {element}")]
    TargetOutsideElement {
        /// Element id (or `misc`).
        element: String,
        /// Offending target.
        target: String,
    },
    /// A target is modified twice in one patch.
    #[error("[STRATA_DUPLICATE_TARGET] {0} modified more than once")]
    DuplicateTarget(String),
    /// Declared type does not agree with the hashes.
    #[error("[STRATA_TYPE_MISMATCH] {target}: declared {declared} disagrees with its hashes")]
    TypeMismatch {
        /// Offending target.
        target: String,
        /// Declared type.
        declared: ModificationType,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use strata_cas::content_hash;

    fn one_off(mods: Vec<Modification>) -> PatchDescriptor {
        PatchDescriptor {
            patch_id: "oneoff-1".into(),
            description: String::new(),
            kind: PatchKind::OneOff,
            identity: PatchIdentity {
                product_name: "Product".into(),
                from_version: "1.0.0".into(),
                to_version: None,
            },
            elements: vec![],
            misc: mods,
        }
    }

    #[test]
    fn net_drops_no_ops_and_infers_type() {
        let h = content_hash(b"a");
        assert!(Modification::net(ContentTarget::misc("a"), Some(h), Some(h)).is_none());
        assert!(Modification::net(ContentTarget::misc("a"), None, None).is_none());
        let m = Modification::net(ContentTarget::misc("a"), None, Some(h)).unwrap();
        assert_eq!(m.modification_type, ModificationType::Add);
        let m = Modification::net(ContentTarget::misc("a"), Some(h), None).unwrap();
        assert_eq!(m.modification_type, ModificationType::Remove);
    }

    #[test]
    fn module_relative_path_splits_dotted_name() {
        let t = ContentTarget::module("base", "org.example.core", "main");
        assert_eq!(t.relative_key(), "org/example/core/main");
        assert_eq!(t.relative_path(), PathBuf::from("org/example/core/main"));
    }

    #[test]
    fn validate_rejects_traversal_and_metadata_paths() {
        let h = content_hash(b"x");
        for bad in ["../etc/passwd", "/abs", "a//b", ".installation/ledger.json", "modules/system/layers/base/x"] {
            let d = one_off(vec![Modification::net(ContentTarget::misc(bad), None, Some(h)).unwrap()]);
            assert!(
                matches!(d.validate(), Err(ModelError::InvalidTarget { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn validate_rejects_type_disagreeing_with_hashes() {
        let h = content_hash(b"x");
        let mut m = Modification::net(ContentTarget::misc("bin/run.sh"), None, Some(h)).unwrap();
        m.modification_type = ModificationType::Modify;
        assert!(matches!(
            one_off(vec![m]).validate(),
            Err(ModelError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn validate_checks_kind_identity_agreement() {
        let mut d = one_off(vec![]);
        d.kind = PatchKind::Cumulative;
        assert!(matches!(d.validate(), Err(ModelError::Identity { .. })));
        d.identity.to_version = Some("1.0.0".into());
        assert!(matches!(d.validate(), Err(ModelError::Identity { .. })));
        d.identity.to_version = Some("1.0.1".into());
        assert!(d.validate().is_ok());
    }

    #[test]
    fn validate_rejects_module_outside_its_layer() {
        let h = content_hash(b"x");
        let mut d = one_off(vec![]);
        d.elements.push(PatchElement {
            element_id: "base-oneoff-1".into(),
            layer: "base".into(),
            modifications: vec![Modification::net(
                ContentTarget::module("other", "org.a", "main"),
                None,
                Some(h),
            )
            .unwrap()],
        });
        assert!(matches!(
            d.validate(),
            Err(ModelError::TargetOutsideElement { .. })
        ));
    }

    #[test]
    fn descriptor_json_uses_kebab_case_tags() {
        let h = content_hash(b"x");
        let d = one_off(vec![Modification::net(ContentTarget::misc("README"), None, Some(h)).unwrap()]);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "one-off");
        assert_eq!(json["misc"][0]["type"], "add");
        assert_eq!(json["misc"][0]["item"]["target"]["type"], "misc");
        let back: PatchDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
