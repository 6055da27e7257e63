// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Offline merging of consecutive patches into one.
//!
//! `merge(a, b)` produces a bundle whose effect on an installation equals
//! applying `a` then `b`: for every target the net modification runs from
//! `a`'s `existing_hash` to `b`'s `new_hash`, and targets that end where
//! they started are dropped.

use std::collections::BTreeMap;

use strata_cas::ContentHash;
use thiserror::Error;
use tracing::debug;

use crate::bundle::{BundleContent, BundleError, PatchBundle};
use crate::model::{
    ContentTarget, Modification, PatchDescriptor, PatchElement, PatchIdentity, PatchKind,
};

/// Reasons two bundles cannot be merged.
#[derive(Debug, Error)]
pub enum MergeError {
    /// No bundles were given.
    #[error("[STRATA_MERGE_EMPTY] nothing to merge")]
    Empty,
    /// Bundles belong to different products.
    #[error("[STRATA_MERGE_PRODUCT] {first} is for {first_product}, {second} is for {second_product}")]
    ProductMismatch {
        /// Earlier patch.
        first: String,
        /// Its product.
        first_product: String,
        /// Later patch.
        second: String,
        /// Its product.
        second_product: String,
    },
    /// The later bundle does not apply on top of the earlier one.
    #[error("[STRATA_MERGE_VERSION] {second} applies to {expected}, but {first} leaves {actual}")]
    VersionGap {
        /// Earlier patch.
        first: String,
        /// Later patch.
        second: String,
        /// Version the later patch expects.
        expected: String,
        /// Version the earlier patch results in.
        actual: String,
    },
    /// A cumulative result would start and end at the same version.
    #[error("[STRATA_MERGE_VERSION] merged patch would not change version {0}")]
    NoVersionChange(String),
    /// The later patch expects content the earlier one does not produce.
    #[error("[STRATA_MERGE_CHAIN] {target}: first patch leaves {produced:?}, second expects {expected:?}")]
    BrokenChain {
        /// Target where the chain breaks.
        target: String,
        /// `new_hash` of the earlier patch.
        produced: Option<ContentHash>,
        /// `existing_hash` of the later patch.
        expected: Option<ContentHash>,
    },
    /// Content missing or the result failed validation.
    #[error(transparent)]
    Bundle(#[from] BundleError),
}

struct Net {
    existing: Option<ContentHash>,
    new: Option<ContentHash>,
}

/// Merge `first` and the `second` patch authored on top of it.
pub fn merge(first: &PatchBundle, second: &PatchBundle) -> Result<PatchBundle, MergeError> {
    let a = &first.descriptor;
    let b = &second.descriptor;
    if a.identity.product_name != b.identity.product_name {
        return Err(MergeError::ProductMismatch {
            first: a.patch_id.clone(),
            first_product: a.identity.product_name.clone(),
            second: b.patch_id.clone(),
            second_product: b.identity.product_name.clone(),
        });
    }
    if b.identity.from_version != a.identity.resulting_version() {
        return Err(MergeError::VersionGap {
            first: a.patch_id.clone(),
            second: b.patch_id.clone(),
            expected: b.identity.from_version.clone(),
            actual: a.identity.resulting_version().to_owned(),
        });
    }

    let kind = if a.kind == PatchKind::Cumulative || b.kind == PatchKind::Cumulative {
        PatchKind::Cumulative
    } else {
        PatchKind::OneOff
    };
    let to_version = match kind {
        PatchKind::OneOff => None,
        PatchKind::Cumulative => {
            let to = b.identity.resulting_version();
            if to == a.identity.from_version {
                return Err(MergeError::NoVersionChange(to.to_owned()));
            }
            Some(to.to_owned())
        }
    };

    let mut order: Vec<ContentTarget> = Vec::new();
    let mut net: BTreeMap<ContentTarget, Net> = BTreeMap::new();
    for m in a.modifications() {
        order.push(m.target().clone());
        net.insert(
            m.target().clone(),
            Net {
                existing: m.item.existing_hash,
                new: m.item.new_hash,
            },
        );
    }
    for m in b.modifications() {
        match net.get_mut(m.target()) {
            Some(entry) => {
                if entry.new != m.item.existing_hash {
                    return Err(MergeError::BrokenChain {
                        target: m.target().to_string(),
                        produced: entry.new,
                        expected: m.item.existing_hash,
                    });
                }
                entry.new = m.item.new_hash;
            }
            None => {
                order.push(m.target().clone());
                net.insert(
                    m.target().clone(),
                    Net {
                        existing: m.item.existing_hash,
                        new: m.item.new_hash,
                    },
                );
            }
        }
    }

    let mut content = BundleContent::default();
    let mut elements: Vec<PatchElement> = Vec::new();
    let mut misc = Vec::new();
    for target in order {
        let Some(Net { existing, new }) = net.remove(&target) else { continue };
        let Some(modification) = Modification::net(target, existing, new) else {
            continue;
        };
        if let Some(hash) = new {
            let target = modification.target();
            if !content.import(&second.content, target, &hash)
                && !content.import(&first.content, target, &hash)
            {
                return Err(BundleError::MissingContent {
                    target: target.to_string(),
                    location: hash.to_hex(),
                }
                .into());
            }
        }
        let Some(layer) = modification.target().layer().map(str::to_owned) else {
            misc.push(modification);
            continue;
        };
        if let Some(element) = elements.iter_mut().find(|e| e.layer == layer) {
            element.modifications.push(modification);
        } else {
            let element_id = b
                .element(&layer)
                .or_else(|| a.element(&layer))
                .map_or_else(|| format!("{layer}-{}", b.patch_id), |e| e.element_id.clone());
            elements.push(PatchElement {
                element_id,
                layer,
                modifications: vec![modification],
            });
        }
    }

    let merged = PatchBundle {
        descriptor: PatchDescriptor {
            patch_id: b.patch_id.clone(),
            description: b.description.clone(),
            kind,
            identity: PatchIdentity {
                product_name: a.identity.product_name.clone(),
                from_version: a.identity.from_version.clone(),
                to_version,
            },
            elements,
            misc,
        },
        content,
    };
    merged.verify()?;
    debug!(
        first = %a.patch_id,
        second = %b.patch_id,
        modifications = merged.descriptor.modifications().count(),
        "patches merged"
    );
    Ok(merged)
}

/// Merge a sequence of consecutive patches, oldest first.
pub fn merge_all(bundles: &[PatchBundle]) -> Result<PatchBundle, MergeError> {
    let (head, rest) = bundles.split_first().ok_or(MergeError::Empty)?;
    rest.iter()
        .try_fold(head.clone(), |acc, next| merge(&acc, next))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bundle::PatchBundleBuilder;
    use crate::model::ModificationType;
    use strata_cas::content_hash;

    #[test]
    fn chained_modifications_collapse_to_one() {
        let a = PatchBundleBuilder::cumulative("cp1", "Product", "1.0.0", "1.0.1")
            .modify_misc("bin/run.sh", content_hash(b"v0"), "v1")
            .build()
            .unwrap();
        let b = PatchBundleBuilder::one_off("oneoff-1", "Product", "1.0.1")
            .modify_misc("bin/run.sh", content_hash(b"v1"), "v2")
            .add_misc("README", "hello")
            .build()
            .unwrap();
        let c = merge(&a, &b).unwrap();
        let d = &c.descriptor;
        assert_eq!(d.patch_id, "oneoff-1");
        assert_eq!(d.kind, PatchKind::Cumulative);
        assert_eq!(d.identity.from_version, "1.0.0");
        assert_eq!(d.identity.to_version.as_deref(), Some("1.0.1"));
        assert_eq!(d.misc.len(), 2);
        assert_eq!(d.misc[0].item.existing_hash, Some(content_hash(b"v0")));
        assert_eq!(d.misc[0].item.new_hash, Some(content_hash(b"v2")));
        assert!(c.content.file(&content_hash(b"v2")).is_some());
        assert!(c.content.file(&content_hash(b"v1")).is_none());
    }

    #[test]
    fn add_then_remove_drops_the_target() {
        let a = PatchBundleBuilder::one_off("a", "Product", "1.0.0")
            .add_module("base", "org.tmp", "main", [("module.xml", "t")])
            .add_misc("keep", "k")
            .build()
            .unwrap();
        let tmp_hash = a.descriptor.elements[0].modifications[0].item.new_hash.unwrap();
        let b = PatchBundleBuilder::one_off("b", "Product", "1.0.0")
            .remove_module("base", "org.tmp", "main", tmp_hash)
            .build()
            .unwrap();
        let c = merge(&a, &b).unwrap();
        assert!(c.descriptor.elements.is_empty());
        assert_eq!(c.descriptor.misc.len(), 1);
        assert_eq!(c.descriptor.misc[0].modification_type, ModificationType::Add);
    }

    #[test]
    fn remove_then_add_becomes_modify() {
        let old = content_hash(b"old");
        let a = PatchBundleBuilder::one_off("a", "Product", "1.0.0")
            .remove_misc("f", old)
            .build()
            .unwrap();
        let b = PatchBundleBuilder::one_off("b", "Product", "1.0.0")
            .add_misc("f", "new")
            .build()
            .unwrap();
        let c = merge(&a, &b).unwrap();
        assert_eq!(c.descriptor.misc[0].modification_type, ModificationType::Modify);
    }

    #[test]
    fn rejects_broken_chains_and_version_gaps() {
        let a = PatchBundleBuilder::one_off("a", "Product", "1.0.0")
            .add_misc("f", "one")
            .build()
            .unwrap();
        let b = PatchBundleBuilder::one_off("b", "Product", "1.0.0")
            .modify_misc("f", content_hash(b"other"), "two")
            .build()
            .unwrap();
        assert!(matches!(merge(&a, &b), Err(MergeError::BrokenChain { .. })));

        let late = PatchBundleBuilder::cumulative("cp2", "Product", "1.0.1", "1.0.2")
            .add_misc("g", "x")
            .build()
            .unwrap();
        assert!(matches!(merge(&a, &late), Err(MergeError::VersionGap { .. })));

        let elsewhere = PatchBundleBuilder::one_off("c", "Other", "1.0.0")
            .add_misc("g", "x")
            .build()
            .unwrap();
        assert!(matches!(
            merge(&a, &elsewhere),
            Err(MergeError::ProductMismatch { .. })
        ));
        assert!(matches!(merge_all(&[]), Err(MergeError::Empty)));
    }
}
