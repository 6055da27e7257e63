// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! strata-core: layered patch overlays with ordered history and rollback.
//!
//! An installation is mutated by a sequence of patches. One-off patches fix
//! individual items; cumulative patches move the installed version forward.
//! Module content lives in per-patch overlay directories stacked on top of
//! each layer, misc files are replaced in place with backups, and a ledger
//! records the order so patches can be unstacked strictly last-in first-out.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::path::Path;
//! use strata_core::{read_bundle, PatchStore, RollbackOptions};
//!
//! let mut store = PatchStore::open(Path::new("/opt/product"))?;
//! let bundle = read_bundle(Path::new("cp1.tar.gz"))?;
//! let applied = store.apply(&bundle)?;
//! println!("{} -> {}", applied.patch_id, applied.version);
//! store.rollback_last(&applied.stream, RollbackOptions::default())?;
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

pub mod bundle;
pub mod hashing;
pub mod installation;
pub mod ledger;
pub mod merge;
pub mod model;

mod error;
mod fsutil;
mod journal;
mod lock;
mod store;

pub use bundle::{read_bundle, write_bundle, BundleError, PatchBundle, PatchBundleBuilder};
pub use error::{ConflictItem, StoreError};
pub use installation::Installation;
pub use ledger::{HistoryEntry, Ledger, PatchInfo, VerbosePatchInfo};
pub use merge::{merge, merge_all, MergeError};
pub use model::{
    ContentHash, ContentItem, ContentTarget, Modification, ModificationType, PatchDescriptor,
    PatchElement, PatchIdentity, PatchKind,
};
pub use store::{
    AgedPatch, AgeoutReport, AppliedPatchRecord, PatchStore, RollbackOptions, RollbackRecord,
};
