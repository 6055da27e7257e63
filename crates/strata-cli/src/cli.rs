// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Apply, roll back and inspect layered patches",
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Installation root. Falls back to `STRATA_HOME`, then the user default.
    #[arg(long, global = true, env = "STRATA_HOME")]
    pub installation: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Prepare an installation root for patching.
    Init(InitArgs),
    /// Manage product streams.
    #[command(subcommand)]
    Stream(StreamCommand),
    /// Apply a patch bundle (directory or .tar.gz).
    Apply {
        /// Bundle path.
        bundle: PathBuf,
    },
    /// Roll back the most recent patch of a stream.
    Rollback(RollbackArgs),
    /// Show the installed version and active patches.
    Info(InfoArgs),
    /// Show applied patches, most recent first.
    History {
        /// Stream to report on; defaults to the installation's default stream.
        #[arg(long)]
        patch_stream: Option<String>,
    },
    /// List streams that have patch history.
    Streams,
    /// Prune content superseded by the latest cumulative patch.
    Ageout {
        /// Only this stream; all streams when omitted.
        #[arg(long)]
        patch_stream: Option<String>,
    },
    /// Merge consecutive bundles into one (no installation needed).
    Merge {
        /// Bundles, oldest first.
        #[arg(required = true, num_args = 2..)]
        bundles: Vec<PathBuf>,
        /// Output directory or .tar.gz path.
        #[arg(long)]
        out: PathBuf,
    },
    /// Print a bundle's descriptor.
    Inspect {
        /// Bundle path.
        bundle: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Base product name.
    #[arg(long)]
    pub product: String,
    /// Installed version of the base product.
    #[arg(long)]
    pub version: String,
    /// Layers patches may target (repeatable).
    #[arg(long = "layer")]
    pub layers: Vec<String>,
    /// Remember this installation as the user default.
    #[arg(long)]
    pub make_default: bool,
}

#[derive(Subcommand, Debug)]
pub enum StreamCommand {
    /// Register a product stream.
    Add {
        /// Product name used in patch identities.
        name: String,
        /// Installed version of the product.
        #[arg(long)]
        version: String,
    },
    /// Use a registered stream when a command names none.
    Default {
        /// Registered stream.
        name: String,
    },
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Patch to roll back; must be the most recent one.
    #[arg(long)]
    pub patch_id: Option<String>,
    /// Restore configuration directories captured when the patch was applied.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub reset_configuration: bool,
    /// Stream to roll back in.
    #[arg(long)]
    pub patch_stream: Option<String>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Stream to report on.
    #[arg(long)]
    pub patch_stream: Option<String>,
    /// Include per-layer overlays.
    #[arg(long)]
    pub verbose: bool,
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json_output: bool,
}
