// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `strata`: operator CLI for patchable installations.
//!
//! # Usage
//! ```text
//! strata [--installation DIR] <command> [options]
//! ```
//!
//! Results go to stdout (JSON for machine-facing commands, a table for
//! `info`); logs go to stderr and follow `RUST_LOG`. `apply` and `rollback`
//! report failures as `{"outcome": "failed", ...}` and exit non-zero.

mod cli;
mod commands;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode> {
    let cli = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    commands::run(cli)
}
