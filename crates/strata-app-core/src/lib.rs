// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for Strata tools (config port, settings).
//! Keeps the store and the CLI free of storage details.

pub mod config;
pub mod settings;
