// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Command handlers.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde_json::{json, Value};
use strata_app_core::config::ConfigService;
use strata_app_core::settings::{StoreSettings, UserPrefs, USER_PREFS_KEY};
use strata_config_fs::FsConfigStore;
use strata_core::{
    merge_all, read_bundle, write_bundle, HistoryEntry, PatchInfo, PatchStore, RollbackOptions,
};
use tracing::{debug, info};

use crate::cli::{Cli, Command, InfoArgs, InitArgs, RollbackArgs, StreamCommand};

fn print_json(value: &Value) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn user_prefs() -> Result<ConfigService<FsConfigStore>> {
    Ok(ConfigService::new(
        FsConfigStore::new().context("resolving the user config directory")?,
    ))
}

fn resolve_root(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(root) = flag {
        return Ok(root);
    }
    let prefs: UserPrefs = user_prefs()?.load_or_default(USER_PREFS_KEY)?;
    match prefs.default_installation {
        Some(root) => {
            debug!(root = %root.display(), "using default installation");
            Ok(root)
        }
        None => bail!("no installation given: pass --installation or set STRATA_HOME"),
    }
}

fn open(flag: Option<PathBuf>) -> Result<PatchStore> {
    let root = resolve_root(flag)?;
    PatchStore::open(&root).with_context(|| format!("opening installation {}", root.display()))
}

fn stream_or_default(store: &PatchStore, stream: Option<String>) -> String {
    stream.unwrap_or_else(|| store.default_stream().to_owned())
}

/// Dispatch a parsed command line.
pub fn run(cli: Cli) -> Result<ExitCode> {
    let installation = cli.installation;
    match cli.command {
        Command::Init(args) => init(installation, args),
        Command::Stream(StreamCommand::Add { name, version }) => {
            let mut store = open(installation)?;
            store.register_stream(&name, &version)?;
            print_json(&json!({ "stream": name, "version": version }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stream(StreamCommand::Default { name }) => {
            let mut store = open(installation)?;
            store.set_default_stream(&name)?;
            print_json(&json!({ "default-stream": name }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Apply { bundle } => apply(installation, &bundle),
        Command::Rollback(args) => rollback(installation, args),
        Command::Info(args) => info_cmd(installation, args),
        Command::History { patch_stream } => {
            let store = open(installation)?;
            let stream = stream_or_default(&store, patch_stream);
            let entries: Vec<Value> = store.history(&stream)?.iter().map(history_json).collect();
            print_json(&Value::Array(entries))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Streams => {
            let store = open(installation)?;
            let mut out = io::stdout().lock();
            for name in store.stream_names() {
                writeln!(out, "{name}")?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Ageout { patch_stream } => {
            let mut store = open(installation)?;
            let report = store.ageout(patch_stream.as_deref())?;
            let aged: Vec<Value> = report
                .aged_out
                .iter()
                .map(|p| json!({ "patch-stream": p.stream, "patch-id": p.patch_id }))
                .collect();
            print_json(&json!({
                "aged-out": aged,
                "removed-items": report.removed_items,
                "removed-overlays": report.removed_overlays,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Merge { bundles, out } => merge_cmd(&bundles, &out),
        Command::Inspect { bundle } => {
            let bundle = read_bundle(&bundle)
                .with_context(|| format!("reading bundle {}", bundle.display()))?;
            print_json(&serde_json::to_value(&bundle.descriptor)?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init(installation: Option<PathBuf>, args: InitArgs) -> Result<ExitCode> {
    let Some(root) = installation else {
        bail!("init needs --installation or STRATA_HOME");
    };
    let mut settings = StoreSettings::default();
    if !args.layers.is_empty() {
        settings.layers = args.layers;
    }
    let store = PatchStore::init_with(&root, &args.product, &args.version, settings)
        .with_context(|| format!("initializing {}", root.display()))?;
    if args.make_default {
        user_prefs()?.update(USER_PREFS_KEY, |prefs: &mut UserPrefs| {
            prefs.default_installation = Some(root.clone());
        })?;
        info!(root = %root.display(), "saved as default installation");
    }
    print_json(&json!({
        "installation": root,
        "patch-stream": store.default_stream(),
        "version": args.version,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn failed(err: &anyhow::Error) -> Result<ExitCode> {
    print_json(&json!({
        "outcome": "failed",
        "failure-description": format!("{err:#}"),
    }))?;
    Ok(ExitCode::FAILURE)
}

fn apply(installation: Option<PathBuf>, path: &Path) -> Result<ExitCode> {
    let result = (|| -> Result<Value> {
        let mut store = open(installation)?;
        let bundle =
            read_bundle(path).with_context(|| format!("reading bundle {}", path.display()))?;
        let record = store.apply(&bundle)?;
        Ok(json!({
            "outcome": "success",
            "patch-id": record.patch_id,
            "patch-stream": record.stream,
            "version": record.version,
            "restart-required": record.restart_required,
        }))
    })();
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => failed(&err),
    }
}

fn rollback(installation: Option<PathBuf>, args: RollbackArgs) -> Result<ExitCode> {
    let result = (|| -> Result<Value> {
        let mut store = open(installation)?;
        let stream = stream_or_default(&store, args.patch_stream);
        let options = RollbackOptions {
            reset_configuration: args.reset_configuration,
        };
        let record = store.rollback(&stream, args.patch_id.as_deref(), options)?;
        Ok(json!({
            "outcome": "success",
            "patch-id": record.patch_id,
            "patch-stream": record.stream,
            "version": record.version,
            "configuration-reset": record.configuration_reset,
            "restart-required": record.restart_required,
        }))
    })();
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => failed(&err),
    }
}

fn info_json(info: &PatchInfo) -> Value {
    json!({
        "Version": info.version,
        "Cumulative patch ID": info.cumulative_patch_id,
        "One-off patches": info.one_off_patches,
    })
}

fn info_cmd(installation: Option<PathBuf>, args: InfoArgs) -> Result<ExitCode> {
    let store = open(installation)?;
    let stream = stream_or_default(&store, args.patch_stream);
    let verbose = store.info_verbose(&stream)?;
    let info = &verbose.info;

    if args.json_output {
        let mut value = info_json(info);
        if args.verbose {
            value["Layers"] = verbose
                .layers
                .iter()
                .map(|l| {
                    json!({
                        "Layer": l.layer,
                        "Cumulative patch ID": l.cumulative_patch_id,
                        "One-off patches": l.one_off_patches,
                    })
                })
                .collect();
        }
        print_json(&value)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![format!("Patch stream: {stream}"), String::new()]);
    table.add_row(vec!["Version", info.version.as_str()]);
    table.add_row(vec!["Cumulative patch ID", info.cumulative_patch_id.as_str()]);
    table.add_row(vec!["One-off patches".to_owned(), info.one_offs()]);
    if args.verbose {
        for layer in &verbose.layers {
            let one_offs = if layer.one_off_patches.is_empty() {
                "none".to_owned()
            } else {
                layer.one_off_patches.join(",")
            };
            table.add_row(vec![
                format!("Layer {}", layer.layer),
                format!("{} + {one_offs}", layer.cumulative_patch_id),
            ]);
        }
    }
    writeln!(io::stdout().lock(), "{table}")?;
    Ok(ExitCode::SUCCESS)
}

fn history_json(entry: &HistoryEntry) -> Value {
    json!({
        "patch-id": entry.patch_id,
        "type": entry.kind.to_string(),
        "applied-at": entry.applied_at,
        "version": entry.version_after,
        "aged-out": entry.aged_out,
    })
}

fn merge_cmd(paths: &[PathBuf], out: &Path) -> Result<ExitCode> {
    let bundles = paths
        .iter()
        .map(|p| read_bundle(p).with_context(|| format!("reading bundle {}", p.display())))
        .collect::<Result<Vec<_>>>()?;
    let merged = merge_all(&bundles)?;
    write_bundle(&merged, out).with_context(|| format!("writing {}", out.display()))?;
    let d = &merged.descriptor;
    print_json(&json!({
        "patch-id": d.patch_id,
        "type": d.kind.to_string(),
        "from-version": d.identity.from_version,
        "to-version": d.identity.to_version,
        "modifications": d.modifications().count(),
        "out": out,
    }))?;
    Ok(ExitCode::SUCCESS)
}
