//! `spw snapshot`: read-only inspection of stored snapshots.

use std::io::{self, Write};
use std::path::Path;

use clap::Subcommand;
use serde::Serialize;
use spillway_core::error::ErrorCode;
use spillway_core::lock::{DEFAULT_LOCK_TIMEOUT, LockGuard, LockMode, lock_path_for};
use spillway_core::model::{CycleKey, ItemId, SnapshotKey};
use spillway_core::snapshot::{SnapshotMeta, SnapshotStore};

use super::{fail, load_project};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Show one snapshot's metadata and committed items.
    Show {
        /// Group name (case-sensitive).
        group: String,
        /// Cycle key, C1..C6.
        cycle: CycleKey,
    },
    /// List every stored snapshot.
    List,
}

#[derive(Debug, Serialize)]
struct SnapshotView {
    group: String,
    cycle: CycleKey,
    #[serde(flatten)]
    meta: SnapshotMeta,
    members: Vec<ItemId>,
}

#[derive(Debug, Serialize)]
struct SnapshotRow {
    group: String,
    cycle: CycleKey,
    #[serde(flatten)]
    meta: SnapshotMeta,
}

/// Execute `spw snapshot <subcommand>`.
pub fn run_snapshot(
    command: &SnapshotCommand,
    output: OutputMode,
    project_root: &Path,
) -> anyhow::Result<()> {
    let (_config, paths) = load_project(output, project_root)?;
    if !paths.database.exists() {
        return match command {
            SnapshotCommand::List => render_list(output, &[]),
            SnapshotCommand::Show { .. } => Err(fail(
                output,
                format!("no snapshot database at {}", paths.database.display()),
                ErrorCode::SnapshotReadFailed,
            )),
        };
    }

    let lock_path = lock_path_for(&paths.database);
    let _lock = LockGuard::acquire(&lock_path, LockMode::Shared, DEFAULT_LOCK_TIMEOUT)
        .map_err(|err| fail(output, err.to_string(), err.code()))?;
    let store = SnapshotStore::open(&paths.database)
        .map_err(|err| fail(output, format!("{err:#}"), ErrorCode::SnapshotReadFailed))?;

    match command {
        SnapshotCommand::Show { group, cycle } => show(&store, group, *cycle, output),
        SnapshotCommand::List => {
            let rows: Vec<SnapshotRow> = store
                .list_meta()
                .map_err(|err| fail(output, err.to_string(), err.code()))?
                .into_iter()
                .map(|(key, meta)| SnapshotRow {
                    group: key.group,
                    cycle: key.cycle,
                    meta,
                })
                .collect();
            render_list(output, &rows)
        }
    }
}

fn show(store: &SnapshotStore, group: &str, cycle: CycleKey, output: OutputMode) -> anyhow::Result<()> {
    let key = SnapshotKey::new(group, cycle);
    let meta = store
        .get_meta(&key)
        .map_err(|err| fail(output, err.to_string(), err.code()))?
        .ok_or_else(|| fail(output, format!("no snapshot for {key}"), ErrorCode::SnapshotReadFailed))?;
    let members = store
        .get_members(&key)
        .map_err(|err| fail(output, err.to_string(), err.code()))?;

    let view = SnapshotView {
        group: key.group,
        cycle,
        meta,
        members: members.into_iter().collect(),
    };
    render_mode(output, &view, render_show_text, render_show_pretty)
}

fn render_list(output: OutputMode, rows: &[SnapshotRow]) -> anyhow::Result<()> {
    render_mode(output, &rows, render_list_text, render_list_pretty)
}

fn frozen_label(meta: &SnapshotMeta) -> String {
    meta.frozen_at
        .map_or_else(|| "no".to_string(), |at| format!("yes ({})", at.to_rfc3339()))
}

fn render_show_text(view: &SnapshotView, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "{}\t{}\t{}\t{}",
        view.group,
        view.cycle,
        view.meta.committed_count,
        if view.meta.frozen { "frozen" } else { "open" }
    )?;
    for member in &view.members {
        writeln!(w, "{member}")?;
    }
    Ok(())
}

fn render_show_pretty(view: &SnapshotView, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("Snapshot {}/{}", view.group, view.cycle))?;
    pretty_kv(w, "Committed", view.meta.committed_count.to_string())?;
    pretty_kv(w, "Frozen", frozen_label(&view.meta))?;
    pretty_kv(w, "Refreshed", view.meta.last_refresh_at.to_rfc3339())?;
    writeln!(w)?;
    for member in &view.members {
        writeln!(w, "  {member}")?;
    }
    Ok(())
}

fn render_list_text(rows: &&[SnapshotRow], w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "group\tcycle\tcommitted\tfrozen\tlast_refresh_at")?;
    for row in rows.iter() {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}",
            row.group,
            row.cycle,
            row.meta.committed_count,
            row.meta.frozen,
            row.meta.last_refresh_at.to_rfc3339()
        )?;
    }
    Ok(())
}

fn render_list_pretty(rows: &&[SnapshotRow], w: &mut dyn Write) -> io::Result<()> {
    if rows.is_empty() {
        return writeln!(w, "No snapshots recorded yet.");
    }
    pretty_section(w, "Snapshots")?;
    for row in rows.iter() {
        writeln!(
            w,
            "  {:<16} {:<3} {:>5} items  frozen: {}",
            row.group,
            row.cycle.as_str(),
            row.meta.committed_count,
            frozen_label(&row.meta)
        )?;
    }
    Ok(())
}
