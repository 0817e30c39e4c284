//! `spw run`: observe every configured cycle, settle snapshots, report KPIs.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Args;
use spillway_core::calendar::CalendarSet;
use spillway_core::error::ErrorCode;
use spillway_core::kpi::{CycleKpi, GroupReport, KpiCalculator, RunReport};
use spillway_core::lock::{DEFAULT_LOCK_TIMEOUT, LockGuard, LockMode, lock_path_for};
use spillway_core::model::CycleKey;
use spillway_core::snapshot::SnapshotStore;
use spillway_core::upstream::{CachedUpstream, FixtureUpstream};
use tracing::info;

use super::{fail, load_project};
use crate::output::{OutputMode, pretty_kv, pretty_rule, pretty_section, render_mode};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Only compute this group (repeatable). Defaults to every calendar group.
    #[arg(long = "group", short = 'g')]
    pub groups: Vec<String>,

    /// Headline this cycle instead of the configured or current one.
    #[arg(long)]
    pub cycle: Option<CycleKey>,

    /// Evaluate as of an RFC 3339 instant instead of now.
    #[arg(long, value_parser = parse_instant)]
    pub at: Option<DateTime<Utc>>,
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC 3339 timestamp: {err}"))
}

/// Execute `spw run`.
pub async fn run_run(args: &RunArgs, output: OutputMode, project_root: &Path) -> anyhow::Result<()> {
    let (mut config, paths) = load_project(output, project_root)?;
    if let Some(cycle) = args.cycle {
        config.report.headline_cycle = Some(cycle);
    }

    let calendars = CalendarSet::load(&paths.calendar)
        .map_err(|err| fail(output, err.to_string(), err.code()))?;

    let Some(fixture_path) = paths.upstream_fixture.as_deref() else {
        return Err(fail(
            output,
            "no upstream configured; set [paths] upstream_fixture",
            ErrorCode::ConfigParseError,
        ));
    };
    let fixture = FixtureUpstream::load(fixture_path)
        .map_err(|err| fail(output, format!("{err:#}"), ErrorCode::UpstreamFetchFailed))?;
    let upstream = CachedUpstream::new(fixture, config.cache.ttl());

    let _lock = acquire_run_lock(output, lock_path_for(&paths.database)).await?;
    let store = SnapshotStore::open(&paths.database)
        .map_err(|err| fail(output, format!("{err:#}"), ErrorCode::SnapshotReadFailed))?;

    let calculator = KpiCalculator::new(upstream, Arc::new(store), calendars, &config);
    let now = args.at.unwrap_or_else(Utc::now);
    let report = if args.groups.is_empty() {
        calculator.run_all(now).await
    } else {
        calculator.run(&args.groups, now).await
    };

    let stats = calculator.upstream().stats();
    info!(
        groups = report.groups.len(),
        partial = report.is_partial(),
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        "run complete"
    );

    render_mode(output, &report, render_run_text, render_run_pretty)
}

/// Lock acquisition sleeps between attempts, so it runs off the async workers.
async fn acquire_run_lock(output: OutputMode, lock_path: PathBuf) -> anyhow::Result<LockGuard> {
    tokio::task::spawn_blocking(move || {
        LockGuard::acquire(&lock_path, LockMode::Exclusive, DEFAULT_LOCK_TIMEOUT)
    })
    .await
    .map_err(|err| {
        fail(
            output,
            format!("lock task failed: {err}"),
            ErrorCode::InternalUnexpected,
        )
    })?
    .map_err(|err| fail(output, err.to_string(), err.code()))
}

const fn state(kpi: &CycleKpi) -> &'static str {
    if kpi.error.is_some() {
        "error"
    } else if kpi.frozen {
        "frozen"
    } else if kpi.active {
        "active"
    } else {
        "open"
    }
}

fn render_run_text(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "group\tcycle\tcommitted\tcompleted\tdelivery_pct\tspillover\tstate\theadline"
    )?;
    for group in &report.groups {
        if let Some(reason) = &group.skipped {
            writeln!(w, "{}\t-\t-\t-\t-\t-\tskipped\t{reason}", group.group)?;
            continue;
        }
        for kpi in &group.cycles {
            let headline = if group.headline == Some(kpi.cycle) { "*" } else { "" };
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{headline}",
                group.group,
                kpi.cycle,
                kpi.committed,
                kpi.completed,
                kpi.delivery_pct,
                kpi.spillover,
                state(kpi),
            )?;
        }
    }
    Ok(())
}

fn render_run_pretty(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_kv(w, "As of", report.generated_at.to_rfc3339())?;
    pretty_kv(w, "Freeze", format!("after {} ends", report.freeze_threshold))?;
    writeln!(w)?;

    for group in &report.groups {
        render_group_pretty(group, w)?;
        writeln!(w)?;
    }

    if report.is_partial() {
        writeln!(w, "Partial run: some groups or cycles could not be computed.")?;
    }
    Ok(())
}

fn render_group_pretty(group: &GroupReport, w: &mut dyn Write) -> io::Result<()> {
    if let Some(reason) = &group.skipped {
        pretty_section(w, &format!("{} (skipped)", group.group))?;
        writeln!(w, "  {reason}")?;
        return Ok(());
    }

    let heading = match group.headline_kpi() {
        Some(kpi) => format!(
            "{}: {} delivered {}% ({}/{}), spillover {}",
            group.group, kpi.cycle, kpi.delivery_pct, kpi.completed, kpi.committed, kpi.spillover
        ),
        None => group.group.clone(),
    };
    pretty_section(w, &heading)?;
    writeln!(
        w,
        "  {:<6} {:>9} {:>9} {:>8} {:>9}  {}",
        "cycle", "committed", "completed", "delivery", "spillover", "state"
    )?;
    for kpi in &group.cycles {
        let marker = if group.headline == Some(kpi.cycle) { '>' } else { ' ' };
        writeln!(
            w,
            "{marker} {:<6} {:>9} {:>9} {:>7}% {:>9}  {}",
            kpi.cycle.as_str(),
            kpi.committed,
            kpi.completed,
            kpi.delivery_pct,
            kpi.spillover,
            state(kpi),
        )?;
    }

    if !group.warnings.is_empty() || !group.errors.is_empty() {
        pretty_rule(w)?;
    }
    for warning in &group.warnings {
        writeln!(w, "  warning: {warning}")?;
    }
    for error in &group.errors {
        writeln!(w, "  error:   {error}")?;
    }
    Ok(())
}
