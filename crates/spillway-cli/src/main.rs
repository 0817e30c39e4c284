#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{OutputMode, resolve_output_mode};
use std::env;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "spw: cycle snapshots, freeze policy, and spillover KPIs",
    long_about = None
)]
struct Cli {
    /// Output format (defaults to pretty on a TTY, text when piped).
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    /// Project root holding `.spillway/` (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Compute cycle KPIs and settle snapshots",
        long_about = "Observe every cycle of every calendar group, refresh or freeze \
                      snapshots according to the freeze policy, and report delivery \
                      and spillover.",
        after_help = "EXAMPLES:\n    # Run every group as of now\n    spw run\n\n    # One group, headlining C3\n    spw run --group Alpha --cycle C3\n\n    # Replay a past instant\n    spw run --at 2026-02-01T00:00:00Z --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        about = "Inspect stored snapshots",
        after_help = "EXAMPLES:\n    # List snapshots\n    spw snapshot list\n\n    # Show one snapshot's members\n    spw snapshot show Alpha C1"
    )]
    Snapshot {
        #[command(subcommand)]
        command: cmd::snapshot::SnapshotCommand,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SPILLWAY_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "spillway_core=debug,spw=debug,info"
        } else {
            "spillway_core=info,spw=info,warn"
        })
    });

    let format = env::var("SPILLWAY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // Logs go to stderr so stdout stays parseable in every output mode.
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let output = resolve_output_mode(cli.format, cli.json);
    let project_root = match cli.project {
        Some(path) => path,
        None => env::current_dir()?,
    };
    debug!(root = %project_root.display(), ?output, "resolved project");

    match cli.command {
        Commands::Run(ref args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(cmd::run::run_run(args, output, &project_root))
        }
        Commands::Snapshot { ref command } => {
            cmd::snapshot::run_snapshot(command, output, &project_root)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spillway_core::model::CycleKey;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "spw", "run", "--group", "Alpha", "-g", "Beta", "--cycle", "c3", "--at",
            "2026-02-01T00:00:00Z",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.groups, vec!["Alpha", "Beta"]);
        assert_eq!(args.cycle, Some(CycleKey::C3));
        assert!(args.at.is_some());
    }

    #[test]
    fn bad_cycle_is_rejected() {
        assert!(Cli::try_parse_from(["spw", "run", "--cycle", "C7"]).is_err());
        assert!(Cli::try_parse_from(["spw", "snapshot", "show", "Alpha", "C0"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["spw", "snapshot", "list", "--json", "--project", "/tmp/p"]);
        assert!(cli.json);
        assert_eq!(cli.project, Some(PathBuf::from("/tmp/p")));
        assert!(matches!(
            cli.command,
            Commands::Snapshot {
                command: cmd::snapshot::SnapshotCommand::List
            }
        ));
    }

    #[test]
    fn format_flag_parses_value_enum() {
        let cli = Cli::parse_from(["spw", "--format", "text", "run"]);
        assert_eq!(cli.format, Some(OutputMode::Text));
    }
}
