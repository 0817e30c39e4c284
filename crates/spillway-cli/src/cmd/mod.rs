pub mod run;
pub mod snapshot;

use std::path::Path;

use spillway_core::config::{PathsConfig, SpillwayConfig, resolve_config};
use spillway_core::error::ErrorCode;

use crate::output::{CliError, OutputMode, render_error};

/// Print a structured error for `output` and hand back an error for `main`.
pub fn fail(output: OutputMode, message: impl Into<String>, code: ErrorCode) -> anyhow::Error {
    let error = CliError::with_code(message, code);
    if let Err(render_err) = render_error(output, &error) {
        tracing::warn!(error = %render_err, "failed to render error");
    }
    anyhow::anyhow!("{}: {}", code.code(), error.message)
}

/// Resolved config plus its paths anchored at the project root.
pub fn load_project(
    output: OutputMode,
    project_root: &Path,
) -> anyhow::Result<(SpillwayConfig, PathsConfig)> {
    let config = resolve_config(project_root)
        .map_err(|err| fail(output, format!("{err:#}"), ErrorCode::ConfigParseError))?;
    let paths = config.paths.resolved(project_root);
    Ok((config, paths))
}
