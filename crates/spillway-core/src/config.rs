use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::CycleKey;

/// Environment override for [`PolicyConfig::freeze_threshold`].
pub const ENV_FREEZE_THRESHOLD: &str = "SPILLWAY_FREEZE_THRESHOLD";

/// Environment override for [`ReportConfig::headline_cycle`].
pub const ENV_HEADLINE_CYCLE: &str = "SPILLWAY_HEADLINE_CYCLE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpillwayConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Last cycle of the shared early-cycle grace window.
    #[serde(default = "default_freeze_threshold")]
    pub freeze_threshold: CycleKey,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            freeze_threshold: default_freeze_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    #[serde(default)]
    pub headline_cycle: Option<CycleKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelConfig {
    #[serde(default = "default_cancelled_label")]
    pub cancelled: String,
    /// Label name marking membership in each cycle.
    #[serde(default = "default_cycle_labels")]
    pub cycles: BTreeMap<CycleKey, String>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            cancelled: default_cancelled_label(),
            cycles: default_cycle_labels(),
        }
    }
}

impl LabelConfig {
    /// Label name for `cycle`, falling back to `cycle-N` when the config
    /// only overrides some cycles.
    #[must_use]
    pub fn cycle_label(&self, cycle: CycleKey) -> String {
        self.cycles
            .get(&cycle)
            .cloned()
            .unwrap_or_else(|| default_cycle_label(cycle))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_calendar_path")]
    pub calendar: PathBuf,
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    #[serde(default)]
    pub upstream_fixture: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            calendar: default_calendar_path(),
            database: default_database_path(),
            upstream_fixture: None,
        }
    }
}

impl PathsConfig {
    /// Resolve relative paths against `root`.
    #[must_use]
    pub fn resolved(&self, root: &Path) -> Self {
        let join = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };
        Self {
            calendar: join(&self.calendar),
            database: join(&self.database),
            upstream_fixture: self.upstream_fixture.as_deref().map(join),
        }
    }
}

/// Load `.spillway/config.toml` under `project_root`, or defaults if absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(project_root: &Path) -> Result<SpillwayConfig> {
    let path = project_root.join(".spillway/config.toml");
    if !path.exists() {
        return Ok(SpillwayConfig::default());
    }
    load_config_file(&path)
}

/// Load a config file from an explicit path.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config_file(path: &Path) -> Result<SpillwayConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<SpillwayConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load the config and apply environment overrides.
///
/// # Errors
///
/// Returns an error if the config cannot be loaded or an override names an
/// unknown cycle.
pub fn resolve_config(project_root: &Path) -> Result<SpillwayConfig> {
    let config = load_config(project_root)?;
    apply_env_overrides(
        config,
        env::var(ENV_FREEZE_THRESHOLD).ok(),
        env::var(ENV_HEADLINE_CYCLE).ok(),
    )
}

fn apply_env_overrides(
    mut config: SpillwayConfig,
    threshold: Option<String>,
    headline: Option<String>,
) -> Result<SpillwayConfig> {
    if let Some(raw) = threshold.as_deref().filter(|v| !v.trim().is_empty()) {
        config.policy.freeze_threshold = raw
            .parse()
            .with_context(|| format!("invalid {ENV_FREEZE_THRESHOLD}"))?;
    }
    if let Some(raw) = headline.as_deref().filter(|v| !v.trim().is_empty()) {
        config.report.headline_cycle = Some(
            raw.parse()
                .with_context(|| format!("invalid {ENV_HEADLINE_CYCLE}"))?,
        );
    }
    Ok(config)
}

const fn default_freeze_threshold() -> CycleKey {
    CycleKey::C2
}

fn default_cancelled_label() -> String {
    "cancelled".to_string()
}

fn default_cycle_label(cycle: CycleKey) -> String {
    format!("cycle-{}", cycle.index())
}

fn default_cycle_labels() -> BTreeMap<CycleKey, String> {
    CycleKey::ALL
        .into_iter()
        .map(|cycle| (cycle, default_cycle_label(cycle)))
        .collect()
}

const fn default_ttl_secs() -> u64 {
    300
}

fn default_calendar_path() -> PathBuf {
    PathBuf::from(".spillway/calendar.json")
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".spillway/snapshots.db")
}
