//! Assembler configuration.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! the base layer; a user file overrides only the keys it names. Unknown keys
//! are rejected to catch typos early.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [paths]
//! working_dir = "working"     # Per-run scratch directories live here
//! output_dir = "output"       # Published {key}.html files
//!
//! [catalog]
//! url = "https://api.bibletranslationtools.org/v1/catalog/translations.json"
//! cache_file = "translations.json"   # Relative paths resolve under working_dir
//! ttl_hours = 24
//! format_priority = ["usfm", "markdown", "tsv", "zip"]
//!
//! [http]
//! timeout_secs = 30
//! max_retries = 3
//! backoff_base_ms = 500
//! backoff_cap_ms = 8000
//!
//! [run]
//! wall_clock_secs = 600       # 0 disables the per-run deadline
//! retain_working_dir_on_failure = true
//! reuse_output_hours = 0      # 0 always regenerates
//! max_parallel_runs = 4       # Omit for auto = CPU cores
//!
//! [render.commands]
//! pdf = ["weasyprint", "{input}", "{output}"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssemblerConfig {
    pub paths: PathsConfig,
    pub catalog: CatalogConfig,
    pub http: HttpConfig,
    pub run: RunConfig,
    pub render: RenderConfig,
}

impl AssemblerConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.catalog.url.trim().is_empty() {
            return Err(ConfigError::Validation("catalog.url must not be empty".into()));
        }
        if self.catalog.format_priority.is_empty() {
            return Err(ConfigError::Validation(
                "catalog.format_priority must not be empty".into(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "http.timeout_secs must be non-zero".into(),
            ));
        }
        if self.http.backoff_cap_ms < self.http.backoff_base_ms {
            return Err(ConfigError::Validation(
                "http.backoff_cap_ms must be >= http.backoff_base_ms".into(),
            ));
        }
        for (format, argv) in &self.render.commands {
            if !matches!(format.as_str(), "pdf" | "epub" | "docx") {
                return Err(ConfigError::Validation(format!(
                    "render.commands.{format}: unknown format (expected pdf, epub or docx)"
                )));
            }
            if argv.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "render.commands.{format} must name a program"
                )));
            }
        }
        Ok(())
    }

    /// Catalog cache file, resolved under the working directory when relative.
    pub fn catalog_cache_path(&self) -> PathBuf {
        let cache = Path::new(&self.catalog.cache_file);
        if cache.is_absolute() {
            cache.to_path_buf()
        } else {
            self.paths.working_dir.join(cache)
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("working"),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Upstream translation catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// URL of the JSON catalog snapshot.
    pub url: String,
    /// On-disk copy of the last fetched snapshot.
    pub cache_file: String,
    /// Age after which the on-disk snapshot is refetched.
    pub ttl_hours: u64,
    /// Link format tags in order of preference. Formats not listed are ignored.
    pub format_priority: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: "https://api.bibletranslationtools.org/v1/catalog/translations.json"
                .to_string(),
            cache_file: "translations.json".to_string(),
            ttl_hours: 24,
            format_priority: vec![
                "usfm".to_string(),
                "markdown".to_string(),
                "tsv".to_string(),
                "zip".to_string(),
            ],
        }
    }
}

impl CatalogConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

/// Outbound HTTP behavior shared by the catalog client and fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 8000,
        }
    }
}

/// Per-run lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Wall clock budget for one run. 0 disables the deadline.
    pub wall_clock_secs: u64,
    /// Keep `working_dir/{key}` after a failed run for inspection.
    pub retain_working_dir_on_failure: bool,
    /// Serve an existing `{key}.html` younger than this instead of
    /// regenerating. 0 always regenerates.
    pub reuse_output_hours: u64,
    /// Maximum runs executed in parallel by the CLI.
    /// When absent, defaults to the number of CPU cores.
    pub max_parallel_runs: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            wall_clock_secs: 600,
            retain_working_dir_on_failure: true,
            reuse_output_hours: 0,
            max_parallel_runs: None,
        }
    }
}

impl RunConfig {
    pub fn wall_clock(&self) -> Option<Duration> {
        (self.wall_clock_secs > 0).then(|| Duration::from_secs(self.wall_clock_secs))
    }

    pub fn reuse_window(&self) -> Option<Duration> {
        (self.reuse_output_hours > 0).then(|| Duration::from_secs(self.reuse_output_hours * 3600))
    }
}

/// Resolve the effective number of parallel runs.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)`, at least 1
pub fn effective_parallel_runs(config: &RunConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_parallel_runs
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

/// External renderer commands keyed by format tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// argv templates; `{input}` and `{output}` are substituted per run.
    pub commands: BTreeMap<String, Vec<String>>,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(AssemblerConfig::default())
        .map_err(|e| ConfigError::Validation(format!("default config must serialize: {e}")))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a config file as a raw TOML value.
///
/// Returns `Ok(None)` if the file does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<AssemblerConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: AssemblerConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a `config.toml` path, falling back to stock defaults
/// when the file is absent.
pub fn load_config(path: &Path) -> Result<AssemblerConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(path)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Scripture Assembler Configuration
# =================================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Filesystem locations
# ---------------------------------------------------------------------------
[paths]
# Scratch space. Each run works in working_dir/{key}/ and unpacks
# downloaded assets to working_dir/{key}/sources/.
working_dir = "working"

# Published documents land here as {key}.html (plus any rendered formats).
output_dir = "output"

# ---------------------------------------------------------------------------
# Translation catalog
# ---------------------------------------------------------------------------
[catalog]
# JSON snapshot listing languages, resource types, books and asset links.
url = "https://api.bibletranslationtools.org/v1/catalog/translations.json"

# Local copy of the snapshot. Relative paths resolve under working_dir.
cache_file = "translations.json"

# Refetch the snapshot when the local copy is older than this.
ttl_hours = 24

# Preferred link formats, best first. Links in other formats are ignored.
format_priority = ["usfm", "markdown", "tsv", "zip"]

# ---------------------------------------------------------------------------
# HTTP
# ---------------------------------------------------------------------------
[http]
# Timeout for each individual request.
timeout_secs = 30

# Transient failures (5xx, 429, connection errors) are retried this many
# times, waiting min(backoff_base_ms * 2^attempt, backoff_cap_ms) between.
max_retries = 3
backoff_base_ms = 500
backoff_cap_ms = 8000

# ---------------------------------------------------------------------------
# Runs
# ---------------------------------------------------------------------------
[run]
# Abort a run that takes longer than this. 0 disables the deadline.
wall_clock_secs = 600

# Keep working_dir/{key}/ after a failed run for debugging.
retain_working_dir_on_failure = true

# Serve an existing output_dir/{key}.html younger than this many hours
# instead of assembling again. 0 always regenerates.
reuse_output_hours = 0

# Maximum documents assembled in parallel.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_parallel_runs = 4

# ---------------------------------------------------------------------------
# Renderers
# ---------------------------------------------------------------------------
# Commands that turn {key}.html into other formats. {input} is the HTML
# path and {output} the target path. Formats without a command are skipped.
[render.commands]
# pdf = ["weasyprint", "{input}", "{output}"]
# epub = ["pandoc", "{input}", "-o", "{output}"]
# docx = ["pandoc", "{input}", "-o", "{output}"]
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = AssemblerConfig::default();
        assert_eq!(config.paths.working_dir, PathBuf::from("working"));
        assert_eq!(config.catalog.ttl_hours, 24);
        assert_eq!(
            config.catalog.format_priority,
            vec!["usfm", "markdown", "tsv", "zip"]
        );
        assert_eq!(config.http.max_retries, 3);
        assert_eq!(config.run.wall_clock(), Some(Duration::from_secs(600)));
        assert_eq!(config.run.reuse_window(), None);
        assert!(config.render.commands.is_empty());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[http]
timeout_secs = 5
"#;
        let config: AssemblerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.http.timeout_secs, 5);
        // Defaults preserved
        assert_eq!(config.http.max_retries, 3);
        assert_eq!(config.catalog.ttl_hours, 24);
    }

    #[test]
    fn unknown_keys_rejected() {
        let toml = r#"
[catalog]
urll = "typo"
"#;
        let result: Result<AssemblerConfig, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn catalog_cache_resolves_under_working_dir() {
        let mut config = AssemblerConfig::default();
        config.paths.working_dir = PathBuf::from("/tmp/w");
        assert_eq!(
            config.catalog_cache_path(),
            PathBuf::from("/tmp/w/translations.json")
        );
        config.catalog.cache_file = "/var/cache/catalog.json".to_string();
        assert_eq!(
            config.catalog_cache_path(),
            PathBuf::from("/var/cache/catalog.json")
        );
    }

    #[test]
    fn zero_wall_clock_disables_deadline() {
        let run = RunConfig {
            wall_clock_secs: 0,
            ..RunConfig::default()
        };
        assert_eq!(run.wall_clock(), None);
    }

    #[test]
    fn effective_parallel_runs_clamps() {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let auto = RunConfig::default();
        assert_eq!(effective_parallel_runs(&auto), cores);

        let huge = RunConfig {
            max_parallel_runs: Some(10_000),
            ..RunConfig::default()
        };
        assert_eq!(effective_parallel_runs(&huge), cores);

        let zero = RunConfig {
            max_parallel_runs: Some(0),
            ..RunConfig::default()
        };
        assert_eq!(effective_parallel_runs(&zero), 1);
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn validate_rejects_empty_priority() {
        let mut config = AssemblerConfig::default();
        config.catalog.format_priority.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut config = AssemblerConfig::default();
        config.http.backoff_base_ms = 1000;
        config.http.backoff_cap_ms = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn validate_rejects_unknown_render_format() {
        let mut config = AssemblerConfig::default();
        config
            .render
            .commands
            .insert("odt".to_string(), vec!["soffice".to_string()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("odt"));
    }

    #[test]
    fn validate_rejects_empty_render_command() {
        let mut config = AssemblerConfig::default();
        config.render.commands.insert("pdf".to_string(), vec![]);
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // load_config tests
    // =========================================================================

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config.http.timeout_secs, 30);
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[paths]
output_dir = "/srv/docs"

[render.commands]
pdf = ["weasyprint", "{input}", "{output}"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.paths.output_dir, PathBuf::from("/srv/docs"));
        assert_eq!(config.paths.working_dir, PathBuf::from("working"));
        assert_eq!(config.render.commands["pdf"][0], "weasyprint");
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "this is not [valid toml").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn load_config_validates_merged_result() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[http]\ntimeout_secs = 0\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // merge_toml tests
    // =========================================================================

    #[test]
    fn merge_overrides_nested_keys_only() {
        let base = stock_defaults_value().unwrap();
        let overlay: toml::Value = toml::from_str("[http]\nmax_retries = 7\n").unwrap();
        let merged = merge_toml(base, overlay);
        let config: AssemblerConfig = merged.try_into().unwrap();
        assert_eq!(config.http.max_retries, 7);
        assert_eq!(config.http.timeout_secs, 30);
    }

    #[test]
    fn merge_replaces_arrays_wholesale() {
        let base = stock_defaults_value().unwrap();
        let overlay: toml::Value =
            toml::from_str("[catalog]\nformat_priority = [\"zip\"]\n").unwrap();
        let config = resolve_config(base, Some(overlay)).unwrap();
        assert_eq!(config.catalog.format_priority, vec!["zip"]);
    }

    #[test]
    fn stock_config_toml_parses_to_defaults() {
        let config: AssemblerConfig = toml::from_str(stock_config_toml()).unwrap();
        let defaults = AssemblerConfig::default();
        assert_eq!(config.catalog.url, defaults.catalog.url);
        assert_eq!(config.http.backoff_cap_ms, defaults.http.backoff_cap_ms);
        assert_eq!(config.run.wall_clock_secs, defaults.run.wall_clock_secs);
        assert!(config.render.commands.is_empty());
    }
}
