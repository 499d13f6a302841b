//! Configuration system for colflow.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Every recognised
//! option is a typed field; the merged result is validated before use.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ColflowError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColflowConfig {
    pub read: ReadOptions,
    pub execution: ExecutionConfig,
    pub output: OutputOptions,
    pub logging: LoggingConfig,
}

impl ColflowConfig {
    /// Check every option; called by `load_config` and `PipelineContext::new`.
    pub fn validate(&self) -> Result<()> {
        self.read.validate()?;
        self.execution.validate()?;
        self.output.validate()?;
        Ok(())
    }
}

/// How delimited partitions are parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Field delimiter (single ASCII character).
    pub delimiter: char,
    /// Quote character (single ASCII character).
    pub quote: char,
    /// Lines starting with this character are skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<char>,
    /// When false, schema columns are bound to fields by position.
    pub has_header: bool,
    /// Trim surrounding whitespace from headers and fields before sentinel
    /// comparison and parsing.
    pub trim: bool,
    /// An empty field in an integer, float or timestamp column is read as
    /// absent. Text columns always keep `""`.
    pub empty_as_missing: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            comment: None,
            has_header: true,
            trim: true,
            empty_as_missing: true,
        }
    }
}

impl ReadOptions {
    fn validate(&self) -> Result<()> {
        ascii_byte("read.delimiter", self.delimiter)?;
        ascii_byte("read.quote", self.quote)?;
        if let Some(comment) = self.comment {
            ascii_byte("read.comment", comment)?;
        }
        if self.delimiter == self.quote {
            return Err(ColflowError::config(
                "read.delimiter and read.quote must differ",
            ));
        }
        Ok(())
    }
}

/// What the materializer does when one partition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Abort the whole run on the first partition failure.
    #[default]
    AbortAll,
    /// Drop the failed partition and report it alongside the result.
    SkipPartition,
}

/// Worker pool and failure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum partitions processed concurrently.
    pub max_concurrent_partitions: usize,
    pub failure_mode: FailureMode,
    /// Upper bound for one partition stage or one output file write.
    pub partition_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_partitions: 4,
            failure_mode: FailureMode::AbortAll,
            partition_timeout_secs: 300,
        }
    }
}

impl ExecutionConfig {
    pub fn partition_timeout(&self) -> Duration {
        Duration::from_secs(self.partition_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_partitions == 0 {
            return Err(ColflowError::config(
                "execution.max_concurrent_partitions must be at least 1",
            ));
        }
        if self.partition_timeout_secs == 0 {
            return Err(ColflowError::config(
                "execution.partition_timeout_secs must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Partitioned output layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Number of output files; rows are split into contiguous ranges.
    pub num_files: usize,
    /// File names are `{file_prefix}-{index:05}.csv`.
    pub file_prefix: String,
    pub delimiter: char,
    /// Replace existing `{file_prefix}-*` files in the target directory.
    pub overwrite: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            num_files: 1,
            file_prefix: "part".to_string(),
            delimiter: ',',
            overwrite: true,
        }
    }
}

impl OutputOptions {
    fn validate(&self) -> Result<()> {
        if self.num_files == 0 {
            return Err(ColflowError::config("output.num_files must be at least 1"));
        }
        if self.file_prefix.is_empty()
            || self
                .file_prefix
                .chars()
                .any(|c| std::path::is_separator(c) || c == '.')
        {
            return Err(ColflowError::config(format!(
                "output.file_prefix '{}' must be a non-empty plain name",
                self.file_prefix
            )));
        }
        ascii_byte("output.delimiter", self.delimiter)?;
        Ok(())
    }
}

/// Logging setup consumed by [`crate::logging::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive for the stderr layer.
    pub level: String,
    /// Also write JSON logs to a daily rolling file.
    pub json_file: bool,
    /// Directory for JSON logs; defaults to the platform data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
            log_dir: None,
        }
    }
}

fn ascii_byte(field: &str, c: char) -> Result<u8> {
    u8::try_from(c)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| ColflowError::config(format!("{field} must be a single ASCII character")))
}

/// The delimiter/quote/comment characters as bytes, after validation.
pub(crate) fn as_byte(c: char) -> u8 {
    u8::try_from(c).unwrap_or(b',')
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `COLFLOW_`, `__` separates sections)
/// 3. Workspace-local config (`.colflow/config.toml`)
/// 4. User config (`~/.config/colflow/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ColflowConfig>,
) -> Result<ColflowConfig> {
    let mut figment = Figment::from(Serialized::defaults(ColflowConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "colflow", "colflow") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".colflow").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // COLFLOW_EXECUTION__MAX_CONCURRENT_PARTITIONS, COLFLOW_READ__DELIMITER, ...
    figment = figment.merge(Env::prefixed("COLFLOW_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: ColflowConfig = figment
        .extract()
        .map_err(|e| ColflowError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Write `config` to `<workspace>/.colflow/config.toml`, returning the path.
pub fn write_workspace_config(workspace: &Path, config: &ColflowConfig) -> anyhow::Result<PathBuf> {
    config.validate()?;
    let config_dir = workspace.join(".colflow");
    std::fs::create_dir_all(&config_dir)?;
    let config_path = config_dir.join("config.toml");
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&config_path, content)?;
    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        ColflowConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut config = ColflowConfig::default();
        config.execution.max_concurrent_partitions = 0;
        assert!(config.validate().is_err());

        let mut config = ColflowConfig::default();
        config.output.num_files = 0;
        assert!(config.validate().is_err());

        let mut config = ColflowConfig::default();
        config.read.delimiter = 'é';
        assert!(config.validate().is_err());

        let mut config = ColflowConfig::default();
        config.read.quote = ',';
        assert!(config.validate().is_err());

        let mut config = ColflowConfig::default();
        config.output.file_prefix = "../escape".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_workspace_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = ColflowConfig::default();
        config.read.delimiter = ';';
        config.execution.failure_mode = FailureMode::SkipPartition;
        config.output.num_files = 3;

        let path = write_workspace_config(dir.path(), &config).unwrap();
        assert!(path.ends_with(".colflow/config.toml"));

        let loaded = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(loaded.read.delimiter, ';');
        assert_eq!(loaded.execution.failure_mode, FailureMode::SkipPartition);
        assert_eq!(loaded.output.num_files, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".colflow")).unwrap();
        std::fs::write(
            dir.path().join(".colflow/config.toml"),
            "[execution]\nmax_concurrent_partitions = 9\n",
        )
        .unwrap();

        let loaded = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(loaded.execution.max_concurrent_partitions, 9);
        assert_eq!(loaded.execution.partition_timeout_secs, 300);
        assert_eq!(loaded.read, ReadOptions::default());
    }

    #[test]
    fn test_invalid_file_fails_at_load() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".colflow")).unwrap();
        std::fs::write(
            dir.path().join(".colflow/config.toml"),
            "[output]\nnum_files = 0\n",
        )
        .unwrap();
        let err = load_config(Some(dir.path()), None).unwrap_err();
        assert!(matches!(err, ColflowError::Config { .. }));
    }
}
