//! Configuration management for prefgate
//!
//! Handles loading and validation of prefgate.toml configuration files.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gate::GateSettings;
use crate::logging::{LogConfig, LogLevel};
use crate::probes::BackendKind;

/// Environment variable pointing at a config file.
pub const CONFIG_ENV_VAR: &str = "PREFGATE_CONFIG";

/// Config file name inside the per-user config directory.
pub const CONFIG_FILE_NAME: &str = "prefgate.toml";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Permission request settings
    #[serde(default)]
    pub permissions: PermissionsConfig,

    /// Capability gate settings
    #[serde(default)]
    pub gates: GatesConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

impl GeneralConfig {
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Permission request configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Maximum number of in-flight permission requests per screen
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

fn default_max_pending() -> usize {
    crate::correlator::DEFAULT_MAX_PENDING
}

/// Capability gate configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatesConfig {
    /// Backend kind under which backend-specific items are shown
    #[serde(default = "default_target_backend")]
    pub target_backend: BackendKind,

    /// Privileged shell probe timeout in milliseconds
    #[serde(default = "default_shell_timeout_ms")]
    pub shell_timeout_ms: u64,

    /// Platform API level from which the system provides a dark theme
    #[serde(default = "default_dark_theme_min_api")]
    pub dark_theme_min_api: u32,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            target_backend: default_target_backend(),
            shell_timeout_ms: default_shell_timeout_ms(),
            dark_theme_min_api: default_dark_theme_min_api(),
        }
    }
}

impl GatesConfig {
    #[must_use]
    pub fn settings(&self) -> GateSettings {
        GateSettings {
            target_backend: self.target_backend,
            shell_timeout: Duration::from_millis(self.shell_timeout_ms),
            dark_theme_min_api: self.dark_theme_min_api,
        }
    }
}

fn default_target_backend() -> BackendKind {
    BackendKind::WgQuick
}

fn default_shell_timeout_ms() -> u64 {
    5_000
}

fn default_dark_theme_min_api() -> u32 {
    29
}

const MAX_SHELL_TIMEOUT_MS: u64 = 600_000;

/// Pick the config file to load.
///
/// Order: explicit path, `$PREFGATE_CONFIG`, then the per-user config
/// directory if a file exists there.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_config_path_with(
        explicit,
        std::env::var_os(CONFIG_ENV_VAR),
        dirs::config_dir(),
    )
}

fn resolve_config_path_with(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
    config_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(value));
    }
    config_dir
        .map(|dir| dir.join("prefgate").join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
}

impl Config {
    /// Load configuration from default locations
    pub fn load() -> crate::Result<Self> {
        Self::load_with(None)
    }

    /// Load from `explicit` if given, otherwise from the default search path.
    ///
    /// A missing explicit or `$PREFGATE_CONFIG` file is an error; a missing
    /// per-user file means defaults.
    pub fn load_with(explicit: Option<&Path>) -> crate::Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(shown).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(shown.clone(), e.to_string()))?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %shown, "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(raw: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseFailed(format!("failed to serialize config: {e}")).into())
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general
            .log_level
            .parse::<LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        if self.permissions.max_pending == 0 {
            return Err(ConfigError::ValidationError(
                "permissions.max_pending must be at least 1".to_string(),
            ));
        }
        if self.gates.shell_timeout_ms == 0 || self.gates.shell_timeout_ms > MAX_SHELL_TIMEOUT_MS {
            return Err(ConfigError::ValidationError(format!(
                "gates.shell_timeout_ms must be between 1 and {MAX_SHELL_TIMEOUT_MS}"
            )));
        }
        if self.gates.dark_theme_min_api == 0 {
            return Err(ConfigError::ValidationError(
                "gates.dark_theme_min_api must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, LogFormat::Pretty);
        assert_eq!(config.permissions.max_pending, 64);
        assert_eq!(config.gates.target_backend, BackendKind::WgQuick);
        assert_eq!(config.gates.shell_timeout_ms, 5_000);
        assert_eq!(config.gates.dark_theme_min_api, 29);
        config.validate().unwrap();
    }

    #[test]
    fn empty_toml_uses_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config = Config::from_toml(
            r#"
            [general]
            log_format = "json"

            [gates]
            target_backend = "userspace"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, LogFormat::Json);
        assert_eq!(config.gates.target_backend, BackendKind::Userspace);
        assert_eq!(config.gates.shell_timeout_ms, 5_000);
        assert_eq!(config.permissions.max_pending, 64);
    }

    #[test]
    fn invalid_values_fail_validation() {
        for raw in [
            "[general]\nlog_level = \"loud\"",
            "[permissions]\nmax_pending = 0",
            "[gates]\nshell_timeout_ms = 0",
            "[gates]\nshell_timeout_ms = 700000",
            "[gates]\ndark_theme_min_api = 0",
        ] {
            let err = Config::from_toml(raw).unwrap_err();
            assert!(
                matches!(err, Error::Config(ConfigError::ValidationError(_))),
                "{raw}: {err}"
            );
        }
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml("[gates\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseFailed(_))));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("prefgate.toml");
        std::fs::write(&path, "[permissions]\nmax_pending = 3\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.permissions.max_pending, 3);
    }

    #[test]
    fn load_from_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nope.toml");
        let err = Config::load_from(&path).unwrap_err();
        match err {
            Error::Config(ConfigError::FileNotFound(shown)) => {
                assert_eq!(shown, path.display().to_string());
            }
            other => panic!("expected FileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn explicit_path_wins() {
        let explicit = PathBuf::from("/tmp/a.toml");
        let resolved = resolve_config_path_with(
            Some(&explicit),
            Some(OsString::from("/tmp/b.toml")),
            None,
        );
        assert_eq!(resolved, Some(explicit));
    }

    #[test]
    fn env_var_beats_config_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("prefgate")).unwrap();
        std::fs::write(dir.path().join("prefgate").join(CONFIG_FILE_NAME), "").unwrap();

        let resolved = resolve_config_path_with(
            None,
            Some(OsString::from("/tmp/env.toml")),
            Some(dir.path().to_path_buf()),
        );
        assert_eq!(resolved, Some(PathBuf::from("/tmp/env.toml")));
    }

    #[test]
    fn config_dir_used_only_when_file_exists() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(
            resolve_config_path_with(None, Some(OsString::new()), Some(dir.path().to_path_buf())),
            None
        );

        std::fs::create_dir_all(dir.path().join("prefgate")).unwrap();
        let file = dir.path().join("prefgate").join(CONFIG_FILE_NAME);
        std::fs::write(&file, "").unwrap();
        assert_eq!(
            resolve_config_path_with(None, None, Some(dir.path().to_path_buf())),
            Some(file)
        );
    }

    #[test]
    fn toml_roundtrip() {
        let mut config = Config::default();
        config.general.log_file = Some(PathBuf::from("/tmp/prefgate.log"));
        config.gates.shell_timeout_ms = 250;
        let text = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn gates_settings_convert_units() {
        let gates = GatesConfig {
            shell_timeout_ms: 1_500,
            ..GatesConfig::default()
        };
        assert_eq!(gates.settings().shell_timeout, Duration::from_millis(1_500));
    }

    #[test]
    fn general_maps_to_log_config() {
        let general = GeneralConfig {
            log_level: "debug".into(),
            log_format: LogFormat::Json,
            log_file: None,
        };
        let log = general.log_config();
        assert_eq!(log.level, "debug");
        assert_eq!(log.format, LogFormat::Json);
    }
}
