//! Structured logging for prefgate
//!
//! Uses `tracing` with a pretty or JSON formatter on stderr and an optional
//! append-only log file.
//!
//! # Usage
//!
//! Initialize logging once at startup:
//!
//! ```ignore
//! use prefgate_core::logging::{init_logging, LogConfig, LogFormat};
//!
//! let config = LogConfig {
//!     level: "info".to_string(),
//!     format: LogFormat::Pretty,
//!     file: None,
//! };
//! init_logging(&config)?;
//! ```
//!
//! # Fields
//!
//! Use these field names consistently in events:
//! - `token`: permission request token
//! - `item`: preference item key
//! - `probe`: capability probe id
//! - `outcome`, `policy`: probe outcome and the policy it selected

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter; `RUST_LOG` overrides it
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional log file, appended to
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    let existed = parent.exists();
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<File> {
    ensure_parent_dir(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

/// Build the level filter: `RUST_LOG` if set, otherwise the configured level.
fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let parsed: LogLevel = level.parse().map_err(|_| LogError::InvalidLevel(level.to_string()))?;
    Ok(EnvFilter::new(Level::from(parsed).as_str().to_lowercase()))
}

type BoxedSubscriber = Box<dyn tracing::Subscriber + Send + Sync>;

/// Compose the level filter, the main output layer and the optional file layer.
fn build_subscriber<O, F>(
    format: LogFormat,
    filter: EnvFilter,
    out: O,
    ansi: bool,
    file: Option<F>,
) -> BoxedSubscriber
where
    O: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    F: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => {
            let out_layer = fmt::layer()
                .with_writer(out)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(ansi);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .with_writer(file)
                    .with_target(true)
                    .with_ansi(false)
            });
            Box::new(
                tracing_subscriber::registry()
                    .with(filter)
                    .with(out_layer)
                    .with(file_layer),
            )
        }
        LogFormat::Json => {
            let out_layer = fmt::layer()
                .json()
                .with_timer(SystemTime)
                .with_writer(out)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(file)
                    .with_target(true)
                    .flatten_event(true)
            });
            Box::new(
                tracing_subscriber::registry()
                    .with(filter)
                    .with(out_layer)
                    .with(file_layer),
            )
        }
    }
}

/// Install the global subscriber.
///
/// Call once at startup; later calls return [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = build_filter(&config.level)?;
    let file = config.file.as_deref().map(open_log_file).transpose()?;
    let subscriber = build_subscriber(config.format, env_filter, io::stderr, true, file);
    tracing::subscriber::set_global_default(subscriber)?;

    let _ = LOGGING_INITIALIZED.set(());

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "logging initialized"
    );

    Ok(())
}

/// Check if logging has been initialized
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Log levels accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Captures formatted output in memory.
    #[derive(Clone, Default)]
    struct MockLogWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl MockLogWriter {
        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for MockLogWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for MockLogWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn log_format_display() {
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("Debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        let err = "verbose".parse::<LogLevel>().unwrap_err();
        assert!(err.contains("unknown log level: verbose"));
    }

    #[test]
    fn log_level_ordering_and_conversion() {
        assert!(LogLevel::Trace < LogLevel::Error);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
    }

    #[test]
    fn invalid_level_is_rejected_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(matches!(build_filter("loud"), Err(LogError::InvalidLevel(_))));
        assert!(build_filter("debug").is_ok());
    }

    #[test]
    fn log_config_serde_defaults_from_empty_json() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn log_config_toml_roundtrip() {
        let config = LogConfig {
            level: "debug".to_string(),
            format: LogFormat::Json,
            file: Some(PathBuf::from("/tmp/prefgate.log")),
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: LogConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn log_error_display() {
        assert_eq!(
            LogError::AlreadyInitialized.to_string(),
            "logging already initialized"
        );
        let err: LogError = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(err.to_string().contains("failed to create log file"));
    }

    #[test]
    fn json_subscriber_writes_fields_to_both_sinks() {
        let out = MockLogWriter::default();
        let file = MockLogWriter::default();
        let subscriber = build_subscriber(
            LogFormat::Json,
            EnvFilter::new("debug"),
            out.clone(),
            false,
            Some(file.clone()),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(token = 7u64, item = "module_downloader", "dispatching");
        });

        for sink in [&out, &file] {
            let output = sink.contents();
            let line = output.lines().find(|l| !l.trim().is_empty()).unwrap();
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("timestamp").is_some());
            assert_eq!(parsed["token"].as_u64(), Some(7));
            assert_eq!(parsed["item"].as_str(), Some("module_downloader"));
            assert_eq!(parsed["message"].as_str(), Some("dispatching"));
        }
    }

    #[test]
    fn pretty_subscriber_without_file() {
        let out = MockLogWriter::default();
        let subscriber = build_subscriber(
            LogFormat::Pretty,
            EnvFilter::new("info"),
            out.clone(),
            false,
            None::<MockLogWriter>,
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(probe = "backend_kind", "probe completed");
            tracing::debug!("filtered out");
        });

        let output = out.contents();
        assert!(output.contains("probe completed"));
        assert!(output.contains("probe=\"backend_kind\""));
        assert!(!output.contains("filtered out"));
        assert!(!output.contains("\x1b["));
    }

    #[test]
    fn configured_level_filters_subscriber() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let out = MockLogWriter::default();
        let filter = build_filter("warn").unwrap();
        let subscriber = build_subscriber(LogFormat::Pretty, filter, out.clone(), false, None::<File>);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("below threshold");
            tracing::warn!(item = "dark_theme", "item already resolved");
        });

        let output = out.contents();
        assert!(!output.contains("below threshold"));
        assert!(output.contains("item already resolved"));
    }

    #[test]
    fn ensure_parent_dir_creates_nested() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a").join("b").join("file.log");
        ensure_parent_dir(&path).unwrap();
        assert!(tmp.path().join("a").join("b").is_dir());
        ensure_parent_dir(Path::new("file.log")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn new_log_file_is_private() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("logs").join("prefgate.log");
        drop(open_log_file(&path).unwrap());
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(tmp.path().join("logs"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }
}
