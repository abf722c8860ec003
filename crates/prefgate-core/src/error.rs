//! Error types for prefgate-core

use std::fmt::Write;
use thiserror::Error;

use crate::gate::ProbeId;
use crate::logging::LogError;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for prefgate-core
#[derive(Error, Debug)]
pub enum Error {
    /// Permission request correlation errors
    #[error("Correlator error: {0}")]
    Correlator(#[from] CorrelatorError),

    /// Gate table and sequencer errors
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    /// Capability probe errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialization errors
    #[error("Logging error: {0}")]
    Logging(#[from] LogError),

    /// Scenario loading or validation errors
    #[error("Scenario error: {0}")]
    Scenario(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, missing runtime, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The request was abandoned before a response arrived
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Correlator(err) => Some(err.remediation()),
            Self::Gate(err) => Some(err.remediation()),
            Self::Probe(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Logging(_) => Some(
                Remediation::new("Fix the [general] logging settings and retry.")
                    .command("Show config", "prefgate config")
                    .alternative("Unset RUST_LOG or point log_file at a writable path."),
            ),
            Self::Scenario(_) => Some(
                Remediation::new("Fix the scenario file and retry.")
                    .command("Validate", "prefgate check <scenario.yaml>")
                    .alternative("Compare against a known-good scenario."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "prefgate config")
                    .alternative("Verify the file exists and is readable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Run the operation inside a tokio runtime and retry.")
                    .command("Simulate", "prefgate simulate <scenario.yaml>")
                    .alternative("Check logs with RUST_LOG=prefgate_core=debug."),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new("The settings screen was closed before the request finished.")
                    .command("Simulate", "prefgate simulate <scenario.yaml>")
                    .alternative("Issue the request again from a live screen."),
            ),
        }
    }
}

/// Permission request correlation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    /// A request must name at least one permission
    #[error("permission request is empty")]
    EmptyRequest,

    /// The monotonic token counter cannot advance further
    #[error("request token space exhausted")]
    TokenSpaceExhausted,

    /// Too many requests are waiting for a response
    #[error("too many pending permission requests (limit {limit})")]
    TooManyPending { limit: usize },
}

impl CorrelatorError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::EmptyRequest => Remediation::new("Pass at least one permission identifier.")
                .command("Simulate", "prefgate simulate <scenario.yaml>"),
            Self::TokenSpaceExhausted => {
                Remediation::new("Reopen the settings screen to start a fresh token sequence.")
                    .command("Simulate", "prefgate simulate <scenario.yaml>")
            }
            Self::TooManyPending { limit } => Remediation::new(format!(
                "Wait for outstanding permission prompts to finish ({limit} in flight)."
            ))
            .command("Show config", "prefgate config")
            .alternative("Raise [permissions].max_pending in prefgate.toml."),
        }
    }
}

/// Gate table and sequencer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Two rules share the same item and probe
    #[error("duplicate gate rule for item '{item}' and probe {probe}")]
    DuplicateRule { item: String, probe: ProbeId },

    /// An item is governed by more than one probe that is not deferred to
    #[error("item '{item}' has more than one root gate rule")]
    MultipleRoots { item: String },

    /// A defer policy points at a probe with no rule for the same item
    #[error("item '{item}' defers to probe {probe} which has no rule for it")]
    DanglingDefer { item: String, probe: ProbeId },

    /// Following defer policies for an item loops back on itself
    #[error("defer chain for item '{item}' forms a cycle")]
    DeferCycle { item: String },

    /// Asynchronous probes need a tokio runtime
    #[error("gate sequencer started outside a tokio runtime")]
    NoRuntime,
}

impl GateError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::DuplicateRule { .. } | Self::MultipleRoots { .. } => {
                Remediation::new("Give each item exactly one root rule per probe.")
                    .alternative("Use a defer policy to chain a second probe.")
            }
            Self::DanglingDefer { .. } => {
                Remediation::new("Add a rule for the deferred probe on the same item.")
            }
            Self::DeferCycle { .. } => {
                Remediation::new("Break the defer cycle so every chain ends in show or remove.")
            }
            Self::NoRuntime => Remediation::new("Open the settings host from async code.")
                .command("Simulate", "prefgate simulate <scenario.yaml>"),
        }
    }
}

/// Capability probe errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The privileged shell could not be started
    #[error("privileged shell unavailable: {0}")]
    ShellUnavailable(String),

    /// The probe did not complete within its deadline
    #[error("probe timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },

    /// Any other probe failure
    #[error("probe failed: {0}")]
    Failed(String),
}

impl ProbeError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ShellUnavailable(_) => {
                Remediation::new("Grant root access to the app, then reopen settings.")
                    .alternative("Without root, the module installer stays hidden.")
            }
            Self::TimedOut { .. } => Remediation::new("Reopen settings once the device is idle.")
                .command("Show config", "prefgate config")
                .alternative("Raise [gates].shell_timeout_ms in prefgate.toml."),
            Self::Failed(_) => Remediation::new("Check logs for the failing probe and retry.")
                .command("Debug logs", "RUST_LOG=prefgate_core=debug prefgate simulate <scenario.yaml>"),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show effective config", "prefgate config")
                .alternative("Validate the TOML syntax."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show effective config", "prefgate config")
                    .alternative("Review validation errors and adjust prefgate.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
