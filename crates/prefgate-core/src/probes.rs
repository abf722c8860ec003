//! Capability probes.
//!
//! Probes are the environment's answers to "is this feature available here".
//! Some are cheap and synchronous (is the kernel module loaded), others need
//! a round trip (which tunnel backend did the app pick, can a root shell be
//! started). The async ones return boxed futures so implementations stay
//! object-safe behind `Arc<dyn CapabilityProbes>`.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// Probe future type.
pub type ProbeFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tunnel backend the application resolved at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Kernel implementation driven through the wg-quick tool.
    WgQuick,
    /// Userspace implementation.
    Userspace,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WgQuick => "wg_quick",
            Self::Userspace => "userspace",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "wg_quick" | "wgquick" | "kernel" => Ok(Self::WgQuick),
            "userspace" | "go" => Ok(Self::Userspace),
            _ => Err(format!(
                "unknown backend kind: {s}. Expected one of: wg_quick, userspace"
            )),
        }
    }
}

/// The environment's capability checks.
pub trait CapabilityProbes: Send + Sync {
    /// Resolve the active tunnel backend.
    fn backend_kind(&self) -> ProbeFuture<'_, BackendKind>;

    /// Whether the kernel module is loaded. Must not block.
    fn is_module_loaded(&self) -> bool;

    /// Try to start a privileged shell.
    fn start_privileged_shell(&self) -> ProbeFuture<'_, Result<(), ProbeError>>;

    /// Platform API level, used to detect a system-wide dark theme.
    fn platform_api_level(&self) -> u32;
}

/// Result of one probe evaluation as recorded by the gate sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The capability is available.
    Present,
    /// The capability is not available.
    Absent,
    /// The probe itself failed; treated like `Absent`.
    Failed(String),
}

impl ProbeOutcome {
    #[must_use]
    pub fn from_bool(present: bool) -> Self {
        if present { Self::Present } else { Self::Absent }
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Failed(_) => "failed",
        }
    }
}

impl From<Result<(), ProbeError>> for ProbeOutcome {
    fn from(result: Result<(), ProbeError>) -> Self {
        match result {
            Ok(()) => Self::Present,
            Err(err) => Self::Failed(err.to_string()),
        }
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}
