//! prefgate-core: Core library for prefgate
//!
//! Two pieces of a settings screen that are awkward to get right by hand:
//! correlating permission prompts with their answers, and deciding which
//! preference items a device can actually use.
//!
//! # Architecture
//!
//! ```text
//! Preference ──► PreferenceHandle ──► SettingsHost
//!                                        │
//!              ┌─────────────────────────┼──────────────────────┐
//!              ▼                         ▼                      ▼
//!      SharedCorrelator           GateSequencer          PreferenceScreen
//!   (token ─► callback table)  (rules ─► probes ─► policy)  (item states)
//!              │                         │
//!              ▼                         ▼
//!     PermissionSubsystem         CapabilityProbes
//! ```
//!
//! # Modules
//!
//! - `permissions`: request tokens, outcomes and the permission subsystem boundary
//! - `correlator`: token-keyed pending request table
//! - `probes`: capability probe boundary
//! - `gate`: declarative gate table and the sequencer that applies it
//! - `screen`: preference items and their visibility states
//! - `host`: one open settings screen and owning-host lookup
//! - `simulation`: YAML scenarios run against simulated subsystems
//! - `config`: Configuration management
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod correlator;
pub mod error;
pub mod gate;
pub mod host;
pub mod logging;
pub mod permissions;
pub mod probes;
pub mod screen;
pub mod simulation;

pub use error::{Error, Result};
