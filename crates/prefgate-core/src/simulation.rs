//! Simulation scenario system for testing and demos.
//!
//! Declarative YAML scenarios describe a device (granted permissions, tunnel
//! backend, kernel module, root shell, platform level), the permission
//! requests a user makes on the settings screen and how the user answers
//! them. [`run_scenario`] drives a [`SettingsHost`] against simulated
//! subsystems and checks the scenario's expectations.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;
use crate::config::Config;
use crate::correlator::RequestDisposition;
use crate::error::{Error, ProbeError};
use crate::gate::{GateDecision, GateTable};
use crate::host::SettingsHost;
use crate::permissions::{OutcomeCode, PermissionResponse, PermissionSubsystem, RequestToken};
use crate::probes::{BackendKind, CapabilityProbes, ProbeFuture};
use crate::screen::{ItemState, PreferenceScreen, ScreenSnapshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Simulated subsystems
// ---------------------------------------------------------------------------

/// A prompt the simulated environment was asked to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedPrompt {
    pub token: RequestToken,
    pub permissions: Vec<String>,
}

/// In-memory permission subsystem. Grants stick once answered.
#[derive(Debug, Default)]
pub struct SimulatedPermissions {
    granted: Mutex<BTreeSet<String>>,
    dispatched: Mutex<Vec<DispatchedPrompt>>,
}

impl SimulatedPermissions {
    pub fn new<I, S>(granted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: Mutex::new(granted.into_iter().map(Into::into).collect()),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub fn grant(&self, permission: &str) {
        lock(&self.granted).insert(permission.to_string());
    }

    #[must_use]
    pub fn dispatched(&self) -> Vec<DispatchedPrompt> {
        lock(&self.dispatched).clone()
    }

    #[must_use]
    pub fn dispatched_for(&self, token: RequestToken) -> Option<Vec<String>> {
        lock(&self.dispatched)
            .iter()
            .find(|prompt| prompt.token == token)
            .map(|prompt| prompt.permissions.clone())
    }

    /// Answer the prompt sent under `token`. Unlisted permissions are denied.
    ///
    /// Returns the vectors to deliver back to the host.
    pub fn answer(
        &self,
        token: RequestToken,
        answers: &BTreeMap<String, OutcomeCode>,
    ) -> Option<(Vec<String>, Vec<OutcomeCode>)> {
        let permissions = self.dispatched_for(token)?;
        let outcomes: Vec<OutcomeCode> = permissions
            .iter()
            .map(|p| answers.get(p).copied().unwrap_or(OutcomeCode::Denied))
            .collect();
        for (permission, outcome) in permissions.iter().zip(&outcomes) {
            if outcome.is_granted() {
                self.grant(permission);
            }
        }
        Some((permissions, outcomes))
    }
}

impl PermissionSubsystem for SimulatedPermissions {
    fn check_granted(&self, permission: &str) -> bool {
        lock(&self.granted).contains(permission)
    }

    fn dispatch_request(&self, permissions: &[String], token: RequestToken) {
        debug!(token = %token, count = permissions.len(), "simulated prompt shown");
        lock(&self.dispatched).push(DispatchedPrompt {
            token,
            permissions: permissions.to_vec(),
        });
    }
}

/// How the simulated root shell behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellBehavior {
    /// The shell starts.
    #[default]
    Available,
    /// Root is refused.
    Denied,
    /// The shell never answers.
    Hang,
}

/// Capability probes driven by fixed answers, counting invocations.
#[derive(Debug)]
pub struct SimulatedProbes {
    backend: BackendKind,
    backend_delay: Duration,
    module_loaded: bool,
    shell: ShellBehavior,
    shell_delay: Duration,
    api_level: u32,
    backend_runs: AtomicUsize,
    shell_runs: AtomicUsize,
}

impl SimulatedProbes {
    #[must_use]
    pub fn new(backend: BackendKind, module_loaded: bool) -> Self {
        Self {
            backend,
            backend_delay: Duration::ZERO,
            module_loaded,
            shell: ShellBehavior::Available,
            shell_delay: Duration::ZERO,
            api_level: default_api_level(),
            backend_runs: AtomicUsize::new(0),
            shell_runs: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn from_environment(env: &Environment) -> Self {
        Self {
            backend_delay: env.backend_delay,
            shell: env.shell,
            shell_delay: env.shell_delay,
            api_level: env.api_level,
            ..Self::new(env.backend, env.module_loaded)
        }
    }

    #[must_use]
    pub fn with_shell(mut self, shell: ShellBehavior) -> Self {
        self.shell = shell;
        self
    }

    #[must_use]
    pub fn with_api_level(mut self, api_level: u32) -> Self {
        self.api_level = api_level;
        self
    }

    #[must_use]
    pub fn backend_runs(&self) -> usize {
        self.backend_runs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn shell_runs(&self) -> usize {
        self.shell_runs.load(Ordering::SeqCst)
    }
}

impl CapabilityProbes for SimulatedProbes {
    fn backend_kind(&self) -> ProbeFuture<'_, BackendKind> {
        self.backend_runs.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if !self.backend_delay.is_zero() {
                tokio::time::sleep(self.backend_delay).await;
            }
            self.backend
        })
    }

    fn is_module_loaded(&self) -> bool {
        self.module_loaded
    }

    fn start_privileged_shell(&self) -> ProbeFuture<'_, std::result::Result<(), ProbeError>> {
        self.shell_runs.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if !self.shell_delay.is_zero() {
                tokio::time::sleep(self.shell_delay).await;
            }
            match self.shell {
                ShellBehavior::Available => Ok(()),
                ShellBehavior::Denied => Err(ProbeError::ShellUnavailable(
                    "root access denied".to_string(),
                )),
                ShellBehavior::Hang => std::future::pending().await,
            }
        })
    }

    fn platform_api_level(&self) -> u32 {
        self.api_level
    }
}

// ---------------------------------------------------------------------------
// Scenario types
// ---------------------------------------------------------------------------

/// A declarative scenario loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique scenario name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// The simulated device.
    #[serde(default)]
    pub environment: Environment,
    /// Permission requests, issued in order after the gates settle.
    #[serde(default)]
    pub requests: Vec<ScenarioRequest>,
    /// Checks on the final screen.
    #[serde(default)]
    pub expect: Expectations,
}

/// The simulated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    /// Permissions granted before the screen opens.
    #[serde(default)]
    pub granted: Vec<String>,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// How long backend resolution takes (e.g. "250ms", "1s").
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub backend_delay: Duration,
    #[serde(default)]
    pub module_loaded: bool,
    #[serde(default)]
    pub shell: ShellBehavior,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub shell_delay: Duration,
    #[serde(default = "default_api_level")]
    pub api_level: u32,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            granted: Vec::new(),
            backend: default_backend(),
            backend_delay: Duration::ZERO,
            module_loaded: false,
            shell: ShellBehavior::default(),
            shell_delay: Duration::ZERO,
            api_level: default_api_level(),
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::WgQuick
}

fn default_api_level() -> u32 {
    28
}

fn default_true() -> bool {
    true
}

/// One permission request made from the screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub permissions: Vec<String>,
    /// Issue the request through this preference's owning host.
    #[serde(default)]
    pub from: Option<String>,
    /// The user's answer per permission; unlisted ones are denied.
    #[serde(default)]
    pub answers: BTreeMap<String, OutcomeCode>,
    /// Whether the environment answers at all.
    #[serde(default = "default_true")]
    pub deliver: bool,
    /// Deliver the same answer a second time.
    #[serde(default)]
    pub redeliver: bool,
    #[serde(default)]
    pub expect: Option<RequestExpectation>,
}

/// How a request ended up being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionKind {
    Satisfied,
    Dispatched,
    Rejected,
}

impl DispositionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::Dispatched => "dispatched",
            Self::Rejected => "rejected",
        }
    }
}

impl From<RequestDisposition> for DispositionKind {
    fn from(disposition: RequestDisposition) -> Self {
        match disposition {
            RequestDisposition::Satisfied => Self::Satisfied,
            RequestDisposition::Dispatched(_) => Self::Dispatched,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestExpectation {
    #[serde(default)]
    pub disposition: Option<DispositionKind>,
    #[serde(default)]
    pub outcomes: Option<Vec<OutcomeCode>>,
    #[serde(default)]
    pub abandoned: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expectations {
    /// Final state per item key.
    #[serde(default)]
    pub items: BTreeMap<String, ItemState>,
    /// In-flight requests when the screen closes.
    #[serde(default)]
    pub pending: Option<usize>,
    #[serde(default)]
    pub backend_probe_runs: Option<usize>,
    #[serde(default)]
    pub shell_probe_runs: Option<usize>,
}

// ---------------------------------------------------------------------------
// Scenario loading and validation
// ---------------------------------------------------------------------------

impl Scenario {
    /// Load a scenario from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a scenario from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Scenario(format!("Failed to parse scenario YAML: {e}")))?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Validate scenario consistency against the standard screen.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Scenario("Scenario name must not be empty".to_string()));
        }

        let screen = PreferenceScreen::standard();
        for (idx, request) in self.requests.iter().enumerate() {
            if let Some(key) = &request.from {
                if !screen.contains(key) {
                    return Err(Error::Scenario(format!(
                        "Request #{idx} comes from unknown preference '{key}' in scenario '{}'",
                        self.name
                    )));
                }
            }
            for permission in request.answers.keys() {
                if !request.permissions.contains(permission) {
                    return Err(Error::Scenario(format!(
                        "Request #{idx} answers '{permission}' which it does not request in scenario '{}'",
                        self.name
                    )));
                }
            }
            if request.redeliver && !request.deliver {
                return Err(Error::Scenario(format!(
                    "Request #{idx} sets redeliver without deliver in scenario '{}'",
                    self.name
                )));
            }
        }

        for key in self.expect.items.keys() {
            if !screen.contains(key) {
                return Err(Error::Scenario(format!(
                    "Expectation references unknown item '{key}' in scenario '{}'",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Running scenarios
// ---------------------------------------------------------------------------

/// What happened to one scenario request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReport {
    pub index: usize,
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub disposition: DispositionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<RequestToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<PermissionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether a repeated delivery was ignored, when one was attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redelivery_ignored: Option<bool>,
    pub abandoned: bool,
}

impl RequestReport {
    fn new(index: usize, request: &ScenarioRequest) -> Self {
        Self {
            index,
            permissions: request.permissions.clone(),
            from: request.from.clone(),
            disposition: DispositionKind::Rejected,
            token: None,
            response: None,
            error: None,
            redelivery_ignored: None,
            abandoned: false,
        }
    }
}

/// Result of running a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub screen: ScreenSnapshot,
    pub requests: Vec<RequestReport>,
    pub decisions: Vec<GateDecision>,
    /// In-flight requests when the screen closed.
    pub pending: usize,
    pub backend_probe_runs: usize,
    pub shell_probe_runs: usize,
    pub failures: Vec<String>,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Human-readable summary.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = format!("scenario: {}\n\nitems:\n", self.name);
        for line in self.screen.render_plain().lines() {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }

        if !self.requests.is_empty() {
            out.push_str("\nrequests:\n");
            for req in &self.requests {
                let token = req
                    .token
                    .map_or_else(String::new, |t| format!(" token={t}"));
                let detail = match (&req.response, &req.error) {
                    (Some(resp), _) => {
                        let outcomes: Vec<&str> = resp.outcomes.iter().map(|o| o.as_str()).collect();
                        format!(" -> {}", outcomes.join(", "))
                    }
                    (None, Some(err)) => format!(" -> error: {err}"),
                    (None, None) if req.abandoned => " -> abandoned".to_string(),
                    (None, None) => String::new(),
                };
                out.push_str(&format!(
                    "  #{} [{}] {}{}{}\n",
                    req.index,
                    req.permissions.join(", "),
                    req.disposition.as_str(),
                    token,
                    detail
                ));
            }
        }

        out.push_str(&format!(
            "\nprobes: backend={} shell={}  pending={}\n",
            self.backend_probe_runs, self.shell_probe_runs, self.pending
        ));

        if self.passed() {
            out.push_str("result: PASS\n");
        } else {
            out.push_str(&format!("result: FAIL ({} failures)\n", self.failures.len()));
            for failure in &self.failures {
                out.push_str(&format!("  - {failure}\n"));
            }
        }
        out
    }
}

/// Drive a settings screen through `scenario` and check its expectations.
pub async fn run_scenario(scenario: &Scenario, config: &Config) -> Result<ScenarioReport> {
    let env = &scenario.environment;
    let permissions = Arc::new(SimulatedPermissions::new(env.granted.iter().cloned()));
    let probes = Arc::new(SimulatedProbes::from_environment(env));

    info!(scenario = %scenario.name, "running scenario");
    let host = SettingsHost::open(
        config.clone(),
        Arc::clone(&permissions) as Arc<dyn PermissionSubsystem>,
        Arc::clone(&probes) as Arc<dyn CapabilityProbes>,
    )?;
    host.settled().await;

    let mut reports = Vec::with_capacity(scenario.requests.len());
    let mut unanswered = Vec::new();

    for (idx, request) in scenario.requests.iter().enumerate() {
        let mut report = RequestReport::new(idx, request);

        let issuer = match &request.from {
            Some(key) => host.preference(key).and_then(|pref| pref.host()),
            None => Some(Arc::clone(&host)),
        };
        let Some(issuer) = issuer else {
            report.error = Some(format!(
                "preference '{}' is not on the screen",
                request.from.as_deref().unwrap_or_default()
            ));
            reports.push(report);
            continue;
        };

        let ticket = match issuer.ensure_permissions_async(request.permissions.clone()) {
            Ok(ticket) => ticket,
            Err(err) => {
                report.error = Some(err.to_string());
                reports.push(report);
                continue;
            }
        };
        drop(issuer);
        report.disposition = ticket.disposition().into();
        report.token = ticket.token();

        match ticket.token() {
            None => report.response = Some(ticket.wait().await?),
            Some(token) if request.deliver => {
                let (delivered, outcomes) = permissions
                    .answer(token, &request.answers)
                    .ok_or_else(|| Error::Runtime(format!("token {token} was never dispatched")))?;
                host.deliver_permission_result(token, delivered.clone(), outcomes.clone());
                report.response = Some(ticket.wait().await?);
                if request.redeliver {
                    let accepted = host.deliver_permission_result(token, delivered, outcomes);
                    report.redelivery_ignored = Some(!accepted);
                }
            }
            Some(_) => unanswered.push((idx, ticket)),
        }
        reports.push(report);
    }

    let pending = host.correlator().pending_count();
    let screen = host.snapshot();
    let decisions = host.gates().decisions();
    drop(host);

    for (idx, ticket) in unanswered {
        if matches!(ticket.wait().await, Err(Error::Cancelled(_))) {
            reports[idx].abandoned = true;
        }
    }

    let mut report = ScenarioReport {
        name: scenario.name.clone(),
        screen,
        requests: reports,
        decisions,
        pending,
        backend_probe_runs: probes.backend_runs(),
        shell_probe_runs: probes.shell_runs(),
        failures: Vec::new(),
    };
    report.failures = check_expectations(scenario, &report);
    info!(
        scenario = %scenario.name,
        passed = report.passed(),
        failures = report.failures.len(),
        "scenario finished"
    );
    Ok(report)
}

fn check_expectations(scenario: &Scenario, report: &ScenarioReport) -> Vec<String> {
    let mut failures = Vec::new();

    for item in GateTable::standard().items() {
        if report.screen.state(item) == Some(ItemState::Hidden) {
            failures.push(format!("item '{item}' was left hidden"));
        }
    }

    for (key, expected) in &scenario.expect.items {
        let actual = report.screen.state(key);
        if actual != Some(*expected) {
            failures.push(format!(
                "item '{key}': expected {expected}, got {}",
                actual.map_or("missing", ItemState::as_str)
            ));
        }
    }

    if let Some(expected) = scenario.expect.pending {
        if report.pending != expected {
            failures.push(format!(
                "pending requests: expected {expected}, got {}",
                report.pending
            ));
        }
    }
    if let Some(expected) = scenario.expect.backend_probe_runs {
        if report.backend_probe_runs != expected {
            failures.push(format!(
                "backend probe runs: expected {expected}, got {}",
                report.backend_probe_runs
            ));
        }
    }
    if let Some(expected) = scenario.expect.shell_probe_runs {
        if report.shell_probe_runs != expected {
            failures.push(format!(
                "shell probe runs: expected {expected}, got {}",
                report.shell_probe_runs
            ));
        }
    }

    for (request, actual) in scenario.requests.iter().zip(&report.requests) {
        if actual.redelivery_ignored == Some(false) {
            failures.push(format!("request #{}: callback resolved twice", actual.index));
        }
        let Some(expect) = &request.expect else {
            continue;
        };
        if let Some(disposition) = expect.disposition {
            if actual.disposition != disposition {
                failures.push(format!(
                    "request #{}: expected {}, got {}",
                    actual.index,
                    disposition.as_str(),
                    actual.disposition.as_str()
                ));
            }
        }
        if let Some(outcomes) = &expect.outcomes {
            let got = actual.response.as_ref().map(|r| &r.outcomes);
            if got != Some(outcomes) {
                failures.push(format!(
                    "request #{}: expected outcomes {outcomes:?}, got {got:?}",
                    actual.index
                ));
            }
        }
        if let Some(abandoned) = expect.abandoned {
            if actual.abandoned != abandoned {
                failures.push(format!(
                    "request #{}: expected abandoned={abandoned}, got {}",
                    actual.index, actual.abandoned
                ));
            }
        }
    }

    failures
}

// ---------------------------------------------------------------------------
// Duration deserialization
// ---------------------------------------------------------------------------

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a duration string like "250ms", "2s", "1m30s". A bare number is
/// seconds.
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() || ch == '.' {
            num_buf.push(ch);
            continue;
        }
        let val: f64 = num_buf
            .parse()
            .map_err(|_| format!("Invalid number in duration: '{num_buf}'"))?;
        num_buf.clear();
        let factor = match ch {
            'h' => 3_600_000.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1.0
            }
            'm' => 60_000.0,
            's' => 1_000.0,
            _ => return Err(format!("Unknown duration unit '{ch}' in '{s}'")),
        };
        total_ms = add_component(total_ms, val, factor, s)?;
    }

    if !num_buf.is_empty() {
        let val: f64 = num_buf
            .parse()
            .map_err(|_| format!("Invalid duration: '{s}'"))?;
        total_ms = add_component(total_ms, val, 1_000.0, s)?;
    }

    Ok(Duration::from_millis(total_ms))
}

fn add_component(total_ms: u64, val: f64, factor: f64, s: &str) -> std::result::Result<u64, String> {
    let ms = val * factor;
    // u64::MAX as f64 rounds up to 2^64, so `>=` keeps the cast in range.
    if !ms.is_finite() || ms >= u64::MAX as f64 {
        return Err(format!("Duration too large: '{s}'"));
    }
    total_ms
        .checked_add(ms as u64)
        .ok_or_else(|| format!("Duration too large: '{s}'"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::keys;

    const ROOTED_DEVICE: &str = r#"
name: rooted_device
description: "No kernel module, root available"
environment:
  granted: [CAMERA]
  backend: wg_quick
  module_loaded: false
  shell: available
  api_level: 28
requests:
  - permissions: [CAMERA]
    expect:
      disposition: satisfied
      outcomes: [granted]
  - permissions: [CAMERA, RECORD_AUDIO]
    answers:
      RECORD_AUDIO: denied
    redeliver: true
    expect:
      disposition: dispatched
      outcomes: [denied]
expect:
  items:
    module_downloader: visible
    kernel_module_disabler: removed
    tools_installer: visible
    dark_theme: visible
  pending: 0
  shell_probe_runs: 1
"#;

    #[test]
    fn parse_scenario() {
        let scenario = Scenario::from_yaml(ROOTED_DEVICE).unwrap();
        assert_eq!(scenario.name, "rooted_device");
        assert_eq!(scenario.environment.granted, vec!["CAMERA".to_string()]);
        assert_eq!(scenario.environment.shell, ShellBehavior::Available);
        assert_eq!(scenario.requests.len(), 2);
        assert!(scenario.requests[0].deliver);
        assert_eq!(
            scenario.requests[1].answers.get("RECORD_AUDIO"),
            Some(&OutcomeCode::Denied)
        );
        assert_eq!(
            scenario.expect.items.get(keys::MODULE_DOWNLOADER),
            Some(&ItemState::Visible)
        );
    }

    #[test]
    fn minimal_scenario_uses_defaults() {
        let scenario = Scenario::from_yaml("name: bare\n").unwrap();
        assert_eq!(scenario.environment.backend, BackendKind::WgQuick);
        assert_eq!(scenario.environment.api_level, 28);
        assert_eq!(scenario.environment.shell_delay, Duration::ZERO);
        assert!(scenario.requests.is_empty());
    }

    #[test]
    fn validate_unknown_expected_item() {
        let err = Scenario::from_yaml("name: x\nexpect:\n  items:\n    wifi: visible\n").unwrap_err();
        assert!(err.to_string().contains("unknown item 'wifi'"));
    }

    #[test]
    fn validate_unknown_request_source() {
        let yaml = "name: x\nrequests:\n  - permissions: [CAMERA]\n    from: nowhere\n";
        let err = Scenario::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown preference 'nowhere'"));
    }

    #[test]
    fn validate_answer_for_unrequested_permission() {
        let yaml = "name: x\nrequests:\n  - permissions: [CAMERA]\n    answers:\n      MIC: granted\n";
        let err = Scenario::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("answers 'MIC'"));
    }

    #[test]
    fn validate_redeliver_requires_deliver() {
        let yaml = "name: x\nrequests:\n  - permissions: [CAMERA]\n    deliver: false\n    redeliver: true\n";
        assert!(Scenario::from_yaml(yaml).is_err());
    }

    #[test]
    fn malformed_yaml_is_scenario_error() {
        let err = Scenario::from_yaml("name: [").unwrap_err();
        assert!(matches!(err, Error::Scenario(_)));
    }

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1_500));
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = parse_duration("99999999999999999999h1h").unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(parse_duration("18446744073709551615s").is_err());
        assert!(parse_duration("5124095576030431h5124095576030431h").is_err());

        let yaml = "name: x\nenvironment:\n  backend_delay: \"99999999999999999999h1h\"\n";
        assert!(matches!(Scenario::from_yaml(yaml), Err(Error::Scenario(_))));
    }

    #[test]
    fn simulated_answer_grants_stick() {
        let perms = SimulatedPermissions::default();
        perms.dispatch_request(&["CAMERA".to_string(), "MIC".to_string()], RequestToken(3));
        let answers = BTreeMap::from([("CAMERA".to_string(), OutcomeCode::Granted)]);
        let (delivered, outcomes) = perms.answer(RequestToken(3), &answers).unwrap();
        assert_eq!(delivered, vec!["CAMERA".to_string(), "MIC".to_string()]);
        assert_eq!(outcomes, vec![OutcomeCode::Granted, OutcomeCode::Denied]);
        assert!(perms.check_granted("CAMERA"));
        assert!(!perms.check_granted("MIC"));
        assert!(perms.answer(RequestToken(4), &answers).is_none());
    }

    #[tokio::test]
    async fn run_rooted_device_scenario() {
        let scenario = Scenario::from_yaml(ROOTED_DEVICE).unwrap();
        let report = run_scenario(&scenario, &Config::default()).await.unwrap();

        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.requests[0].token, None);
        assert_eq!(report.requests[1].token, Some(RequestToken(0)));
        assert_eq!(
            report.requests[1].response.as_ref().unwrap().permissions,
            vec!["RECORD_AUDIO".to_string()]
        );
        assert_eq!(report.requests[1].redelivery_ignored, Some(true));
        assert!(report.render_plain().contains("result: PASS"));
    }

    #[tokio::test]
    async fn unanswered_request_is_abandoned_on_close() {
        let yaml = r#"
name: walk_away
environment:
  module_loaded: true
requests:
  - permissions: [WRITE_EXTERNAL_STORAGE]
    from: zip_exporter
    deliver: false
    expect:
      disposition: dispatched
      abandoned: true
expect:
  pending: 1
  shell_probe_runs: 0
  items:
    module_downloader: removed
    kernel_module_disabler: visible
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        let report = run_scenario(&scenario, &Config::default()).await.unwrap();
        assert!(report.passed(), "{:?}", report.failures);
        assert!(report.requests[0].abandoned);
    }

    #[tokio::test]
    async fn request_from_removed_preference_is_rejected() {
        let yaml = r#"
name: removed_source
environment:
  module_loaded: true
requests:
  - permissions: [CAMERA]
    from: module_downloader
    expect:
      disposition: rejected
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        let report = run_scenario(&scenario, &Config::default()).await.unwrap();
        assert!(report.passed(), "{:?}", report.failures);
        assert!(report.requests[0].error.as_deref().unwrap().contains("not on the screen"));
    }

    #[tokio::test]
    async fn failed_expectations_are_reported() {
        let yaml = r#"
name: wrong_guess
environment:
  backend: userspace
expect:
  items:
    tools_installer: visible
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        let report = run_scenario(&scenario, &Config::default()).await.unwrap();
        assert!(!report.passed());
        assert_eq!(
            report.failures,
            vec!["item 'tools_installer': expected visible, got removed".to_string()]
        );
        assert!(report.render_plain().contains("result: FAIL (1 failures)"));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_shell_times_out() {
        let yaml = r#"
name: hang
environment:
  shell: hang
expect:
  items:
    module_downloader: removed
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        let mut config = Config::default();
        config.gates.shell_timeout_ms = 100;
        let report = run_scenario(&scenario, &config).await.unwrap();
        assert!(report.passed(), "{:?}", report.failures);
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let yaml = "name: empty\nrequests:\n  - permissions: []\n    expect:\n      disposition: rejected\n";
        let scenario = Scenario::from_yaml(yaml).unwrap();
        let report = run_scenario(&scenario, &Config::default()).await.unwrap();
        assert!(report.passed(), "{:?}", report.failures);
        assert!(report.requests[0].error.as_deref().unwrap().contains("empty"));
    }
}
