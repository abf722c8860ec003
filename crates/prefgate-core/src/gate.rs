//! Capability gate sequencer.
//!
//! Which settings items a screen shows depends on what the device can do. The
//! rules live in a small declarative [`GateTable`]: each rule names an item,
//! the probe that governs it, and the [`Policy`] to apply when the probe
//! reports the capability as present or absent. A policy either resolves the
//! item (`Show`, `Remove`) or hands it to another probe (`Defer`).
//!
//! ```text
//! construction:  evaluate root rules ── sync probe ──► apply now
//!                                   └─ async probe ─► hide its items, spawn task
//! completion:    screen alive? ── no ──► drop result
//!                  │ yes
//!                  ▼
//!                policy = present ? on_success : on_failure
//!                Show / Remove  ──► resolve item (at most once)
//!                Defer(probe)   ──► evaluate that probe's rule for the item
//! ```
//!
//! Each probe runs at most once per screen. A rule that defers to a probe
//! already running waits for that run; one that defers to a finished probe
//! reuses its outcome.
//!
//! Probe tasks only hold a weak reference to the screen, so closing the
//! screen never waits on a probe and late results are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{GateError, ProbeError};
use crate::probes::{BackendKind, CapabilityProbes, ProbeOutcome};
use crate::screen::{PreferenceSurface, keys};

/// Identifies a capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeId {
    /// Async: the resolved tunnel backend matches the configured target.
    BackendKind,
    /// Sync: the kernel module is loaded.
    ModuleLoaded,
    /// Async: a privileged shell can be started.
    PrivilegedShell,
    /// Sync: the platform supplies its own dark theme.
    SystemTheme,
}

impl ProbeId {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BackendKind => "backend_kind",
            Self::ModuleLoaded => "module_loaded",
            Self::PrivilegedShell => "privileged_shell",
            Self::SystemTheme => "system_theme",
        }
    }

    #[must_use]
    pub const fn is_async(self) -> bool {
        matches!(self, Self::BackendKind | Self::PrivilegedShell)
    }
}

impl std::fmt::Display for ProbeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with an item once its probe reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Show,
    Remove,
    /// Resolve nothing; evaluate another probe for the same item.
    Defer(ProbeId),
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Show => f.write_str("show"),
            Self::Remove => f.write_str("remove"),
            Self::Defer(probe) => write!(f, "defer({probe})"),
        }
    }
}

/// One row of the gate table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRule {
    pub item: String,
    pub probe: ProbeId,
    pub on_success: Policy,
    pub on_failure: Policy,
}

impl GateRule {
    #[must_use]
    pub fn new(item: impl Into<String>, probe: ProbeId, on_success: Policy, on_failure: Policy) -> Self {
        Self {
            item: item.into(),
            probe,
            on_success,
            on_failure,
        }
    }

    fn defers(&self) -> impl Iterator<Item = ProbeId> {
        [self.on_success, self.on_failure]
            .into_iter()
            .filter_map(|policy| match policy {
                Policy::Defer(probe) => Some(probe),
                _ => None,
            })
    }
}

/// Ordered set of gate rules.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateTable {
    rules: Vec<GateRule>,
}

impl GateTable {
    #[must_use]
    pub fn new(rules: Vec<GateRule>) -> Self {
        Self { rules }
    }

    /// Rules for the standard settings screen.
    #[must_use]
    pub fn standard() -> Self {
        use Policy::{Defer, Remove, Show};
        Self::new(vec![
            GateRule::new(keys::TOOLS_INSTALLER, ProbeId::BackendKind, Show, Remove),
            GateRule::new(keys::RESTORE_ON_BOOT, ProbeId::BackendKind, Show, Remove),
            GateRule::new(keys::MULTIPLE_TUNNELS, ProbeId::BackendKind, Show, Remove),
            GateRule::new(
                keys::MODULE_DOWNLOADER,
                ProbeId::ModuleLoaded,
                Remove,
                Defer(ProbeId::PrivilegedShell),
            ),
            GateRule::new(keys::KERNEL_MODULE_DISABLER, ProbeId::ModuleLoaded, Show, Remove),
            GateRule::new(keys::MODULE_DOWNLOADER, ProbeId::PrivilegedShell, Show, Remove),
            GateRule::new(keys::DARK_THEME, ProbeId::SystemTheme, Remove, Show),
        ])
    }

    #[must_use]
    pub fn rules(&self) -> &[GateRule] {
        &self.rules
    }

    /// Governed items, in first-appearance order.
    #[must_use]
    pub fn items(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.rules
            .iter()
            .map(|rule| rule.item.as_str())
            .filter(|item| seen.insert(*item))
            .collect()
    }

    #[must_use]
    pub fn rule(&self, item: &str, probe: ProbeId) -> Option<&GateRule> {
        self.rules
            .iter()
            .find(|rule| rule.item == item && rule.probe == probe)
    }

    fn rules_for<'a>(&'a self, item: &'a str) -> impl Iterator<Item = &'a GateRule> + 'a {
        self.rules.iter().filter(move |rule| rule.item == item)
    }

    /// Rules evaluated at construction: those no other rule defers to.
    #[must_use]
    pub fn root_rules(&self) -> Vec<&GateRule> {
        self.rules
            .iter()
            .filter(|rule| {
                !self
                    .rules_for(&rule.item)
                    .any(|other| other.defers().any(|p| p == rule.probe))
            })
            .collect()
    }

    /// Root rules grouped by probe so each probe runs once at construction.
    fn root_batches(&self) -> BTreeMap<ProbeId, Vec<GateRule>> {
        let mut batches: BTreeMap<ProbeId, Vec<GateRule>> = BTreeMap::new();
        for rule in self.root_rules() {
            batches.entry(rule.probe).or_default().push(rule.clone());
        }
        batches
    }

    /// Check that every item has a single acyclic chain of rules.
    pub fn validate(&self) -> Result<(), GateError> {
        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            if !seen.insert((rule.item.as_str(), rule.probe)) {
                return Err(GateError::DuplicateRule {
                    item: rule.item.clone(),
                    probe: rule.probe,
                });
            }
        }

        for rule in &self.rules {
            for target in rule.defers() {
                if self.rule(&rule.item, target).is_none() {
                    return Err(GateError::DanglingDefer {
                        item: rule.item.clone(),
                        probe: target,
                    });
                }
            }
        }

        let roots = self.root_rules();
        for item in self.items() {
            let item_roots: Vec<&GateRule> =
                roots.iter().copied().filter(|rule| rule.item == item).collect();
            let root = match item_roots.as_slice() {
                [] => {
                    return Err(GateError::DeferCycle {
                        item: item.to_string(),
                    });
                }
                [root] => *root,
                _ => {
                    return Err(GateError::MultipleRoots {
                        item: item.to_string(),
                    });
                }
            };

            let mut visited = BTreeSet::new();
            self.walk_chain(item, root, &mut Vec::new(), &mut visited)?;
            if visited.len() != self.rules_for(item).count() {
                // Rules that are only reachable from each other.
                return Err(GateError::DeferCycle {
                    item: item.to_string(),
                });
            }
        }
        Ok(())
    }

    fn walk_chain(
        &self,
        item: &str,
        rule: &GateRule,
        path: &mut Vec<ProbeId>,
        visited: &mut BTreeSet<ProbeId>,
    ) -> Result<(), GateError> {
        if path.contains(&rule.probe) {
            return Err(GateError::DeferCycle {
                item: item.to_string(),
            });
        }
        visited.insert(rule.probe);
        path.push(rule.probe);
        for target in rule.defers() {
            if let Some(next) = self.rule(item, target) {
                self.walk_chain(item, next, path, visited)?;
            }
        }
        path.pop();
        Ok(())
    }
}

/// Probe parameters that come from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSettings {
    /// Backend kind under which the backend-gated items are shown.
    pub target_backend: BackendKind,
    /// Upper bound on the privileged shell probe.
    pub shell_timeout: Duration,
    /// API level from which the platform provides a system dark theme.
    pub dark_theme_min_api: u32,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            target_backend: BackendKind::WgQuick,
            shell_timeout: Duration::from_millis(5_000),
            dark_theme_min_api: 29,
        }
    }
}

/// One entry of the decision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub item: String,
    pub probe: ProbeId,
    pub outcome: ProbeOutcome,
    pub policy: Policy,
    /// False when the item had already been resolved.
    pub applied: bool,
}

/// Progress of one probe within a run.
#[derive(Debug)]
enum ProbeRun {
    /// Still running; the rules waiting on its outcome.
    Pending(Vec<GateRule>),
    Done(ProbeOutcome),
}

#[derive(Debug, Default)]
struct RunState {
    probes: BTreeMap<ProbeId, ProbeRun>,
    resolved: BTreeSet<String>,
    decisions: Vec<GateDecision>,
    tasks: Vec<AbortHandle>,
    cancelled: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Keeps the outstanding-probe count accurate even when a task is aborted.
struct TaskGuard {
    outstanding: Arc<watch::Sender<usize>>,
}

impl TaskGuard {
    fn new(outstanding: Arc<watch::Sender<usize>>) -> Self {
        outstanding.send_modify(|n| *n += 1);
        Self { outstanding }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Validated gate table bound to a set of probes.
pub struct GateSequencer {
    table: GateTable,
    probes: Arc<dyn CapabilityProbes>,
    settings: GateSettings,
}

impl std::fmt::Debug for GateSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateSequencer")
            .field("table", &self.table)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl GateSequencer {
    pub fn new(
        table: GateTable,
        probes: Arc<dyn CapabilityProbes>,
        settings: GateSettings,
    ) -> Result<Self, GateError> {
        table.validate()?;
        Ok(Self {
            table,
            probes,
            settings,
        })
    }

    /// Evaluate sync probes and spawn async ones, hiding the items that wait
    /// on them.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(self, screen: &Arc<Mutex<S>>) -> Result<GateHandle, GateError>
    where
        S: PreferenceSurface + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| GateError::NoRuntime)?;
        let (tx, rx) = watch::channel(0_usize);
        let state = Arc::new(Mutex::new(RunState::default()));
        let run = Arc::new(GateRun {
            table: self.table,
            probes: self.probes,
            settings: self.settings,
            screen: Arc::downgrade(screen),
            state: Arc::clone(&state),
            outstanding: Arc::new(tx),
            runtime,
        });

        {
            let mut surface = lock(screen);
            let mut run_state = lock(&state);
            for (probe, rules) in run.table.root_batches() {
                run.dispatch(&mut surface, &mut run_state, probe, rules);
            }
        }

        Ok(GateHandle {
            state,
            outstanding: rx,
        })
    }
}

struct GateRun<S> {
    table: GateTable,
    probes: Arc<dyn CapabilityProbes>,
    settings: GateSettings,
    screen: Weak<Mutex<S>>,
    state: Arc<Mutex<RunState>>,
    outstanding: Arc<watch::Sender<usize>>,
    runtime: Handle,
}

impl<S> GateRun<S>
where
    S: PreferenceSurface + 'static,
{
    fn dispatch(
        self: &Arc<Self>,
        screen: &mut S,
        state: &mut RunState,
        probe: ProbeId,
        rules: Vec<GateRule>,
    ) {
        if let Some(ProbeRun::Pending(waiting)) = state.probes.get_mut(&probe) {
            debug!(probe = %probe, items = rules.len(), "probe already running; queueing items");
            for rule in &rules {
                if !state.resolved.contains(&rule.item) {
                    screen.set_visible(&rule.item, false);
                }
            }
            waiting.extend(rules);
            return;
        }

        let outcome = match state.probes.get(&probe) {
            Some(ProbeRun::Done(outcome)) => {
                debug!(probe = %probe, outcome = %outcome, "reusing probe outcome");
                outcome.clone()
            }
            _ if probe.is_async() => {
                for rule in &rules {
                    if !state.resolved.contains(&rule.item) {
                        screen.set_visible(&rule.item, false);
                    }
                }
                debug!(probe = %probe, items = rules.len(), "starting async probe");
                state.probes.insert(probe, ProbeRun::Pending(rules));
                self.spawn_probe(state, probe);
                return;
            }
            _ => {
                let outcome = self.evaluate_sync(probe);
                debug!(probe = %probe, outcome = %outcome, "sync probe evaluated");
                state.probes.insert(probe, ProbeRun::Done(outcome.clone()));
                outcome
            }
        };
        for rule in &rules {
            self.apply(screen, state, rule, outcome.clone());
        }
    }

    fn evaluate_sync(&self, probe: ProbeId) -> ProbeOutcome {
        match probe {
            ProbeId::ModuleLoaded => ProbeOutcome::from_bool(self.probes.is_module_loaded()),
            ProbeId::SystemTheme => ProbeOutcome::from_bool(
                self.probes.platform_api_level() >= self.settings.dark_theme_min_api,
            ),
            ProbeId::BackendKind | ProbeId::PrivilegedShell => {
                ProbeOutcome::Failed(format!("{probe} cannot be evaluated synchronously"))
            }
        }
    }

    async fn evaluate_async(&self, probe: ProbeId) -> ProbeOutcome {
        match probe {
            ProbeId::BackendKind => {
                let kind = self.probes.backend_kind().await;
                debug!(backend = %kind, target = %self.settings.target_backend, "backend resolved");
                ProbeOutcome::from_bool(kind == self.settings.target_backend)
            }
            ProbeId::PrivilegedShell => {
                let limit = self.settings.shell_timeout;
                match tokio::time::timeout(limit, self.probes.start_privileged_shell()).await {
                    Ok(result) => ProbeOutcome::from(result),
                    Err(_) => ProbeOutcome::from(Err(ProbeError::TimedOut {
                        after_ms: duration_ms(limit),
                    })),
                }
            }
            ProbeId::ModuleLoaded | ProbeId::SystemTheme => self.evaluate_sync(probe),
        }
    }

    fn spawn_probe(self: &Arc<Self>, state: &mut RunState, probe: ProbeId) {
        let guard = TaskGuard::new(Arc::clone(&self.outstanding));
        let run = Arc::clone(self);
        let task = self.runtime.spawn(async move {
            let _guard = guard;
            let outcome = run.evaluate_async(probe).await;
            run.complete(probe, outcome);
        });
        state.tasks.push(task.abort_handle());
    }

    fn complete(self: &Arc<Self>, probe: ProbeId, outcome: ProbeOutcome) {
        let Some(screen) = self.screen.upgrade() else {
            debug!(probe = %probe, outcome = %outcome, "screen closed; dropping probe result");
            return;
        };
        let mut surface = lock(&screen);
        let mut state = lock(&self.state);
        if state.cancelled {
            debug!(probe = %probe, "gates cancelled; dropping probe result");
            return;
        }
        debug!(probe = %probe, outcome = %outcome, "async probe completed");
        let rules = match state.probes.insert(probe, ProbeRun::Done(outcome.clone())) {
            Some(ProbeRun::Pending(rules)) => rules,
            _ => Vec::new(),
        };
        for rule in &rules {
            self.apply(&mut surface, &mut state, rule, outcome.clone());
        }
    }

    fn apply(self: &Arc<Self>, screen: &mut S, state: &mut RunState, rule: &GateRule, outcome: ProbeOutcome) {
        let policy = if outcome.is_present() {
            rule.on_success
        } else {
            rule.on_failure
        };

        let applied = match policy {
            Policy::Show | Policy::Remove => {
                if state.resolved.insert(rule.item.clone()) {
                    if policy == Policy::Show {
                        screen.set_visible(&rule.item, true);
                    } else {
                        screen.remove(&rule.item);
                    }
                    info!(item = %rule.item, probe = %rule.probe, outcome = %outcome, policy = %policy, "item resolved");
                    true
                } else {
                    warn!(item = %rule.item, probe = %rule.probe, "item already resolved; ignoring");
                    false
                }
            }
            Policy::Defer(next) => self.table.rule(&rule.item, next).is_some(),
        };

        state.decisions.push(GateDecision {
            item: rule.item.clone(),
            probe: rule.probe,
            outcome,
            policy,
            applied,
        });

        if let Policy::Defer(next) = policy {
            match self.table.rule(&rule.item, next) {
                Some(next_rule) => {
                    debug!(item = %rule.item, from = %rule.probe, to = %next, "deferring item");
                    let next_rule = next_rule.clone();
                    self.dispatch(screen, state, next, vec![next_rule]);
                }
                None => warn!(item = %rule.item, probe = %next, "defer target has no rule"),
            }
        }
    }
}

/// Control handle for a started gate run.
#[derive(Debug, Clone)]
pub struct GateHandle {
    state: Arc<Mutex<RunState>>,
    outstanding: watch::Receiver<usize>,
}

impl GateHandle {
    /// Abort outstanding probes. Their results, if any arrive, are dropped.
    pub fn cancel(&self) {
        let tasks = {
            let mut state = lock(&self.state);
            state.cancelled = true;
            std::mem::take(&mut state.tasks)
        };
        if !tasks.is_empty() {
            debug!(tasks = tasks.len(), "cancelling probe tasks");
        }
        for task in tasks {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    /// Number of probe tasks still running.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until no probe task is running.
    pub async fn settled(&self) {
        let mut rx = self.outstanding.clone();
        let _ = rx.wait_for(|n| *n == 0).await.map(|_| ());
    }

    #[must_use]
    pub fn decisions(&self) -> Vec<GateDecision> {
        lock(&self.state).decisions.clone()
    }

    #[must_use]
    pub fn is_resolved(&self, item: &str) -> bool {
        lock(&self.state).resolved.contains(item)
    }
}
