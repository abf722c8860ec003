//! The settings screen host.
//!
//! A [`SettingsHost`] is one live settings screen: it owns the preference
//! list, the permission correlator and the gate run. Preferences reach their
//! host through a [`PreferenceHandle`], which holds only a weak reference so
//! a handle outliving the screen simply finds nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::config::Config;
use crate::correlator::{PermissionTicket, RequestDisposition, SharedCorrelator};
use crate::error::{Error, Result};
use crate::gate::{GateHandle, GateSequencer, GateTable};
use crate::permissions::{OutcomeCode, PermissionResponse, PermissionSubsystem, RequestToken};
use crate::probes::CapabilityProbes;
use crate::screen::{ItemState, PreferenceScreen, PreferenceSurface, ScreenSnapshot};

/// One open settings screen.
pub struct SettingsHost {
    config: Config,
    correlator: SharedCorrelator,
    screen: Arc<Mutex<PreferenceScreen>>,
    gates: GateHandle,
}

impl std::fmt::Debug for SettingsHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsHost")
            .field("correlator", &self.correlator)
            .field("gates", &self.gates)
            .finish_non_exhaustive()
    }
}

impl SettingsHost {
    /// Open the standard settings screen and start its capability gates.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        config: Config,
        permissions: Arc<dyn PermissionSubsystem>,
        probes: Arc<dyn CapabilityProbes>,
    ) -> Result<Arc<Self>> {
        Self::open_with(
            config,
            PreferenceScreen::standard(),
            GateTable::standard(),
            permissions,
            probes,
        )
    }

    /// Open a screen with a custom item list and gate table.
    pub fn open_with(
        config: Config,
        screen: PreferenceScreen,
        table: GateTable,
        permissions: Arc<dyn PermissionSubsystem>,
        probes: Arc<dyn CapabilityProbes>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let sequencer = GateSequencer::new(table, probes, config.gates.settings())?;
        let screen = Arc::new(Mutex::new(screen));
        let gates = sequencer.start(&screen)?;
        let correlator =
            SharedCorrelator::with_max_pending(permissions, config.permissions.max_pending);
        info!(items = lock(&screen).len(), "settings screen opened");
        Ok(Arc::new(Self {
            config,
            correlator,
            screen,
            gates,
        }))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn correlator(&self) -> &SharedCorrelator {
        &self.correlator
    }

    #[must_use]
    pub fn gates(&self) -> &GateHandle {
        &self.gates
    }

    /// Request permissions; `callback` runs now or when the result arrives.
    ///
    /// The callback is stored in the host until the result arrives, so it
    /// must not own an `Arc<SettingsHost>`: that cycle keeps the host alive
    /// and `Drop` never runs. Capture a [`PreferenceHandle`] or a `Weak`
    /// instead, or call [`close`](Self::close) explicitly.
    pub fn ensure_permissions<F>(&self, permissions: Vec<String>, callback: F) -> Result<RequestDisposition>
    where
        F: FnOnce(PermissionResponse) + Send + 'static,
    {
        self.correlator.request(permissions, callback)
    }

    /// Request permissions and await the response through a ticket.
    pub fn ensure_permissions_async(&self, permissions: Vec<String>) -> Result<PermissionTicket> {
        self.correlator.request_async(permissions)
    }

    /// Entry point for the environment's answer.
    pub fn deliver_permission_result(
        &self,
        token: RequestToken,
        permissions: Vec<String>,
        outcomes: Vec<OutcomeCode>,
    ) -> bool {
        self.correlator.on_result(token, permissions, outcomes)
    }

    /// Same as [`deliver_permission_result`](Self::deliver_permission_result)
    /// for environments that report integer codes.
    pub fn deliver_raw_permission_result(
        &self,
        token: RequestToken,
        permissions: Vec<String>,
        codes: &[i32],
    ) -> bool {
        let outcomes = codes.iter().copied().map(OutcomeCode::from_raw).collect();
        self.deliver_permission_result(token, permissions, outcomes)
    }

    /// Wait for outstanding capability probes.
    pub async fn settled(&self) {
        self.gates.settled().await;
    }

    #[must_use]
    pub fn item_state(&self, key: &str) -> Option<ItemState> {
        lock(&self.screen).state(key)
    }

    #[must_use]
    pub fn snapshot(&self) -> ScreenSnapshot {
        lock(&self.screen).snapshot()
    }

    /// Cancel outstanding probes and drop pending permission requests
    /// without invoking them. Idempotent; also run on drop.
    pub fn close(&self) -> usize {
        self.gates.cancel();
        let abandoned = self.correlator.abandon_all();
        debug!(abandoned, "settings screen closed");
        abandoned
    }

    /// Handle for a preference still on the screen.
    #[must_use]
    pub fn preference(self: &Arc<Self>, key: &str) -> Option<PreferenceHandle> {
        match self.item_state(key) {
            None | Some(ItemState::Removed) => None,
            Some(_) => Some(PreferenceHandle {
                key: key.to_string(),
                host: Arc::downgrade(self),
            }),
        }
    }
}

impl Drop for SettingsHost {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A preference's way back to the screen that shows it.
#[derive(Debug, Clone)]
pub struct PreferenceHandle {
    key: String,
    host: Weak<SettingsHost>,
}

impl PreferenceHandle {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owning host, or `None` once it has been closed.
    #[must_use]
    pub fn host(&self) -> Option<Arc<SettingsHost>> {
        self.host.upgrade()
    }

    #[must_use]
    pub fn state(&self) -> Option<ItemState> {
        self.host().and_then(|host| host.item_state(&self.key))
    }

    /// Request permissions through the owning host.
    pub fn ensure_permissions<F>(&self, permissions: Vec<String>, callback: F) -> Result<RequestDisposition>
    where
        F: FnOnce(PermissionResponse) + Send + 'static,
    {
        let host = self.host().ok_or_else(|| {
            Error::Cancelled(format!("settings screen for '{}' is closed", self.key))
        })?;
        host.ensure_permissions(permissions, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CorrelatorError;
    use crate::probes::BackendKind;
    use crate::screen::keys;
    use crate::simulation::{SimulatedPermissions, SimulatedProbes};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn open(permissions: &Arc<SimulatedPermissions>) -> Arc<SettingsHost> {
        SettingsHost::open(
            Config::default(),
            Arc::clone(permissions) as Arc<dyn PermissionSubsystem>,
            Arc::new(SimulatedProbes::new(BackendKind::WgQuick, false)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn open_runs_gates() {
        let host = open(&Arc::new(SimulatedPermissions::default()));
        host.settled().await;
        assert_eq!(host.item_state(keys::TOOLS_INSTALLER), Some(ItemState::Visible));
        assert_eq!(host.item_state(keys::KERNEL_MODULE_DISABLER), Some(ItemState::Removed));
        assert_eq!(host.item_state(keys::MODULE_DOWNLOADER), Some(ItemState::Visible));
    }

    #[tokio::test]
    async fn fast_path_through_host() {
        let permissions = Arc::new(SimulatedPermissions::new(["CAMERA"]));
        let host = open(&permissions);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);

        let d = host
            .ensure_permissions(strings(&["CAMERA"]), move |resp| {
                *sink.lock().unwrap() = Some(resp);
            })
            .unwrap();

        assert_eq!(d, RequestDisposition::Satisfied);
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(PermissionResponse::new(strings(&["CAMERA"]), vec![OutcomeCode::Granted]))
        );
        assert_eq!(host.correlator().pending_count(), 0);
        assert!(permissions.dispatched().is_empty());
    }

    #[tokio::test]
    async fn raw_codes_map_to_outcomes() {
        let host = open(&Arc::new(SimulatedPermissions::default()));
        let ticket = host.ensure_permissions_async(strings(&["CAMERA", "MIC"])).unwrap();
        assert_eq!(ticket.token(), Some(RequestToken(0)));

        assert!(host.deliver_raw_permission_result(RequestToken(0), strings(&["CAMERA", "MIC"]), &[0, -1]));
        let resp = ticket.wait().await.unwrap();
        assert_eq!(resp.outcomes, vec![OutcomeCode::Granted, OutcomeCode::Denied]);
        assert_eq!(host.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn max_pending_comes_from_config() {
        let mut config = Config::default();
        config.permissions.max_pending = 1;
        let host = SettingsHost::open(
            config,
            Arc::new(SimulatedPermissions::default()),
            Arc::new(SimulatedProbes::new(BackendKind::WgQuick, true)),
        )
        .unwrap();

        let _first = host.ensure_permissions_async(strings(&["CAMERA"])).unwrap();
        let err = host.ensure_permissions_async(strings(&["MIC"])).unwrap_err();
        assert!(matches!(
            err,
            Error::Correlator(CorrelatorError::TooManyPending { limit: 1 })
        ));
    }

    #[tokio::test]
    async fn preference_finds_its_host() {
        let host = open(&Arc::new(SimulatedPermissions::default()));
        let pref = host.preference(keys::ZIP_EXPORTER).unwrap();
        let found = pref.host().unwrap();
        assert!(Arc::ptr_eq(&found, &host));
        assert_eq!(pref.key(), keys::ZIP_EXPORTER);
        assert_eq!(pref.state(), Some(ItemState::Visible));
    }

    #[tokio::test]
    async fn removed_or_unknown_preference_has_no_handle() {
        let host = open(&Arc::new(SimulatedPermissions::default()));
        assert!(host.preference(keys::KERNEL_MODULE_DISABLER).is_none());
        assert!(host.preference("missing").is_none());
    }

    #[tokio::test]
    async fn preference_requests_through_host() {
        let permissions = Arc::new(SimulatedPermissions::default());
        let host = open(&permissions);
        let pref = host.preference(keys::ZIP_EXPORTER).unwrap();

        let d = pref
            .ensure_permissions(strings(&["WRITE_EXTERNAL_STORAGE"]), |_| {})
            .unwrap();
        assert_eq!(d, RequestDisposition::Dispatched(RequestToken(0)));
        assert_eq!(
            permissions.dispatched_for(RequestToken(0)),
            Some(strings(&["WRITE_EXTERNAL_STORAGE"]))
        );
    }

    #[tokio::test]
    async fn closing_host_abandons_requests_and_detaches_handles() {
        let host = open(&Arc::new(SimulatedPermissions::default()));
        let pref = host.preference(keys::LOG_VIEWER).unwrap();
        let ticket = host.ensure_permissions_async(strings(&["CAMERA"])).unwrap();
        let correlator = host.correlator().clone();

        drop(host);

        assert!(pref.host().is_none());
        assert_eq!(pref.state(), None);
        assert!(matches!(
            pref.ensure_permissions(strings(&["CAMERA"]), |_| {}),
            Err(Error::Cancelled(_))
        ));
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.on_result(RequestToken(0), strings(&["CAMERA"]), vec![OutcomeCode::Granted]));
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled(_))));
    }

    #[test]
    fn open_outside_runtime_fails() {
        let err = SettingsHost::open(
            Config::default(),
            Arc::new(SimulatedPermissions::default()),
            Arc::new(SimulatedProbes::new(BackendKind::WgQuick, false)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Gate(crate::error::GateError::NoRuntime)));
    }

    #[tokio::test]
    async fn close_breaks_callback_cycle() {
        let host = open(&Arc::new(SimulatedPermissions::default()));
        let captured = Arc::clone(&host);
        let d = host
            .ensure_permissions(strings(&["CAMERA"]), move |_| {
                let _ = captured.item_state(keys::DARK_THEME);
            })
            .unwrap();
        assert_eq!(d, RequestDisposition::Dispatched(RequestToken(0)));
        assert_eq!(Arc::strong_count(&host), 2);

        assert_eq!(host.close(), 1);
        assert_eq!(Arc::strong_count(&host), 1);
        assert!(host.gates().is_cancelled());
        assert_eq!(host.close(), 0);

        let weak = Arc::downgrade(&host);
        drop(host);
        assert!(weak.upgrade().is_none());
    }
}
