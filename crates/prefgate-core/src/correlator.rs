//! Permission request correlation.
//!
//! A permission prompt is issued on one call path and answered on another:
//! the environment calls back into the host with `(token, permissions,
//! outcomes)` long after the caller has returned. The correlator bridges the
//! two by storing the caller's callback under a fresh [`RequestToken`] and
//! resolving it when a response carrying the same token arrives.
//!
//! ```text
//! request(perms, cb) ──► all granted? ──yes──► cb(perms, [Granted..])   (no token)
//!                              │
//!                              no
//!                              ▼
//!                  token = next++ ; table[token] = cb ; dispatch(needed, token)
//!
//! on_result(token, perms, outcomes) ──► table.remove(token) ──► cb(perms, outcomes)
//!                                              │
//!                                              └── missing ──► no-op
//! ```
//!
//! Two flavours share [`PendingTable`]:
//!
//! * [`RequestCorrelator`] is owned by a single UI context and mutated through
//!   `&mut self`.
//! * [`SharedCorrelator`] is cloneable. Its table sits behind a mutex that is
//!   released before dispatching and before invoking callbacks, so callbacks
//!   and synchronous environments may call back into it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CorrelatorError, Error, Result};
use crate::permissions::{
    OutcomeCode, PermissionResponse, PermissionSubsystem, RequestToken, needed_permissions,
};

/// Default cap on in-flight requests per host.
pub const DEFAULT_MAX_PENDING: usize = 64;

/// Callback resolved exactly once with the environment's answer.
pub type PermissionCallback = Box<dyn FnOnce(PermissionResponse) + Send>;

/// A stored request waiting for its response.
pub struct PendingRequest {
    pub token: RequestToken,
    /// Permissions the caller asked for.
    pub requested: Vec<String>,
    /// Subset that was actually dispatched.
    pub dispatched: Vec<String>,
    callback: PermissionCallback,
}

impl PendingRequest {
    fn resolve(self, response: PermissionResponse) {
        (self.callback)(response);
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("token", &self.token)
            .field("requested", &self.requested)
            .field("dispatched", &self.dispatched)
            .finish_non_exhaustive()
    }
}

/// How a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Everything was already granted; the callback already ran.
    Satisfied,
    /// A prompt was dispatched under this token.
    Dispatched(RequestToken),
}

impl RequestDisposition {
    #[must_use]
    pub const fn token(self) -> Option<RequestToken> {
        match self {
            Self::Satisfied => None,
            Self::Dispatched(token) => Some(token),
        }
    }
}

/// Token-keyed table of in-flight requests.
///
/// Invariants: at most one entry per token, tokens strictly increase and are
/// never handed out twice, and `len()` equals the number of in-flight
/// requests.
#[derive(Debug)]
pub struct PendingTable {
    entries: BTreeMap<RequestToken, PendingRequest>,
    next_token: u64,
    max_pending: usize,
}

impl PendingTable {
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_token: 0,
            max_pending: max_pending.max(1),
        }
    }

    fn insert(
        &mut self,
        requested: Vec<String>,
        dispatched: Vec<String>,
        callback: PermissionCallback,
    ) -> std::result::Result<RequestToken, CorrelatorError> {
        if self.entries.len() >= self.max_pending {
            return Err(CorrelatorError::TooManyPending {
                limit: self.max_pending,
            });
        }
        let token = RequestToken(self.next_token);
        self.next_token = self
            .next_token
            .checked_add(1)
            .ok_or(CorrelatorError::TokenSpaceExhausted)?;
        self.entries.insert(
            token,
            PendingRequest {
                token,
                requested,
                dispatched,
                callback,
            },
        );
        Ok(token)
    }

    fn take(&mut self, token: RequestToken) -> Option<PendingRequest> {
        self.entries.remove(&token)
    }

    fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, token: RequestToken) -> bool {
        self.entries.contains_key(&token)
    }

    /// In-flight tokens in allocation order.
    #[must_use]
    pub fn tokens(&self) -> Vec<RequestToken> {
        self.entries.keys().copied().collect()
    }

    /// The token the next dispatched request will receive.
    #[must_use]
    pub fn next_token(&self) -> RequestToken {
        RequestToken(self.next_token)
    }

    #[cfg(test)]
    pub(crate) fn set_next_token(&mut self, next: u64) {
        self.next_token = next;
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

fn check_lengths(token: RequestToken, permissions: &[String], outcomes: &[OutcomeCode]) {
    if permissions.len() != outcomes.len() {
        warn!(
            token = %token,
            permissions = permissions.len(),
            outcomes = outcomes.len(),
            "permission result vectors differ in length; forwarding unchanged"
        );
    }
}

// =============================================================================
// Single-owner correlator
// =============================================================================

/// Correlator owned by one UI context.
#[derive(Debug)]
pub struct RequestCorrelator<P> {
    subsystem: P,
    table: PendingTable,
}

impl<P: PermissionSubsystem> RequestCorrelator<P> {
    #[must_use]
    pub fn new(subsystem: P) -> Self {
        Self::with_max_pending(subsystem, DEFAULT_MAX_PENDING)
    }

    #[must_use]
    pub fn with_max_pending(subsystem: P, max_pending: usize) -> Self {
        Self {
            subsystem,
            table: PendingTable::new(max_pending),
        }
    }

    /// Request `permissions`, resolving `callback` now or when the matching
    /// result arrives.
    pub fn request<F>(&mut self, permissions: Vec<String>, callback: F) -> Result<RequestDisposition>
    where
        F: FnOnce(PermissionResponse) + Send + 'static,
    {
        if permissions.is_empty() {
            return Err(CorrelatorError::EmptyRequest.into());
        }
        let needed = needed_permissions(&self.subsystem, &permissions);
        if needed.is_empty() {
            debug!(count = permissions.len(), "permissions already granted");
            callback(PermissionResponse::all_granted_for(permissions));
            return Ok(RequestDisposition::Satisfied);
        }

        let token = self
            .table
            .insert(permissions, needed.clone(), Box::new(callback))?;
        debug!(token = %token, needed = needed.len(), "dispatching permission request");
        self.subsystem.dispatch_request(&needed, token);
        Ok(RequestDisposition::Dispatched(token))
    }

    /// Deliver the environment's answer. Returns `false` for unknown or
    /// already-resolved tokens.
    pub fn on_result(
        &mut self,
        token: RequestToken,
        permissions: Vec<String>,
        outcomes: Vec<OutcomeCode>,
    ) -> bool {
        let Some(entry) = self.table.take(token) else {
            debug!(token = %token, "ignoring permission result for unknown token");
            return false;
        };
        check_lengths(token, &permissions, &outcomes);
        entry.resolve(PermissionResponse::new(permissions, outcomes));
        true
    }

    /// Drop every pending request without invoking it.
    pub fn abandon_all(&mut self) -> usize {
        let dropped = self.table.clear();
        if dropped > 0 {
            debug!(dropped, "abandoned pending permission requests");
        }
        dropped
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_pending(&self, token: RequestToken) -> bool {
        self.table.contains(token)
    }

    #[must_use]
    pub fn pending_tokens(&self) -> Vec<RequestToken> {
        self.table.tokens()
    }

    #[must_use]
    pub fn subsystem(&self) -> &P {
        &self.subsystem
    }

    #[cfg(test)]
    pub(crate) fn table_mut(&mut self) -> &mut PendingTable {
        &mut self.table
    }
}

// =============================================================================
// Shared correlator
// =============================================================================

/// Cloneable correlator whose table is guarded by a mutex.
#[derive(Clone)]
pub struct SharedCorrelator {
    subsystem: Arc<dyn PermissionSubsystem>,
    table: Arc<Mutex<PendingTable>>,
}

impl std::fmt::Debug for SharedCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCorrelator")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl SharedCorrelator {
    #[must_use]
    pub fn new(subsystem: Arc<dyn PermissionSubsystem>) -> Self {
        Self::with_max_pending(subsystem, DEFAULT_MAX_PENDING)
    }

    #[must_use]
    pub fn with_max_pending(subsystem: Arc<dyn PermissionSubsystem>, max_pending: usize) -> Self {
        Self {
            subsystem,
            table: Arc::new(Mutex::new(PendingTable::new(max_pending))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request `permissions`, resolving `callback` now or when the matching
    /// result arrives.
    pub fn request<F>(&self, permissions: Vec<String>, callback: F) -> Result<RequestDisposition>
    where
        F: FnOnce(PermissionResponse) + Send + 'static,
    {
        if permissions.is_empty() {
            return Err(CorrelatorError::EmptyRequest.into());
        }
        let needed = needed_permissions(self.subsystem.as_ref(), &permissions);
        if needed.is_empty() {
            debug!(count = permissions.len(), "permissions already granted");
            callback(PermissionResponse::all_granted_for(permissions));
            return Ok(RequestDisposition::Satisfied);
        }

        let token = self
            .lock()
            .insert(permissions, needed.clone(), Box::new(callback))?;
        debug!(token = %token, needed = needed.len(), "dispatching permission request");
        self.subsystem.dispatch_request(&needed, token);
        Ok(RequestDisposition::Dispatched(token))
    }

    /// Request `permissions` and get a ticket that resolves to the response.
    ///
    /// The ticket fails with [`Error::Cancelled`] if the request is abandoned.
    pub fn request_async(&self, permissions: Vec<String>) -> Result<PermissionTicket> {
        let (tx, rx) = oneshot::channel();
        let disposition = self.request(permissions, move |response| {
            let _ = tx.send(response);
        })?;
        Ok(PermissionTicket { disposition, rx })
    }

    /// Deliver the environment's answer. Returns `false` for unknown or
    /// already-resolved tokens.
    pub fn on_result(
        &self,
        token: RequestToken,
        permissions: Vec<String>,
        outcomes: Vec<OutcomeCode>,
    ) -> bool {
        let entry = self.lock().take(token);
        let Some(entry) = entry else {
            debug!(token = %token, "ignoring permission result for unknown token");
            return false;
        };
        check_lengths(token, &permissions, &outcomes);
        entry.resolve(PermissionResponse::new(permissions, outcomes));
        true
    }

    /// Drop every pending request without invoking it.
    pub fn abandon_all(&self) -> usize {
        // Callbacks may own resources with their own drop logic; drop them
        // outside the lock.
        let drained = {
            let mut table = self.lock();
            let count = table.len();
            let entries = std::mem::take(&mut table.entries);
            (count, entries)
        };
        let (dropped, entries) = drained;
        drop(entries);
        if dropped > 0 {
            debug!(dropped, "abandoned pending permission requests");
        }
        dropped
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_pending(&self, token: RequestToken) -> bool {
        self.lock().contains(token)
    }

    #[must_use]
    pub fn pending_tokens(&self) -> Vec<RequestToken> {
        self.lock().tokens()
    }

    #[must_use]
    pub fn next_token(&self) -> RequestToken {
        self.lock().next_token()
    }
}

/// Awaitable handle for a request issued with
/// [`SharedCorrelator::request_async`].
#[derive(Debug)]
pub struct PermissionTicket {
    disposition: RequestDisposition,
    rx: oneshot::Receiver<PermissionResponse>,
}

impl PermissionTicket {
    #[must_use]
    pub fn disposition(&self) -> RequestDisposition {
        self.disposition
    }

    #[must_use]
    pub fn token(&self) -> Option<RequestToken> {
        self.disposition.token()
    }

    /// Wait for the response.
    pub async fn wait(self) -> Result<PermissionResponse> {
        let disposition = self.disposition;
        self.rx.await.map_err(|_| match disposition.token() {
            Some(token) => Error::Cancelled(format!("permission request {token} was abandoned")),
            None => Error::Cancelled("permission request was abandoned".to_string()),
        })
    }
}
