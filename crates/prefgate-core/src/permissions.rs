//! Permission subsystem boundary.
//!
//! The host environment owns the actual grant state and the prompt UI. The
//! core only needs two things from it: a synchronous "is this already
//! granted" check and a fire-and-forget way to ask the user. The answer comes
//! back later on an unrelated entry point and is routed by
//! [`RequestToken`] through the correlator.

use serde::{Deserialize, Serialize};

/// Correlation token linking a dispatched prompt to its eventual response.
///
/// Assigned from a per-host counter starting at zero; never reused while the
/// host is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(pub u64);

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-permission answer reported by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCode {
    Granted,
    Denied,
}

impl OutcomeCode {
    /// Raw code used by platforms that report integers (0 means granted).
    pub const RAW_GRANTED: i32 = 0;
    /// Raw code for a denial.
    pub const RAW_DENIED: i32 = -1;

    /// Map a raw platform code; anything other than granted is a denial.
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        if code == Self::RAW_GRANTED {
            Self::Granted
        } else {
            Self::Denied
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Granted => Self::RAW_GRANTED,
            Self::Denied => Self::RAW_DENIED,
        }
    }

    #[must_use]
    pub const fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }
}

/// What a callback receives: the permissions the environment reported on and
/// one outcome per permission, positionally.
///
/// The vectors are forwarded exactly as delivered. A partial grant is not
/// special at this layer; interpretation belongs to the callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub permissions: Vec<String>,
    pub outcomes: Vec<OutcomeCode>,
}

impl PermissionResponse {
    #[must_use]
    pub fn new(permissions: Vec<String>, outcomes: Vec<OutcomeCode>) -> Self {
        Self {
            permissions,
            outcomes,
        }
    }

    /// Response used on the fast path: every requested permission granted.
    #[must_use]
    pub fn all_granted_for(permissions: Vec<String>) -> Self {
        let outcomes = vec![OutcomeCode::Granted; permissions.len()];
        Self {
            permissions,
            outcomes,
        }
    }

    /// True when every reported outcome is a grant and the vectors line up.
    #[must_use]
    pub fn all_granted(&self) -> bool {
        self.permissions.len() == self.outcomes.len()
            && self.outcomes.iter().all(|o| o.is_granted())
    }

    /// Outcome for a named permission, if it was reported.
    #[must_use]
    pub fn outcome(&self, permission: &str) -> Option<OutcomeCode> {
        self.permissions
            .iter()
            .position(|p| p == permission)
            .and_then(|idx| self.outcomes.get(idx).copied())
    }

    #[must_use]
    pub fn is_granted(&self, permission: &str) -> bool {
        self.outcome(permission).is_some_and(OutcomeCode::is_granted)
    }

    /// Permissions whose outcome is a denial.
    #[must_use]
    pub fn denied(&self) -> Vec<&str> {
        self.permissions
            .iter()
            .zip(&self.outcomes)
            .filter(|(_, o)| !o.is_granted())
            .map(|(p, _)| p.as_str())
            .collect()
    }
}

/// The environment's permission machinery.
pub trait PermissionSubsystem: Send + Sync {
    /// Whether `permission` is currently granted. Must not block.
    fn check_granted(&self, permission: &str) -> bool;

    /// Ask the user for `permissions`. Fire-and-forget: the answer arrives
    /// later through the correlator's `on_result` with the same `token`.
    fn dispatch_request(&self, permissions: &[String], token: RequestToken);
}

impl<T: PermissionSubsystem + ?Sized> PermissionSubsystem for std::sync::Arc<T> {
    fn check_granted(&self, permission: &str) -> bool {
        (**self).check_granted(permission)
    }

    fn dispatch_request(&self, permissions: &[String], token: RequestToken) {
        (**self).dispatch_request(permissions, token);
    }
}

/// Split `permissions` into the ones that still need a prompt, keeping order.
pub(crate) fn needed_permissions<P>(subsystem: &P, permissions: &[String]) -> Vec<String>
where
    P: PermissionSubsystem + ?Sized,
{
    permissions
        .iter()
        .filter(|p| !subsystem.check_granted(p))
        .cloned()
        .collect()
}
