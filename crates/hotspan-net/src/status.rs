//! Observable hotspot status.

use thiserror::Error;

/// Why the controller landed in [`RunningStatus::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// A required permission for hosting a group is missing.
    #[error("permission to host a wireless group is missing")]
    PermissionRequired,

    /// The platform refused or failed to create the group.
    #[error("group creation failed: {0}")]
    GroupCreation(String),

    /// The proxy listener could not be bound on the group address.
    #[error("could not bind proxy listener: {0}")]
    Bind(String),

    /// The running proxy reported an unrecoverable failure.
    #[error("proxy failed: {0}")]
    Proxy(String),
}

/// Lifecycle state of the hotspot, owned by the controller and observed by
/// everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunningStatus {
    /// Nothing is hosted and nothing is in flight.
    #[default]
    NotRunning,
    /// Group creation has been requested.
    Starting,
    /// The group is up and the proxy is serving it.
    Running,
    /// Teardown is in progress.
    Stopping,
    /// A start attempt or the running server failed; not auto-retried.
    Error(FailureReason),
}

impl RunningStatus {
    /// True once the proxy is serving clients.
    pub fn is_running(&self) -> bool {
        matches!(self, RunningStatus::Running)
    }

    /// True while a start or stop transition is in flight.
    pub fn in_transition(&self) -> bool {
        matches!(self, RunningStatus::Starting | RunningStatus::Stopping)
    }

    /// True if the last transition failed.
    pub fn is_error(&self) -> bool {
        matches!(self, RunningStatus::Error(_))
    }
}

impl std::fmt::Display for RunningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunningStatus::NotRunning => write!(f, "not running"),
            RunningStatus::Starting => write!(f, "starting"),
            RunningStatus::Running => write!(f, "running"),
            RunningStatus::Stopping => write!(f, "stopping"),
            RunningStatus::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}
