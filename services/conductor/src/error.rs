//! Workflow error taxonomy.
//!
//! Every failure a workflow can observe is a [`TaskError`], and every
//! `TaskError` falls into exactly one [`ErrorClass`]. Workflows decide
//! rollback, state restoration and re-raising from the class alone.

use fleet_id::InstanceId;
use thiserror::Error;

use crate::dispatch::{DispatchError, FaultKind, RemoteFault, TransportError};
use crate::image::ImageError;
use crate::model::TransitionError;
use crate::quota::QuotaError;
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;

pub type TaskResult<T> = Result<T, TaskError>;

/// Failures the operator or user can act on. State is reverted and the
/// original error is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpectedError {
    #[error("Instance {instance_id} could not be found.")]
    InstanceNotFound { instance_id: InstanceId },

    #[error("Instance {instance_id} in {attr} {state}. Cannot {method} while the instance is in this state.")]
    InstanceInvalidState {
        instance_id: InstanceId,
        attr: &'static str,
        state: String,
        method: &'static str,
    },

    /// The destination refused the request during preparation.
    #[error("Host {host} rejected the request: {reason}")]
    HostRejected { host: String, reason: String },

    #[error("The instance requires a newer hypervisor version than {host} provides.")]
    DestinationHypervisorTooOld { host: String },

    #[error("Connection to the hypervisor on {host} is broken.")]
    HypervisorUnavailable { host: String },

    #[error("Live migration to {host} with an old compute agent is not safe.")]
    LiveMigrationWithOldAgentNotSafe { host: String },

    #[error("Migration pre-check error: {reason}")]
    MigrationPreCheck { reason: String },

    #[error("{host} is not on shared storage: {reason}")]
    InvalidSharedStorage { host: String, reason: String },

    #[error("{host} is not on local storage: {reason}")]
    InvalidLocalStorage { host: String, reason: String },

    #[error("Unacceptable CPU info: {reason}")]
    InvalidCpuInfo { reason: String },

    #[error("Hypervisor type of {host} does not match the source: {reason}")]
    InvalidHypervisorType { host: String, reason: String },

    #[error("Unable to migrate instance ({instance_id}) to current host ({host}).")]
    UnableToMigrateToSelf { instance_id: InstanceId, host: String },

    #[error("Compute service of {host} is unavailable at this time.")]
    ComputeServiceUnavailable { host: String },

    #[error("Unsupported server group policy: {reason}")]
    UnsupportedPolicy { reason: String },

    #[error("Image {image_id} could not be found.")]
    ImageNotFound { image_id: String },
}

impl ExpectedError {
    /// Destination-check failures that move a live migration on to the
    /// next candidate.
    pub fn retries_on_next_host(&self) -> bool {
        matches!(
            self,
            ExpectedError::InvalidHypervisorType { .. }
                | ExpectedError::InvalidCpuInfo { .. }
                | ExpectedError::MigrationPreCheck { .. }
                | ExpectedError::HypervisorUnavailable { .. }
        )
    }
}

/// Every failure a workflow can observe.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No host satisfies the request.
    #[error("No valid host was found. {reason}")]
    NoValidHost { reason: String },

    #[error(transparent)]
    Expected(#[from] ExpectedError),

    /// The message bus or the scheduler could not be reached, or the remote
    /// side did not answer in time.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Lost an optimistic-locking race on the instance record.
    #[error("instance {instance_id} changed underneath the workflow: {reason}")]
    Conflict {
        instance_id: InstanceId,
        reason: String,
    },

    /// Wrapper for unexpected live and cold migration failures.
    #[error("Migration error: {reason}")]
    Migration { reason: String },

    #[error("Unshelve attempted but the image {image_id} cannot be found.")]
    UnshelveFailed {
        instance_id: InstanceId,
        image_id: String,
    },

    #[error("{0} is not implemented")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// How a workflow must react to a [`TaskError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NoValidHost,
    Expected,
    Transport,
    /// Never retried, state untouched.
    Fatal,
    /// A bug: instance goes to error.
    Unexpected,
}

impl TaskError {
    pub fn no_valid_host(reason: impl Into<String>) -> Self {
        TaskError::NoValidHost {
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TaskError::NoValidHost { .. } => ErrorClass::NoValidHost,
            TaskError::Expected(_) => ErrorClass::Expected,
            TaskError::Transport(_) => ErrorClass::Transport,
            TaskError::Conflict { .. } => ErrorClass::Fatal,
            TaskError::Migration { .. } => ErrorClass::Unexpected,
            TaskError::UnshelveFailed { .. } => ErrorClass::Expected,
            TaskError::NotImplemented(_) => ErrorClass::Expected,
            TaskError::Internal(_) => ErrorClass::Unexpected,
        }
    }

    /// Scheduling failures that end a placement attempt without a bug:
    /// no host, or a group policy the deployment cannot enforce.
    pub fn is_placement_failure(&self) -> bool {
        matches!(
            self,
            TaskError::NoValidHost { .. }
                | TaskError::Expected(ExpectedError::UnsupportedPolicy { .. })
        )
    }

    pub fn is_no_valid_host(&self) -> bool {
        matches!(self, TaskError::NoValidHost { .. })
    }

    /// A transport failure that may have left a dispatched operation running.
    pub fn is_ambiguous_delivery(&self) -> bool {
        matches!(self, TaskError::Transport(e) if e.may_have_delivered())
    }

    /// Maps a fault raised by a compute host onto the taxonomy.
    pub fn from_remote(host: &str, fault: RemoteFault) -> Self {
        let host = host.to_string();
        let reason = fault.message;
        let expected = match fault.kind {
            FaultKind::Rejected => ExpectedError::HostRejected { host, reason },
            FaultKind::HypervisorTooOld => ExpectedError::DestinationHypervisorTooOld { host },
            FaultKind::HypervisorUnavailable => ExpectedError::HypervisorUnavailable { host },
            FaultKind::OldAgentNotSafe => ExpectedError::LiveMigrationWithOldAgentNotSafe { host },
            FaultKind::PreCheckFailed => ExpectedError::MigrationPreCheck { reason },
            FaultKind::InvalidSharedStorage => ExpectedError::InvalidSharedStorage { host, reason },
            FaultKind::InvalidLocalStorage => ExpectedError::InvalidLocalStorage { host, reason },
            FaultKind::InvalidCpuInfo => ExpectedError::InvalidCpuInfo { reason },
            FaultKind::InvalidHypervisorType => {
                ExpectedError::InvalidHypervisorType { host, reason }
            }
            FaultKind::Unsupported | FaultKind::Internal => {
                return TaskError::Internal(format!("{host}: {reason}"));
            }
        };
        TaskError::Expected(expected)
    }
}

impl From<RegistryError> for TaskError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InstanceNotFound(instance_id) => {
                ExpectedError::InstanceNotFound { instance_id }.into()
            }
            RegistryError::HostNotFound(host) => {
                ExpectedError::ComputeServiceUnavailable { host }.into()
            }
            RegistryError::Conflict {
                instance_id,
                expected,
                actual,
            } => TaskError::Conflict {
                instance_id,
                reason: format!("expected task_state {expected}, found {actual}"),
            },
            other @ (RegistryError::MigrationNotFound(_) | RegistryError::Backend(_)) => {
                TaskError::Internal(other.to_string())
            }
        }
    }
}

impl From<SchedulerError> for TaskError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NoValidHost { reason } => TaskError::NoValidHost { reason },
            SchedulerError::Transport(e) => TaskError::Transport(e),
            SchedulerError::Internal(reason) => TaskError::Internal(reason),
        }
    }
}

impl From<DispatchError> for TaskError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Transport(e) => TaskError::Transport(e),
            DispatchError::Remote { host, fault, .. } => TaskError::from_remote(&host, fault),
            e @ DispatchError::Encode { .. } => TaskError::Internal(e.to_string()),
        }
    }
}

impl From<ImageError> for TaskError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::NotFound(image_id) => ExpectedError::ImageNotFound { image_id }.into(),
            e @ ImageError::Backend(_) => TaskError::Internal(e.to_string()),
        }
    }
}

impl From<QuotaError> for TaskError {
    fn from(err: QuotaError) -> Self {
        TaskError::Internal(err.to_string())
    }
}

impl From<TransitionError> for TaskError {
    fn from(err: TransitionError) -> Self {
        TaskError::Internal(err.to_string())
    }
}
