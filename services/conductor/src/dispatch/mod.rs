//! Dispatch of operations to compute hosts.
//!
//! - [`Dispatcher`]: `cast` and `call` to a host's agent
//! - [`RpcDispatcher`]: version negotiation and payload backports over a
//!   [`Transport`]
//! - [`LocalTransport`]: in-process transport routing to registered agents
//! - [`MockDispatcher`]: records dispatches for tests
//! - [`ComputeApi`]: typed arguments for each operation

mod compute;
mod local;
mod mock;
mod operations;
mod rpc;

pub use compute::{
    BuildAndRunArgs, BuildExtras, ComputeApi, InjectedFile, LiveMigrationArgs,
    LiveMigrationCheckArgs, PrepResizeArgs, RebuildArgs, StartArgs, UnshelveArgs,
};
pub use local::{HandlerRegistry, LocalTransport};
pub use mock::{DispatchRecord, MockDispatcher};
pub use operations::{ComputeOperation, DispatchMode};
pub use rpc::{compute_topic, RpcDispatcher, RpcMessage, Transport};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compat::Version;

/// The message bus could not deliver, or the reply never came.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("timed out after {after:?} waiting for {target}")]
    Timeout { target: String, after: Duration },

    #[error("{0} is unreachable")]
    Unreachable(String),

    #[error("connection failed: {0}")]
    Connection(String),

    /// The host's version cap is below what the operation needs.
    #[error("{host} is capped at {cap}, {operation} needs at least {minimum}")]
    Incompatible {
        host: String,
        operation: ComputeOperation,
        cap: Version,
        minimum: Version,
    },
}

impl TransportError {
    /// Whether the message may have reached the remote side.
    pub fn may_have_delivered(&self) -> bool {
        !matches!(self, TransportError::Incompatible { .. })
    }
}

/// Application-level failure classes a compute host can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The host refused to take the instance.
    Rejected,
    HypervisorTooOld,
    HypervisorUnavailable,
    OldAgentNotSafe,
    PreCheckFailed,
    InvalidSharedStorage,
    InvalidLocalStorage,
    InvalidCpuInfo,
    InvalidHypervisorType,
    /// The agent has no handler for the operation.
    Unsupported,
    Internal,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// A fault raised by the remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Dispatch errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{operation} on {host} failed: {fault}")]
    Remote {
        host: String,
        operation: ComputeOperation,
        fault: RemoteFault,
    },

    #[error("failed to encode {operation} arguments: {reason}")]
    Encode {
        operation: ComputeOperation,
        reason: String,
    },
}

impl DispatchError {
    pub fn timeout(host: &str, operation: ComputeOperation, after: Duration) -> Self {
        DispatchError::Transport(TransportError::Timeout {
            target: format!("{operation} on {host}"),
            after,
        })
    }

    pub fn remote(host: &str, operation: ComputeOperation, fault: RemoteFault) -> Self {
        DispatchError::Remote {
            host: host.to_string(),
            operation,
            fault,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Transport(TransportError::Timeout { .. }))
    }

    /// The remote fault, if the host answered with one.
    pub fn fault(&self) -> Option<&RemoteFault> {
        match self {
            DispatchError::Remote { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Sends operations to compute hosts.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Fire-and-forget. Returns once the transport accepted the message.
    async fn cast(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: Value,
    ) -> Result<(), DispatchError>;

    /// Request/response, bounded by the configured call timeout.
    async fn call(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: Value,
    ) -> Result<Value, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = RemoteFault::new(FaultKind::InvalidCpuInfo, "flags differ");
        assert_eq!(fault.to_string(), "invalid_cpu_info: flags differ");
    }

    #[test]
    fn test_timeout_is_transport() {
        let err = DispatchError::timeout("host-b", ComputeOperation::PrepResize, Duration::from_secs(5));
        assert!(err.is_timeout());
        assert!(err.fault().is_none());
        assert!(err.to_string().contains("prep_resize on host-b"));
    }
}
