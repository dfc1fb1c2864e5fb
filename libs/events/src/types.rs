//! Event types and payloads emitted by conductor workflows.

use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// Event type names.
pub mod event_types {
    // Workflow failures, one per conductor method
    pub const BUILD_INSTANCES: &str = "compute_task.build_instances";
    pub const MIGRATE_SERVER: &str = "compute_task.migrate_server";
    pub const REBUILD_SERVER: &str = "compute_task.rebuild_server";
    pub const UNSHELVE_INSTANCE: &str = "compute_task.unshelve_instance";

    // Instance lifecycle
    pub const INSTANCE_REBUILD_SCHEDULED: &str = "compute.instance.rebuild.scheduled";

    /// Service prefix for workflow failure events.
    pub const COMPUTE_TASK_SERVICE: &str = "compute_task";

    /// Service prefix for operation lifecycle events.
    pub const CONDUCTOR_SERVICE: &str = "conductor";
}

/// Builds the workflow failure event type for a conductor method.
pub fn failure_event_type(method: &str) -> String {
    format!("{}.{}", event_types::COMPUTE_TASK_SERVICE, method)
}

// =============================================================================
// Operation Lifecycle
// =============================================================================

/// Phase of a conductor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Start,
    End,
    Error,
}

impl ActionPhase {
    /// Event type for an action in this phase, e.g. `conductor.unshelve_instance.end`.
    pub fn event_type(&self, action: &str) -> String {
        format!("{}.{}.{}", event_types::CONDUCTOR_SERVICE, action, self)
    }
}

impl std::fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionPhase::Start => write!(f, "start"),
            ActionPhase::End => write!(f, "end"),
            ActionPhase::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Emitted at each phase of a conductor operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEventPayload {
    pub action: String,
    pub instance_ids: Vec<InstanceId>,
    pub phase: ActionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Emitted when a workflow fails and resets the instance state.
///
/// `state`/`task_state` are the values written back to the instance,
/// `expected_task_state` is the in-flight marker the workflow owned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResetPayload {
    pub instance_id: InstanceId,
    pub method: String,
    pub state: String,
    pub task_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_task_state: Option<String>,
    pub reason: String,
    pub request_spec: serde_json::Value,
}

/// Emitted once a rebuild has a destination and is about to be dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildScheduledPayload {
    pub instance_id: InstanceId,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}
