//! Conductor workflows.
//!
//! Each workflow is a small state machine over the placement selector and
//! the compute API. A task's `execute` does the forward work; the
//! workflow's `run` function classifies whatever `execute` returned and
//! decides on state restoration, notification and rollback.

mod build;
mod live_migrate;
mod migrate;
mod rebuild;
mod unshelve;

#[cfg(test)]
pub(crate) mod fixtures;

pub use build::{BuildReport, BuildRequest, BuildTask};
pub use live_migrate::{LiveMigrateOutcome, LiveMigrateRequest, LiveMigrationTask};
pub use migrate::{ColdMigrateOutcome, ColdMigrateRequest, MigrationTask};
pub use rebuild::{RebuildOutcome, RebuildRequest, RebuildTask};
pub use unshelve::{
    UnshelveOutcome, UnshelveRequest, UnshelveTask, SHELVED_AT, SHELVED_HOST, SHELVED_IMAGE_ID,
};

pub(crate) use live_migrate::run_live_migrate;
pub(crate) use migrate::run_cold_migrate;
pub(crate) use rebuild::run_rebuild;
pub(crate) use unshelve::run_unshelve;

use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::{failure_event_type, Priority, StateResetPayload};
use fleet_id::{InstanceId, RequestId};
use serde::Serialize;
use tracing::warn;

use crate::config::ConductorConfig;
use crate::dispatch::{ComputeApi, Dispatcher};
use crate::error::{TaskError, TaskResult};
use crate::image::ImageService;
use crate::model::{ExpectedTaskState, Instance, InstanceUpdate, TaskState, VmState};
use crate::notifier::{emit, Notifier};
use crate::quota::QuotaEngine;
use crate::registry::{HostRegistry, InstanceStore, MigrationStore};
use crate::scheduler::{PlacementSelector, SchedulerClient};

/// External collaborators a conductor is wired with.
pub struct Collaborators {
    pub instances: Arc<dyn InstanceStore>,
    pub migrations: Arc<dyn MigrationStore>,
    pub hosts: Arc<dyn HostRegistry>,
    pub images: Arc<dyn ImageService>,
    pub quotas: Arc<dyn QuotaEngine>,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub notifier: Arc<dyn Notifier>,
}

/// Everything a workflow invocation needs.
#[derive(Clone)]
pub struct TaskContext {
    pub config: Arc<ConductorConfig>,
    pub instances: Arc<dyn InstanceStore>,
    pub migrations: Arc<dyn MigrationStore>,
    pub hosts: Arc<dyn HostRegistry>,
    pub images: Arc<dyn ImageService>,
    pub quotas: Arc<dyn QuotaEngine>,
    pub selector: PlacementSelector,
    pub compute: ComputeApi,
    pub notifier: Arc<dyn Notifier>,
    /// Correlates the notifications of one invocation.
    pub request_id: RequestId,
}

impl TaskContext {
    pub fn new(config: ConductorConfig, collaborators: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            instances: collaborators.instances,
            migrations: collaborators.migrations,
            hosts: collaborators.hosts,
            images: collaborators.images,
            quotas: collaborators.quotas,
            selector: PlacementSelector::new(collaborators.scheduler),
            compute: ComputeApi::new(collaborators.dispatcher),
            notifier: collaborators.notifier,
            request_id: RequestId::new(),
        }
    }

    /// Same collaborators, fresh request id.
    pub fn for_request(&self) -> Self {
        Self {
            request_id: RequestId::new(),
            ..self.clone()
        }
    }

    pub(crate) fn emit<P: Serialize>(&self, event_type: &str, priority: Priority, payload: P) {
        emit(
            self.notifier.as_ref(),
            &self.config.publisher_id,
            self.request_id,
            event_type,
            priority,
            payload,
        );
    }

    pub(crate) async fn save_instance(
        &self,
        id: InstanceId,
        update: InstanceUpdate,
        expected: ExpectedTaskState,
    ) -> TaskResult<Instance> {
        Ok(self.instances.save(id, &update, expected).await?)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// Where a task is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Pending,
    Scheduling,
    Dispatched,
    Completed,
    Failed,
    RolledBack,
}

/// A conductor workflow step.
#[async_trait]
pub trait Task: Send {
    type Output: Send;

    fn name(&self) -> &'static str;

    fn phase(&self) -> TaskPhase;

    async fn execute(&mut self) -> TaskResult<Self::Output>;

    /// Compensates whatever `execute` left behind. Safe to call repeatedly.
    async fn rollback(&mut self);
}

/// Instance state written back when a workflow fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReset {
    pub vm_state: VmState,
    pub task_state: Option<TaskState>,
    /// Guard for the save, also reported in the notification.
    pub expected_task_state: Option<TaskState>,
}

impl StateReset {
    /// `vm_state` with the task state cleared.
    pub fn to(vm_state: VmState) -> Self {
        Self {
            vm_state,
            task_state: None,
            expected_task_state: None,
        }
    }

    pub fn keeping_task_state(mut self, task_state: Option<TaskState>) -> Self {
        self.task_state = task_state;
        self
    }

    pub fn expecting(mut self, task_state: TaskState) -> Self {
        self.expected_task_state = Some(task_state);
        self
    }
}

/// Writes `reset` to the instance and emits the workflow failure event.
///
/// A save failure is logged; the notification goes out regardless.
pub(crate) async fn set_vm_state_and_notify(
    ctx: &TaskContext,
    instance_id: InstanceId,
    method: &str,
    reset: StateReset,
    error: &TaskError,
    request_spec: serde_json::Value,
) {
    warn!(
        instance_id = %instance_id,
        method = method,
        error = %error,
        "Setting instance to {} state",
        reset.vm_state
    );

    let update = InstanceUpdate::new()
        .vm_state(reset.vm_state)
        .task_state(reset.task_state);
    let expected = match reset.expected_task_state {
        Some(task_state) => ExpectedTaskState::Is(Some(task_state)),
        None => ExpectedTaskState::Any,
    };
    if let Err(e) = ctx.instances.save(instance_id, &update, expected).await {
        warn!(instance_id = %instance_id, error = %e, "Failed to reset instance state");
    }

    ctx.emit(
        &failure_event_type(method),
        Priority::Error,
        StateResetPayload {
            instance_id,
            method: method.to_string(),
            state: reset.vm_state.to_string(),
            task_state: reset.task_state.map(|s| s.to_string()),
            expected_task_state: reset.expected_task_state.map(|s| s.to_string()),
            reason: error.to_string(),
            request_spec,
        },
    );
}
