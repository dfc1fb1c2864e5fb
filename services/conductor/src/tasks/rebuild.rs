//! Rebuild and evacuation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_events::{event_types, Priority, RebuildScheduledPayload};
use fleet_id::MigrationId;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::{set_vm_state_and_notify, StateReset, Task, TaskContext, TaskPhase};
use crate::dispatch::{InjectedFile, RebuildArgs};
use crate::error::{ErrorClass, TaskError, TaskResult};
use crate::model::{
    FilterProperties, ImageMeta, Instance, Limits, MigrationKind, MigrationStatus, RequestSpec,
    ServerGroup, VmState,
};
use crate::scheduler::{setup_instance_group, PlacementRequest, NOT_ENOUGH_HOSTS};

const METHOD: &str = "rebuild_server";

#[derive(Debug, Clone)]
pub struct RebuildRequest {
    pub instance: Instance,
    pub orig_image_ref: Option<String>,
    pub image_ref: Option<String>,
    pub injected_files: Vec<InjectedFile>,
    pub new_pass: Option<String>,
    pub orig_sys_metadata: BTreeMap<String, String>,
    pub bdms: Vec<Value>,
    /// Rebuild on another host (evacuation).
    pub recreate: bool,
    pub on_shared_storage: bool,
    pub preserve_ephemeral: bool,
    /// Target host; scheduled when absent.
    pub host: Option<String>,
    pub server_group: Option<ServerGroup>,
}

impl RebuildRequest {
    pub fn new(instance: Instance, host: Option<String>) -> Self {
        Self {
            orig_image_ref: instance.image_ref.clone(),
            image_ref: instance.image_ref.clone(),
            orig_sys_metadata: instance.system_metadata.clone(),
            instance,
            injected_files: Vec::new(),
            new_pass: None,
            bdms: Vec::new(),
            recreate: false,
            on_shared_storage: false,
            preserve_ephemeral: false,
            host,
            server_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildOutcome {
    pub host: String,
    pub node: Option<String>,
    /// Evacuation record handed to the destination, if one was accepted.
    pub migration_id: Option<MigrationId>,
}

pub struct RebuildTask {
    ctx: TaskContext,
    instance: Instance,
    request: RebuildRequest,
    spec: RequestSpec,
    placement: Option<PlacementRequest>,
    rebuild_in_flight: bool,
    phase: TaskPhase,
}

impl RebuildTask {
    pub fn new(ctx: TaskContext, request: RebuildRequest) -> Self {
        let instance = request.instance.clone();
        let image = ImageMeta::from_system_metadata(
            &instance.system_metadata,
            request.image_ref.as_deref(),
        );
        let spec = RequestSpec::for_instance(&instance, &instance.flavor, Some(image))
            .with_group(request.server_group.clone());

        Self {
            ctx,
            instance,
            request,
            spec,
            placement: None,
            rebuild_in_flight: false,
            phase: TaskPhase::Pending,
        }
    }

    pub fn placement(&self) -> Option<&PlacementRequest> {
        self.placement.as_ref()
    }

    pub fn rebuild_in_flight(&self) -> bool {
        self.rebuild_in_flight
    }

    async fn schedule(&mut self) -> TaskResult<(String, Option<String>, Option<Limits>)> {
        let ignored = self.instance.host.iter().cloned();
        let mut placement = PlacementRequest::new(
            self.spec.clone(),
            FilterProperties::ignoring(ignored),
            self.ctx.config.scheduler_max_attempts,
        );
        let result = async {
            setup_instance_group(&self.ctx.config, &mut placement)?;
            let candidates = self.ctx.selector.select(&mut placement).await?;
            candidates
                .into_iter()
                .next()
                .ok_or_else(|| TaskError::no_valid_host(NOT_ENOUGH_HOSTS))
        }
        .await;
        self.placement = Some(placement);

        let candidate = result?;
        debug!(host = %candidate.host, "Rebuild destination selected");
        Ok((candidate.host, candidate.node, Some(candidate.limits)))
    }
}

#[async_trait]
impl Task for RebuildTask {
    type Output = RebuildOutcome;

    fn name(&self) -> &'static str {
        METHOD
    }

    fn phase(&self) -> TaskPhase {
        self.phase
    }

    #[instrument(skip(self), fields(instance_id = %self.instance.id, recreate = self.request.recreate))]
    async fn execute(&mut self) -> TaskResult<RebuildOutcome> {
        self.phase = TaskPhase::Scheduling;
        let (host, node, limits) = match self.request.host.clone() {
            Some(host) => (host, None, None),
            None => self.schedule().await?,
        };

        let migration = self
            .ctx
            .migrations
            .get_by_instance_and_status(
                self.instance.id,
                MigrationStatus::Accepted,
                Some(MigrationKind::Evacuation),
            )
            .await?;
        if migration.is_none() {
            debug!("No accepted evacuation record");
        }

        self.ctx.emit(
            event_types::INSTANCE_REBUILD_SCHEDULED,
            Priority::Info,
            RebuildScheduledPayload {
                instance_id: self.instance.id,
                host: host.clone(),
                node: node.clone(),
            },
        );

        let migration_id = migration.as_ref().map(|m| m.id);
        let args = RebuildArgs {
            instance: self.instance.clone(),
            orig_image_ref: self.request.orig_image_ref.clone(),
            image_ref: self.request.image_ref.clone(),
            injected_files: self.request.injected_files.clone(),
            new_pass: self.request.new_pass.clone(),
            orig_sys_metadata: self.request.orig_sys_metadata.clone(),
            bdms: self.request.bdms.clone(),
            recreate: self.request.recreate,
            on_shared_storage: self.request.on_shared_storage,
            preserve_ephemeral: self.request.preserve_ephemeral,
            migration,
            node: node.clone(),
            limits,
        };

        self.phase = TaskPhase::Dispatched;
        self.rebuild_in_flight = true;
        self.ctx.compute.rebuild_instance(&host, &args).await?;

        info!(host = %host, "Rebuild dispatched");
        self.phase = TaskPhase::Completed;
        Ok(RebuildOutcome {
            host,
            node,
            migration_id,
        })
    }

    async fn rollback(&mut self) {
        // Nothing is reserved before the cast
        self.phase = TaskPhase::RolledBack;
    }
}

/// Runs a rebuild and handles its failures.
#[instrument(skip_all)]
pub(crate) async fn run_rebuild(
    ctx: TaskContext,
    request: RebuildRequest,
) -> TaskResult<RebuildOutcome> {
    let mut task = RebuildTask::new(ctx.clone(), request);
    let instance_id = task.instance.id;
    let prior = task.instance.vm_state;

    let err = match task.execute().await {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };
    let spec = task.spec.to_value();

    match err.class() {
        ErrorClass::Transport if task.rebuild_in_flight && err.is_ambiguous_delivery() => {
            warn!(instance_id = %instance_id, error = %err, "rebuild_instance may have landed");
            Err(err)
        }
        ErrorClass::NoValidHost | ErrorClass::Expected | ErrorClass::Transport => {
            set_vm_state_and_notify(&ctx, instance_id, METHOD, StateReset::to(prior), &err, spec)
                .await;
            Err(err)
        }
        ErrorClass::Fatal => Err(err),
        ErrorClass::Unexpected => {
            error!(instance_id = %instance_id, error = %err, "Unexpected failure during rebuild");
            set_vm_state_and_notify(
                &ctx,
                instance_id,
                METHOD,
                StateReset::to(VmState::Error),
                &err,
                spec,
            )
            .await;
            Err(TaskError::Migration {
                reason: err.to_string(),
            })
        }
    }
}
