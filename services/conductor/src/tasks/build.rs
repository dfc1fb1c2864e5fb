//! Initial placement of a batch of instances.
//!
//! One selection for the whole batch, then one independent dispatch per
//! instance. Scheduling failures put every instance in error and are not
//! raised: the caller already returned.

use async_trait::async_trait;
use fleet_id::InstanceId;
use futures_util::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use super::{set_vm_state_and_notify, StateReset, Task, TaskContext, TaskPhase};
use crate::dispatch::{BuildAndRunArgs, BuildExtras};
use crate::error::{TaskError, TaskResult};
use crate::model::{
    Candidate, FilterProperties, ImageMeta, Instance, RequestSpec, ServerGroup, VmState,
};
use crate::registry::RegistryError;
use crate::scheduler::{populate_filter_properties, setup_instance_group, PlacementRequest};

const METHOD: &str = "build_instances";

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub instances: Vec<Instance>,
    pub image: Option<ImageMeta>,
    pub filter_properties: FilterProperties,
    pub extras: BuildExtras,
    pub server_group: Option<ServerGroup>,
}

impl BuildRequest {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self {
            instances,
            image: None,
            filter_properties: FilterProperties::default(),
            extras: BuildExtras::default(),
            server_group: None,
        }
    }
}

/// What happened to each instance of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Instances handed to their host, with the host.
    pub dispatched: Vec<(InstanceId, String)>,
    /// Instances deleted before dispatch.
    pub skipped: Vec<InstanceId>,
    /// Instances whose cast may or may not have landed.
    pub in_flight: Vec<InstanceId>,
    /// Instances that could not be reloaded and were put in error.
    pub failed: Vec<InstanceId>,
    /// Set when nothing was dispatched because placement failed.
    pub scheduling_error: Option<String>,
}

enum Dispatch {
    Sent(InstanceId, String),
    Skipped(InstanceId),
    InFlight(InstanceId),
    Failed(InstanceId),
}

pub struct BuildTask {
    ctx: TaskContext,
    request: BuildRequest,
    phase: TaskPhase,
}

impl BuildTask {
    pub fn new(ctx: TaskContext, request: BuildRequest) -> Self {
        Self {
            ctx,
            request,
            phase: TaskPhase::Pending,
        }
    }

    async fn schedule(&self, placement: &mut PlacementRequest) -> TaskResult<Vec<Candidate>> {
        let first = self.request.instances[0].id;
        placement.populate_retry(first)?;
        setup_instance_group(&self.ctx.config, placement)?;
        self.ctx.selector.select(placement).await
    }

    async fn dispatch_one(
        &self,
        instance: &Instance,
        candidate: &Candidate,
        placement: &PlacementRequest,
    ) -> Dispatch {
        let instance = match self.ctx.instances.get(instance.id).await {
            Ok(fresh) => fresh,
            Err(RegistryError::InstanceNotFound(id)) => {
                debug!(instance_id = %id, "Instance deleted during build");
                return Dispatch::Skipped(id);
            }
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "Failed to refresh instance before build");
                let err = TaskError::from(e);
                set_vm_state_and_notify(
                    &self.ctx,
                    instance.id,
                    METHOD,
                    StateReset::to(VmState::Error),
                    &err,
                    placement.spec.to_value(),
                )
                .await;
                return Dispatch::Failed(instance.id);
            }
        };

        // Each instance gets its own copy so retry hosts never leak across the batch
        let mut filter_properties = placement.filter_properties.clone();
        populate_filter_properties(&mut filter_properties, candidate);

        let args = BuildAndRunArgs {
            instance,
            image: self.request.image.clone(),
            request_spec: placement.spec.clone(),
            filter_properties,
            extras: self.request.extras.clone(),
            node: candidate.node.clone(),
            limits: candidate.limits.clone(),
        };
        let instance_id = args.instance.id;

        match self
            .ctx
            .compute
            .build_and_run_instance(&candidate.host, &args)
            .await
        {
            Ok(()) => Dispatch::Sent(instance_id, candidate.host.clone()),
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    host = %candidate.host,
                    error = %e,
                    "Build dispatch failed, leaving instance to reconciliation"
                );
                Dispatch::InFlight(instance_id)
            }
        }
    }
}

#[async_trait]
impl Task for BuildTask {
    type Output = BuildReport;

    fn name(&self) -> &'static str {
        METHOD
    }

    fn phase(&self) -> TaskPhase {
        self.phase
    }

    #[instrument(skip(self), fields(instances = self.request.instances.len()))]
    async fn execute(&mut self) -> TaskResult<BuildReport> {
        let mut report = BuildReport::default();
        let Some(spec) = RequestSpec::for_batch(&self.request.instances, self.request.image.clone())
        else {
            return Ok(report);
        };
        let spec = spec.with_group(self.request.server_group.clone());

        let mut placement = PlacementRequest::new(
            spec,
            self.request.filter_properties.clone(),
            self.ctx.config.scheduler_max_attempts,
        );

        self.phase = TaskPhase::Scheduling;
        let candidates = match self.schedule(&mut placement).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Failed to schedule instances");
                let spec = placement.spec.to_value();
                for instance in &self.request.instances {
                    set_vm_state_and_notify(
                        &self.ctx,
                        instance.id,
                        METHOD,
                        StateReset::to(VmState::Error),
                        &e,
                        spec.clone(),
                    )
                    .await;
                }
                self.phase = TaskPhase::Failed;
                report.scheduling_error = Some(e.to_string());
                return Ok(report);
            }
        };

        self.phase = TaskPhase::Dispatched;
        let dispatches = self
            .request
            .instances
            .iter()
            .zip(candidates.iter())
            .map(|(instance, candidate)| self.dispatch_one(instance, candidate, &placement));
        for outcome in join_all(dispatches).await {
            match outcome {
                Dispatch::Sent(id, host) => report.dispatched.push((id, host)),
                Dispatch::Skipped(id) => report.skipped.push(id),
                Dispatch::InFlight(id) => report.in_flight.push(id),
                Dispatch::Failed(id) => report.failed.push(id),
            }
        }

        self.phase = TaskPhase::Completed;
        info!(
            dispatched = report.dispatched.len(),
            skipped = report.skipped.len(),
            in_flight = report.in_flight.len(),
            failed = report.failed.len(),
            "Build dispatched"
        );
        Ok(report)
    }

    async fn rollback(&mut self) {
        // Dispatched builds are owned by their hosts
    }
}
