//! Unshelve: power a shelved instance back on, or place an offloaded one
//! on a new host.

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::{Task, TaskContext, TaskPhase};
use crate::dispatch::{StartArgs, UnshelveArgs};
use crate::error::{ExpectedError, TaskError, TaskResult};
use crate::image::ImageError;
use crate::model::{
    Candidate, ExpectedTaskState, FilterProperties, ImageMeta, Instance, InstanceUpdate, RequestSpec,
    ServerGroup, TaskState, VmState,
};
use crate::scheduler::{
    populate_filter_properties, setup_instance_group, PlacementRequest, NOT_ENOUGH_HOSTS,
};

const METHOD: &str = "unshelve_instance";

/// System metadata recorded when the instance was shelved.
pub const SHELVED_AT: &str = "shelved_at";
pub const SHELVED_IMAGE_ID: &str = "shelved_image_id";
pub const SHELVED_HOST: &str = "shelved_host";

#[derive(Debug, Clone)]
pub struct UnshelveRequest {
    pub instance: Instance,
    pub filter_properties: FilterProperties,
    pub server_group: Option<ServerGroup>,
}

impl UnshelveRequest {
    pub fn new(instance: Instance) -> Self {
        Self {
            instance,
            filter_properties: FilterProperties::default(),
            server_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnshelveOutcome {
    /// Shelved in place; the host was asked to start it.
    Started { host: String },
    /// Offloaded; handed to a newly selected host.
    Unshelved { host: String, node: Option<String> },
    /// Offloaded and nothing can take it. The instance stays offloaded.
    NoValidHost { reason: String },
}

pub struct UnshelveTask {
    ctx: TaskContext,
    request: UnshelveRequest,
    placement: Option<PlacementRequest>,
    phase: TaskPhase,
}

impl UnshelveTask {
    pub fn new(ctx: TaskContext, request: UnshelveRequest) -> Self {
        Self {
            ctx,
            request,
            placement: None,
            phase: TaskPhase::Pending,
        }
    }

    pub fn placement(&self) -> Option<&PlacementRequest> {
        self.placement.as_ref()
    }

    fn instance(&self) -> &Instance {
        &self.request.instance
    }

    async fn clear_task_state(&self) {
        let update = InstanceUpdate::new().task_state(None);
        if let Err(e) = self
            .ctx
            .save_instance(self.instance().id, update, ExpectedTaskState::Any)
            .await
        {
            error!(instance_id = %self.instance().id, error = %e, "Failed to clear task state");
        }
    }

    async fn start_shelved(&self) -> TaskResult<UnshelveOutcome> {
        let id = self.instance().id;
        let Some(host) = self.instance().host.clone() else {
            self.clear_task_state().await;
            return Err(TaskError::Internal(format!("shelved instance {id} has no host")));
        };

        let instance = self
            .ctx
            .save_instance(
                id,
                InstanceUpdate::new().task_state(Some(TaskState::PoweringOn)),
                ExpectedTaskState::Is(Some(TaskState::Unshelving)),
            )
            .await?;
        self.ctx
            .compute
            .start_instance(&host, &StartArgs { instance })
            .await?;

        Ok(UnshelveOutcome::Started { host })
    }

    async fn shelved_image(&self) -> TaskResult<Option<ImageMeta>> {
        let instance = self.instance();
        let Some(image_id) = instance
            .system_metadata
            .get(SHELVED_IMAGE_ID)
            .filter(|id| !id.is_empty())
        else {
            debug!(instance_id = %instance.id, "No shelved image, volume backed");
            return Ok(None);
        };

        match self.ctx.images.get(image_id).await {
            Ok(image) => Ok(Some(image)),
            Err(ImageError::NotFound(_)) => {
                error!(instance_id = %instance.id, image_id = %image_id, "Unshelve attempted but the image cannot be found");
                let update = InstanceUpdate::new().vm_state(VmState::Error).task_state(None);
                self.ctx
                    .save_instance(instance.id, update, ExpectedTaskState::Any)
                    .await?;
                Err(TaskError::UnshelveFailed {
                    instance_id: instance.id,
                    image_id: image_id.clone(),
                })
            }
            Err(e) => {
                error!(instance_id = %instance.id, image_id = %image_id, error = %e, "Unshelve attempted but the image lookup failed");
                self.clear_task_state().await;
                Err(e.into())
            }
        }
    }

    async fn schedule(
        &mut self,
        image: Option<ImageMeta>,
    ) -> TaskResult<(Candidate, PlacementRequest)> {
        let instance = self.instance();
        let spec = RequestSpec::for_instance(instance, &instance.flavor, image)
            .with_group(self.request.server_group.clone());
        let mut placement = PlacementRequest::new(
            spec,
            self.request.filter_properties.clone(),
            self.ctx.config.scheduler_max_attempts,
        );

        let result = async {
            placement.populate_retry(instance.id)?;
            setup_instance_group(&self.ctx.config, &mut placement)?;
            let candidates = self.ctx.selector.select(&mut placement).await?;
            candidates
                .into_iter()
                .next()
                .ok_or_else(|| TaskError::no_valid_host(NOT_ENOUGH_HOSTS))
        }
        .await;
        self.placement = Some(placement.clone());
        result.map(|candidate| (candidate, placement))
    }

    async fn unshelve_offloaded(&mut self) -> TaskResult<UnshelveOutcome> {
        let image = self.shelved_image().await?;

        self.phase = TaskPhase::Scheduling;
        let (candidate, mut placement) = match self.schedule(image.clone()).await {
            Ok(selected) => selected,
            Err(e) if e.is_placement_failure() => {
                self.clear_task_state().await;
                warn!(instance_id = %self.instance().id, error = %e, "No valid host found for unshelve instance");
                return Ok(UnshelveOutcome::NoValidHost {
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                self.clear_task_state().await;
                error!(instance_id = %self.instance().id, error = %e, "Unshelve attempted but an error has occurred");
                return Err(e);
            }
        };

        populate_filter_properties(&mut placement.filter_properties, &candidate);
        let args = UnshelveArgs {
            instance: self.instance().clone(),
            image,
            filter_properties: placement.filter_properties,
            node: candidate.node.clone(),
        };
        self.phase = TaskPhase::Dispatched;
        self.ctx
            .compute
            .unshelve_instance(&candidate.host, &args)
            .await?;

        Ok(UnshelveOutcome::Unshelved {
            host: candidate.host,
            node: candidate.node,
        })
    }

    /// Drops the shelve bookkeeping once the instance is on its way back.
    async fn remove_shelve_metadata(&self) -> TaskResult<()> {
        let current = self.ctx.instances.get(self.instance().id).await?;
        let mut system_metadata = current.system_metadata;
        for key in [SHELVED_AT, SHELVED_IMAGE_ID, SHELVED_HOST] {
            system_metadata.remove(key);
        }
        self.ctx
            .save_instance(
                current.id,
                InstanceUpdate::new().system_metadata(system_metadata),
                ExpectedTaskState::Any,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Task for UnshelveTask {
    type Output = UnshelveOutcome;

    fn name(&self) -> &'static str {
        METHOD
    }

    fn phase(&self) -> TaskPhase {
        self.phase
    }

    #[instrument(skip(self), fields(instance_id = %self.request.instance.id, vm_state = %self.request.instance.vm_state))]
    async fn execute(&mut self) -> TaskResult<UnshelveOutcome> {
        let outcome = match self.instance().vm_state {
            VmState::Shelved => self.start_shelved().await?,
            VmState::ShelvedOffloaded => self.unshelve_offloaded().await?,
            other => {
                let id = self.instance().id;
                error!(instance_id = %id, vm_state = %other, "Unshelve attempted but vm_state not shelved or shelved_offloaded");
                self.ctx
                    .save_instance(
                        id,
                        InstanceUpdate::new().vm_state(VmState::Error),
                        ExpectedTaskState::Any,
                    )
                    .await?;
                self.phase = TaskPhase::Failed;
                return Err(ExpectedError::InstanceInvalidState {
                    instance_id: id,
                    attr: "vm_state",
                    state: other.to_string(),
                    method: "unshelve",
                }
                .into());
            }
        };

        if matches!(outcome, UnshelveOutcome::NoValidHost { .. }) {
            self.phase = TaskPhase::Failed;
            return Ok(outcome);
        }

        self.remove_shelve_metadata().await?;
        self.phase = TaskPhase::Completed;
        info!(outcome = ?outcome, "Unshelve dispatched");
        Ok(outcome)
    }

    async fn rollback(&mut self) {
        self.phase = TaskPhase::RolledBack;
    }
}

/// Runs an unshelve. Failures are handled inside the task.
#[instrument(skip_all, fields(instance_id = %request.instance.id))]
pub(crate) async fn run_unshelve(
    ctx: TaskContext,
    request: UnshelveRequest,
) -> TaskResult<UnshelveOutcome> {
    UnshelveTask::new(ctx, request).execute().await
}
