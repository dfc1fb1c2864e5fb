//! Live migration.
//!
//! The conductor picks and checks a destination, then hands the actual
//! migration to the source host. Everything after the `live_migration`
//! cast belongs to the hosts.

use async_trait::async_trait;
use fleet_id::MigrationId;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::{set_vm_state_and_notify, StateReset, Task, TaskContext, TaskPhase};
use crate::dispatch::{LiveMigrationArgs, LiveMigrationCheckArgs};
use crate::error::{ErrorClass, ExpectedError, TaskError, TaskResult};
use crate::model::{
    Candidate, FilterProperties, HostRecord, ImageMeta, Instance, Migration, MigrationKind,
    MigrationStatus, RequestSpec, ServerGroup, TaskState, VmState,
};
use crate::scheduler::{setup_instance_group, PlacementRequest, NOT_ENOUGH_HOSTS};

const METHOD: &str = "migrate_server";

#[derive(Debug, Clone)]
pub struct LiveMigrateRequest {
    pub instance: Instance,
    /// Requested destination; scheduled when absent.
    pub destination: Option<String>,
    pub block_migration: bool,
    pub disk_over_commit: bool,
    /// Record created by the caller, if any.
    pub migration: Option<Migration>,
    pub server_group: Option<ServerGroup>,
}

impl LiveMigrateRequest {
    pub fn new(instance: Instance, destination: Option<String>) -> Self {
        Self {
            instance,
            destination,
            block_migration: false,
            disk_over_commit: false,
            migration: None,
            server_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMigrateOutcome {
    pub source: String,
    pub destination: String,
    pub node: Option<String>,
    pub migration_id: MigrationId,
}

pub struct LiveMigrationTask {
    ctx: TaskContext,
    instance: Instance,
    destination: Option<String>,
    block_migration: bool,
    disk_over_commit: bool,
    spec: RequestSpec,
    migration: Option<Migration>,
    placement: Option<PlacementRequest>,
    outcome: Option<LiveMigrateOutcome>,
    live_migration_in_flight: bool,
    phase: TaskPhase,
}

impl LiveMigrationTask {
    pub fn new(ctx: TaskContext, request: LiveMigrateRequest) -> Self {
        let LiveMigrateRequest {
            instance,
            destination,
            block_migration,
            disk_over_commit,
            migration,
            server_group,
        } = request;

        let image = ImageMeta::from_system_metadata(
            &instance.system_metadata,
            instance.image_ref.as_deref(),
        );
        let spec = RequestSpec::for_instance(&instance, &instance.flavor, Some(image))
            .with_group(server_group);

        Self {
            ctx,
            instance,
            destination,
            block_migration,
            disk_over_commit,
            spec,
            migration,
            placement: None,
            outcome: None,
            live_migration_in_flight: false,
            phase: TaskPhase::Pending,
        }
    }

    /// Request spec built when the task was created.
    pub fn request_spec(&self) -> &RequestSpec {
        &self.spec
    }

    pub fn migration(&self) -> Option<&Migration> {
        self.migration.as_ref()
    }

    /// Placement state of the last destination search.
    pub fn placement(&self) -> Option<&PlacementRequest> {
        self.placement.as_ref()
    }

    /// Whether the `live_migration` cast may have reached the source.
    pub fn live_migration_in_flight(&self) -> bool {
        self.live_migration_in_flight
    }

    async fn ensure_migration(&mut self) -> TaskResult<()> {
        if self.migration.is_some() {
            return Ok(());
        }
        let migration = Migration::new(&self.instance, MigrationKind::LiveMigration, None)
            .with_destination(self.destination.clone(), None);
        self.migration = Some(self.ctx.migrations.create(migration).await?);
        Ok(())
    }

    fn check_instance_is_active(&self) -> TaskResult<()> {
        match self.instance.vm_state {
            VmState::Active | VmState::Paused => Ok(()),
            other => Err(ExpectedError::InstanceInvalidState {
                instance_id: self.instance.id,
                attr: "vm_state",
                state: other.to_string(),
                method: "live_migrate",
            }
            .into()),
        }
    }

    async fn check_host_is_up(&self, host: &str) -> TaskResult<HostRecord> {
        let record = self.ctx.hosts.get_host(host).await?;
        if !record.is_available() {
            return Err(ExpectedError::ComputeServiceUnavailable {
                host: host.to_string(),
            }
            .into());
        }
        Ok(record)
    }

    fn check_destination_has_enough_memory(&self, destination: &HostRecord) -> TaskResult<()> {
        let avail = destination.free_ram_mb();
        let mem = self.instance.flavor.memory_mb;
        if avail <= mem {
            return Err(ExpectedError::MigrationPreCheck {
                reason: format!(
                    "Unable to migrate {} to {}: Lack of memory(host:{} <= instance:{})",
                    self.instance.id, destination.host, avail, mem
                ),
            }
            .into());
        }
        Ok(())
    }

    fn check_compatible_with_source_hypervisor(
        source: &HostRecord,
        destination: &HostRecord,
    ) -> TaskResult<()> {
        if source.hypervisor_type != destination.hypervisor_type {
            return Err(ExpectedError::InvalidHypervisorType {
                host: destination.host.clone(),
                reason: format!(
                    "{} != {}",
                    destination.hypervisor_type, source.hypervisor_type
                ),
            }
            .into());
        }
        if source.hypervisor_version > destination.hypervisor_version {
            return Err(ExpectedError::DestinationHypervisorTooOld {
                host: destination.host.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn call_can_live_migrate_destination(&self, destination: &str) -> TaskResult<Value> {
        let args = LiveMigrationCheckArgs {
            instance: self.instance.clone(),
            block_migration: self.block_migration,
            disk_over_commit: self.disk_over_commit,
        };
        Ok(self
            .ctx
            .compute
            .check_can_live_migrate_destination(destination, &args)
            .await?)
    }

    async fn check_requested_destination(
        &self,
        source: &HostRecord,
        destination: &str,
    ) -> TaskResult<(HostRecord, Value)> {
        if source.host == destination {
            return Err(ExpectedError::UnableToMigrateToSelf {
                instance_id: self.instance.id,
                host: destination.to_string(),
            }
            .into());
        }
        let record = self.check_host_is_up(destination).await?;
        self.check_destination_has_enough_memory(&record)?;
        Self::check_compatible_with_source_hypervisor(source, &record)?;
        let migrate_data = self.call_can_live_migrate_destination(destination).await?;
        Ok((record, migrate_data))
    }

    fn check_not_over_max_retries(&self, placement: &PlacementRequest) -> TaskResult<()> {
        let Some(max_retries) = self.ctx.config.migrate_max_retries else {
            return Ok(());
        };
        // The source is always in the exclusion set
        let retries = placement.excluded().len().saturating_sub(1);
        if retries > max_retries as usize {
            let reason = format!(
                "Exceeded max scheduling retries {} for instance {} during live migration",
                max_retries, self.instance.id
            );
            warn!(instance_id = %self.instance.id, retries, "{}", reason);
            return Err(TaskError::no_valid_host(reason));
        }
        Ok(())
    }

    async fn check_candidate(
        &self,
        source: &HostRecord,
        candidate: &Candidate,
    ) -> TaskResult<Value> {
        let record = self.ctx.hosts.get_host(&candidate.host).await?;
        Self::check_compatible_with_source_hypervisor(source, &record)?;
        self.call_can_live_migrate_destination(&candidate.host).await
    }

    async fn find_destination(&mut self, source: &HostRecord) -> TaskResult<(Candidate, Value)> {
        let mut placement = PlacementRequest::new(
            self.spec.clone(),
            FilterProperties::ignoring([source.host.clone()]),
            self.ctx.config.scheduler_max_attempts,
        );
        setup_instance_group(&self.ctx.config, &mut placement)?;

        let result = loop {
            if let Err(e) = self.check_not_over_max_retries(&placement) {
                break Err(e);
            }
            let candidate = match self.ctx.selector.select(&mut placement).await {
                Ok(candidates) => match candidates.into_iter().next() {
                    Some(candidate) => candidate,
                    None => break Err(TaskError::no_valid_host(NOT_ENOUGH_HOSTS)),
                },
                Err(e) => break Err(e),
            };

            match self.check_candidate(source, &candidate).await {
                Ok(migrate_data) => break Ok((candidate, migrate_data)),
                Err(TaskError::Expected(e)) if e.retries_on_next_host() => {
                    warn!(host = %candidate.host, error = %e, "Destination check failed, trying next host");
                    placement.note_failure(e.to_string());
                    placement.exclude(&candidate.host);
                }
                Err(e) => break Err(e),
            }
        };
        self.placement = Some(placement);
        result
    }

    async fn record_destination(&mut self, host: &str, node: Option<String>) -> TaskResult<()> {
        if let Some(migration) = self.migration.as_mut() {
            migration.dest_compute = Some(host.to_string());
            migration.dest_node = node;
            *migration = self.ctx.migrations.save(migration).await?;
        }
        Ok(())
    }

    /// Closes the migration record with `status` unless already closed.
    pub async fn close_migration(&mut self, status: MigrationStatus) {
        let Some(migration) = self.migration.as_mut() else {
            return;
        };
        if migration.is_terminal() {
            return;
        }
        if let Err(e) = migration.transition(status) {
            error!(migration_id = %migration.id, error = %e, "Failed to close migration");
            return;
        }
        match self.ctx.migrations.save(migration).await {
            Ok(saved) => *migration = saved,
            Err(e) => error!(migration_id = %migration.id, error = %e, "Failed to save migration"),
        }
    }
}

#[async_trait]
impl Task for LiveMigrationTask {
    type Output = LiveMigrateOutcome;

    fn name(&self) -> &'static str {
        METHOD
    }

    fn phase(&self) -> TaskPhase {
        self.phase
    }

    #[instrument(skip(self), fields(instance_id = %self.instance.id))]
    async fn execute(&mut self) -> TaskResult<LiveMigrateOutcome> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }

        self.ensure_migration().await?;
        self.check_instance_is_active()?;

        let source_host = self
            .instance
            .host
            .clone()
            .ok_or_else(|| TaskError::Internal(format!("instance {} has no host", self.instance.id)))?;
        let source = self.check_host_is_up(&source_host).await?;

        self.phase = TaskPhase::Scheduling;
        let (destination, node, migrate_data) = match self.destination.clone() {
            Some(destination) => {
                let (record, data) = self.check_requested_destination(&source, &destination).await?;
                (destination, Some(record.node), data)
            }
            None => {
                let (candidate, data) = self.find_destination(&source).await?;
                (candidate.host, candidate.node, data)
            }
        };
        debug!(destination = %destination, "Live migration destination chosen");

        self.record_destination(&destination, node.clone()).await?;

        let args = LiveMigrationArgs {
            instance: self.instance.clone(),
            dest: destination.clone(),
            block_migration: self.block_migration,
            migrate_data,
            migration: self.migration.clone(),
        };
        self.phase = TaskPhase::Dispatched;
        self.live_migration_in_flight = true;
        self.ctx.compute.live_migration(&source_host, &args).await?;

        let migration_id = self
            .migration
            .as_ref()
            .map(|m| m.id)
            .ok_or_else(|| TaskError::Internal("migration record lost".into()))?;
        let outcome = LiveMigrateOutcome {
            source: source_host,
            destination,
            node,
            migration_id,
        };
        info!(source = %outcome.source, destination = %outcome.destination, "Live migration started");
        self.phase = TaskPhase::Completed;
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    async fn rollback(&mut self) {
        self.close_migration(MigrationStatus::Error).await;
        self.phase = TaskPhase::RolledBack;
    }
}

/// Runs a live migration and handles its failures.
#[instrument(skip_all, fields(instance_id = %request.instance.id))]
pub(crate) async fn run_live_migrate(
    ctx: TaskContext,
    request: LiveMigrateRequest,
) -> TaskResult<LiveMigrateOutcome> {
    let instance_id = request.instance.id;
    let prior = request.instance.vm_state;
    let task_state = request.instance.task_state;

    let mut task = LiveMigrationTask::new(ctx.clone(), request);
    let err = match task.execute().await {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };
    let spec = task.request_spec().to_value();

    match err.class() {
        ErrorClass::Transport if task.live_migration_in_flight && err.is_ambiguous_delivery() => {
            warn!(error = %err, "live_migration may have landed, leaving migration in flight");
            Err(err)
        }
        ErrorClass::Expected | ErrorClass::NoValidHost | ErrorClass::Transport => {
            let reset = StateReset::to(prior).expecting(TaskState::Migrating);
            set_vm_state_and_notify(&ctx, instance_id, METHOD, reset, &err, spec).await;
            task.close_migration(MigrationStatus::Error).await;
            Err(err)
        }
        ErrorClass::Fatal => {
            error!(error = %err, "Live migration lost a race on the instance record");
            task.close_migration(MigrationStatus::Error).await;
            Err(err)
        }
        ErrorClass::Unexpected => {
            error!(error = %err, "Unexpected failure during live migration");
            let reset = StateReset::to(VmState::Error)
                .keeping_task_state(task_state)
                .expecting(TaskState::Migrating);
            set_vm_state_and_notify(&ctx, instance_id, METHOD, reset, &err, spec).await;
            task.close_migration(MigrationStatus::Failed).await;
            Err(TaskError::Migration {
                reason: err.to_string(),
            })
        }
    }
}
