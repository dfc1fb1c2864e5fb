//! Cold migration and resize.

use async_trait::async_trait;
use fleet_id::{InstanceId, MigrationId, ReservationId};
use tracing::{debug, error, info, instrument, warn};

use super::{set_vm_state_and_notify, StateReset, Task, TaskContext, TaskPhase};
use crate::dispatch::{DispatchError, FaultKind, PrepResizeArgs};
use crate::error::{ErrorClass, TaskError, TaskResult};
use crate::model::{
    FilterProperties, Flavor, ImageMeta, Instance, Migration, MigrationKind, MigrationStatus,
    RequestSpec, ServerGroup, VmState,
};
use crate::quota::Reservation;
use crate::scheduler::{
    populate_filter_properties, setup_instance_group, PlacementRequest, NOT_ENOUGH_HOSTS,
};

const METHOD: &str = "migrate_server";

#[derive(Debug, Clone)]
pub struct ColdMigrateRequest {
    pub instance: Instance,
    /// Same id as the instance's flavor for a cold migration, another id
    /// for a resize.
    pub flavor: Flavor,
    pub filter_properties: FilterProperties,
    pub reservations: Vec<ReservationId>,
    pub clean_shutdown: bool,
    pub server_group: Option<ServerGroup>,
}

impl ColdMigrateRequest {
    pub fn new(instance: Instance, flavor: Flavor) -> Self {
        Self {
            instance,
            flavor,
            filter_properties: FilterProperties::default(),
            reservations: Vec::new(),
            clean_shutdown: true,
            server_group: None,
        }
    }

    pub fn is_resize(&self) -> bool {
        self.instance.is_resize_to(&self.flavor)
    }
}

/// Where the instance is being moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColdMigrateOutcome {
    pub host: String,
    pub node: Option<String>,
    pub migration_id: MigrationId,
    /// Scheduling attempts used, including rejected hosts.
    pub attempts: u32,
}

pub struct MigrationTask {
    ctx: TaskContext,
    instance: Instance,
    flavor: Flavor,
    image: ImageMeta,
    clean_shutdown: bool,
    placement: PlacementRequest,
    reservation: Reservation,
    migration: Option<Migration>,
    prep_resize_in_flight: bool,
    phase: TaskPhase,
}

impl MigrationTask {
    pub fn new(ctx: TaskContext, request: ColdMigrateRequest) -> Self {
        let ColdMigrateRequest {
            instance,
            flavor,
            filter_properties,
            reservations,
            clean_shutdown,
            server_group,
        } = request;

        let image = ImageMeta::from_system_metadata(
            &instance.system_metadata,
            instance.image_ref.as_deref(),
        );
        let spec = RequestSpec::for_instance(&instance, &flavor, Some(image.clone()))
            .with_group(server_group);
        let placement = PlacementRequest::new(
            spec,
            filter_properties,
            ctx.config.scheduler_max_attempts,
        );
        let reservation = Reservation::new(ctx.quotas.clone(), reservations);

        Self {
            ctx,
            instance,
            flavor,
            image,
            clean_shutdown,
            placement,
            reservation,
            migration: None,
            prep_resize_in_flight: false,
            phase: TaskPhase::Pending,
        }
    }

    pub fn migration(&self) -> Option<&Migration> {
        self.migration.as_ref()
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    pub fn placement(&self) -> &PlacementRequest {
        &self.placement
    }

    /// Whether a `prep_resize` may have reached its destination.
    pub fn prep_resize_in_flight(&self) -> bool {
        self.prep_resize_in_flight
    }

    fn instance_id(&self) -> InstanceId {
        self.instance.id
    }

    async fn ensure_migration(&mut self) -> TaskResult<()> {
        if self.migration.is_some() {
            return Ok(());
        }
        let kind = if self.instance.is_resize_to(&self.flavor) {
            MigrationKind::Resize
        } else {
            MigrationKind::Migration
        };
        let migration = Migration::new(&self.instance, kind, Some(&self.flavor));
        let migration = self.ctx.migrations.create(migration).await?;
        debug!(migration_id = %migration.id, kind = ?kind, "Migration record created");
        self.migration = Some(migration);
        Ok(())
    }

    async fn record_destination(&mut self, host: &str, node: Option<&str>) -> TaskResult<()> {
        if let Some(migration) = self.migration.as_mut() {
            migration.dest_compute = Some(host.to_string());
            migration.dest_node = node.map(str::to_string);
            *migration = self.ctx.migrations.save(migration).await?;
        }
        Ok(())
    }

    /// Releases the reservation and closes the migration record with
    /// `status`. Repeated calls are no-ops.
    pub async fn rollback_as(&mut self, status: MigrationStatus) {
        self.reservation.rollback().await;

        if let Some(migration) = self.migration.as_mut() {
            if migration.is_terminal() {
                return;
            }
            if let Err(e) = migration.transition(status) {
                error!(migration_id = %migration.id, error = %e, "Failed to close migration");
                return;
            }
            match self.ctx.migrations.save(migration).await {
                Ok(saved) => *migration = saved,
                Err(e) => {
                    error!(migration_id = %migration.id, error = %e, "Failed to save migration")
                }
            }
        }
        self.phase = TaskPhase::RolledBack;
    }
}

#[async_trait]
impl Task for MigrationTask {
    type Output = ColdMigrateOutcome;

    fn name(&self) -> &'static str {
        METHOD
    }

    fn phase(&self) -> TaskPhase {
        self.phase
    }

    #[instrument(skip(self), fields(instance_id = %self.instance.id, flavor = self.flavor.id))]
    async fn execute(&mut self) -> TaskResult<ColdMigrateOutcome> {
        self.ensure_migration().await?;
        setup_instance_group(&self.ctx.config, &mut self.placement)?;

        loop {
            self.phase = TaskPhase::Scheduling;
            self.placement.populate_retry(self.instance_id())?;
            let candidates = self.ctx.selector.select(&mut self.placement).await?;
            let candidate = candidates
                .into_iter()
                .next()
                .ok_or_else(|| TaskError::no_valid_host(NOT_ENOUGH_HOSTS))?;

            populate_filter_properties(&mut self.placement.filter_properties, &candidate);
            self.record_destination(&candidate.host, candidate.node.as_deref())
                .await?;

            let args = PrepResizeArgs {
                instance: self.instance.clone(),
                image: Some(self.image.clone()),
                instance_type: self.flavor.clone(),
                reservations: self.reservation.ids().to_vec(),
                request_spec: self.placement.spec.clone(),
                filter_properties: self.placement.filter_properties.clone(),
                node: candidate.node.clone(),
                clean_shutdown: self.clean_shutdown,
            };

            self.phase = TaskPhase::Dispatched;
            self.prep_resize_in_flight = true;
            match self.ctx.compute.prep_resize(&candidate.host, &args).await {
                Ok(()) => {
                    if let Err(e) = self.reservation.commit().await {
                        error!(error = %e, "Failed to commit reservations");
                    }
                    self.phase = TaskPhase::Completed;
                    let migration_id = self
                        .migration
                        .as_ref()
                        .map(|m| m.id)
                        .ok_or_else(|| TaskError::Internal("migration record lost".into()))?;
                    info!(host = %candidate.host, "Resize prepared on destination");
                    return Ok(ColdMigrateOutcome {
                        host: candidate.host,
                        node: candidate.node,
                        migration_id,
                        attempts: self.placement.attempts_made(),
                    });
                }
                Err(DispatchError::Remote { host, fault, .. })
                    if fault.kind == FaultKind::Rejected =>
                {
                    self.prep_resize_in_flight = false;
                    warn!(host = %host, reason = %fault.message, "Destination rejected resize, rescheduling");
                    self.placement.note_failure(fault.message);
                    self.placement.exclude(&host);
                }
                Err(e) => {
                    let err = TaskError::from(e);
                    if !err.is_ambiguous_delivery() {
                        self.prep_resize_in_flight = false;
                    }
                    self.phase = TaskPhase::Failed;
                    return Err(err);
                }
            }
        }
    }

    async fn rollback(&mut self) {
        self.rollback_as(MigrationStatus::Reverted).await;
    }
}

/// Runs a cold migration or resize and handles its failures.
///
/// Expected failures restore the prior state and revert the migration.
/// A transport failure after `prep_resize` was sent leaves everything in
/// flight.
#[instrument(skip_all, fields(instance_id = %request.instance.id))]
pub(crate) async fn run_cold_migrate(
    ctx: TaskContext,
    request: ColdMigrateRequest,
) -> TaskResult<ColdMigrateOutcome> {
    let instance_id = request.instance.id;
    let prior = request.instance.vm_state;
    let is_resize = request.is_resize();

    let mut task = MigrationTask::new(ctx.clone(), request);
    let err = match task.execute().await {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };
    let spec = task.placement.spec.to_value();

    match err.class() {
        ErrorClass::NoValidHost => {
            set_vm_state_and_notify(&ctx, instance_id, METHOD, StateReset::to(prior), &err, spec)
                .await;
            task.rollback_as(MigrationStatus::Reverted).await;
            let reason = if is_resize {
                "No valid host found for resize"
            } else {
                "No valid host found for cold migrate"
            };
            Err(TaskError::no_valid_host(reason))
        }
        ErrorClass::Expected => {
            set_vm_state_and_notify(&ctx, instance_id, METHOD, StateReset::to(prior), &err, spec)
                .await;
            task.rollback_as(MigrationStatus::Reverted).await;
            Err(err)
        }
        ErrorClass::Transport if task.prep_resize_in_flight => {
            warn!(error = %err, "prep_resize may have landed, leaving resize in flight");
            Err(err)
        }
        ErrorClass::Transport => {
            set_vm_state_and_notify(&ctx, instance_id, METHOD, StateReset::to(prior), &err, spec)
                .await;
            task.rollback_as(MigrationStatus::Reverted).await;
            Err(err)
        }
        ErrorClass::Fatal => {
            error!(error = %err, "Cold migration lost a race on the instance record");
            task.rollback_as(MigrationStatus::Error).await;
            Err(err)
        }
        ErrorClass::Unexpected => {
            error!(error = %err, "Unexpected failure during cold migration");
            set_vm_state_and_notify(
                &ctx,
                instance_id,
                METHOD,
                StateReset::to(VmState::Error),
                &err,
                spec,
            )
            .await;
            task.rollback_as(MigrationStatus::Error).await;
            Err(TaskError::Migration {
                reason: err.to_string(),
            })
        }
    }
}
