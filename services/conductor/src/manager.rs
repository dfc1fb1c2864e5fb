//! Compute task manager: the conductor's public operations.
//!
//! Every operation runs with a fresh request id and is bracketed by
//! `conductor.<action>.start` and `.end`/`.error` notifications.

use std::future::Future;

use fleet_id::{InstanceId, ReservationId};
use tracing::{info, instrument};

use crate::error::{TaskError, TaskResult};
use crate::model::{FilterProperties, Flavor, Instance, Migration, ServerGroup};
use crate::notifier::ActionReporter;
use crate::tasks::{
    run_cold_migrate, run_live_migrate, run_rebuild, run_unshelve, BuildReport, BuildRequest,
    BuildTask, ColdMigrateOutcome, ColdMigrateRequest, LiveMigrateOutcome, LiveMigrateRequest,
    RebuildOutcome, RebuildRequest, Task, TaskContext, UnshelveOutcome, UnshelveRequest,
};

/// Arguments of `migrate_server`. Which workflow runs depends on `live`,
/// `rebuild` and whether a flavor is given.
#[derive(Debug, Clone)]
pub struct MigrateServerRequest {
    pub instance: Instance,
    pub live: bool,
    pub rebuild: bool,
    pub flavor: Option<Flavor>,
    /// Live migration only.
    pub destination: Option<String>,
    pub block_migration: bool,
    pub disk_over_commit: bool,
    pub migration: Option<Migration>,
    /// Cold migration only.
    pub reservations: Vec<ReservationId>,
    pub clean_shutdown: bool,
    pub filter_properties: FilterProperties,
    pub server_group: Option<ServerGroup>,
}

impl MigrateServerRequest {
    /// Live migration to `destination`, scheduled when `None`.
    pub fn live(instance: Instance, destination: Option<String>) -> Self {
        Self {
            live: true,
            destination,
            ..Self::base(instance)
        }
    }

    /// Cold migration (same flavor) or resize (other flavor).
    pub fn cold(instance: Instance, flavor: Flavor) -> Self {
        Self {
            flavor: Some(flavor),
            ..Self::base(instance)
        }
    }

    fn base(instance: Instance) -> Self {
        Self {
            instance,
            live: false,
            rebuild: false,
            flavor: None,
            destination: None,
            block_migration: false,
            disk_over_commit: false,
            migration: None,
            reservations: Vec::new(),
            clean_shutdown: true,
            filter_properties: FilterProperties::default(),
            server_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateOutcome {
    Live(LiveMigrateOutcome),
    Cold(ColdMigrateOutcome),
}

/// Entry point for compute task requests.
#[derive(Debug, Clone)]
pub struct ComputeTaskManager {
    ctx: TaskContext,
}

impl ComputeTaskManager {
    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    async fn reported<T, F, Fut>(
        &self,
        action: &'static str,
        instance_ids: Vec<InstanceId>,
        work: F,
    ) -> TaskResult<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = TaskResult<T>>,
    {
        let ctx = self.ctx.for_request();
        let reporter = ActionReporter::start(
            ctx.notifier.as_ref(),
            &ctx.config.publisher_id,
            ctx.request_id,
            action,
            instance_ids,
        );
        let result = work(ctx.clone()).await;
        reporter.finish(&result);
        result
    }

    /// Places and dispatches a batch. Scheduling failures are reported in
    /// the returned report, not raised.
    #[instrument(skip_all, fields(instances = request.instances.len()))]
    pub async fn build_instances(&self, request: BuildRequest) -> TaskResult<BuildReport> {
        let ids = request.instances.iter().map(|i| i.id).collect();
        self.reported("build_instances", ids, |ctx| async move {
            BuildTask::new(ctx, request).execute().await
        })
        .await
    }

    #[instrument(skip_all, fields(instance_id = %request.instance.id, live = request.live, rebuild = request.rebuild))]
    pub async fn migrate_server(&self, request: MigrateServerRequest) -> TaskResult<MigrateOutcome> {
        let ids = vec![request.instance.id];
        self.reported("migrate_server", ids, |ctx| async move {
            match (request.live, request.rebuild, request.flavor.clone()) {
                (true, false, None) => {
                    let live = LiveMigrateRequest {
                        instance: request.instance,
                        destination: request.destination,
                        block_migration: request.block_migration,
                        disk_over_commit: request.disk_over_commit,
                        migration: request.migration,
                        server_group: request.server_group,
                    };
                    run_live_migrate(ctx, live).await.map(MigrateOutcome::Live)
                }
                (false, false, Some(flavor)) => {
                    let cold = ColdMigrateRequest {
                        instance: request.instance,
                        flavor,
                        filter_properties: request.filter_properties,
                        reservations: request.reservations,
                        clean_shutdown: request.clean_shutdown,
                        server_group: request.server_group,
                    };
                    run_cold_migrate(ctx, cold).await.map(MigrateOutcome::Cold)
                }
                (live, rebuild, flavor) => {
                    info!(live, rebuild, flavor = flavor.is_some(), "Unsupported migrate_server combination");
                    Err(TaskError::NotImplemented(format!(
                        "migrate_server with live={live}, rebuild={rebuild}, flavor={}",
                        flavor.is_some()
                    )))
                }
            }
        })
        .await
    }

    #[instrument(skip_all, fields(instance_id = %request.instance.id))]
    pub async fn live_migrate_instance(
        &self,
        request: LiveMigrateRequest,
    ) -> TaskResult<LiveMigrateOutcome> {
        let ids = vec![request.instance.id];
        self.reported("live_migrate_instance", ids, |ctx| run_live_migrate(ctx, request))
            .await
    }

    #[instrument(skip_all, fields(instance_id = %request.instance.id))]
    pub async fn rebuild_instance(&self, request: RebuildRequest) -> TaskResult<RebuildOutcome> {
        let ids = vec![request.instance.id];
        self.reported("rebuild_instance", ids, |ctx| run_rebuild(ctx, request))
            .await
    }

    #[instrument(skip_all, fields(instance_id = %request.instance.id))]
    pub async fn unshelve_instance(
        &self,
        request: UnshelveRequest,
    ) -> TaskResult<UnshelveOutcome> {
        let ids = vec![request.instance.id];
        self.reported("unshelve_instance", ids, |ctx| run_unshelve(ctx, request))
            .await
    }
}
