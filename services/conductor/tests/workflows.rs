//! End-to-end workflow scenarios driven through the manager.

mod harness;

use fleet_conductor::{
    dispatch::{ComputeOperation, DispatchError, FaultKind, PrepResizeArgs, RemoteFault},
    model::{MigrationKind, MigrationStatus, TaskState, VmState},
    quota::ReservationState,
    registry::InstanceStore,
    scheduler::{MockScheduler, SchedulerError},
    tasks::{
        BuildRequest, LiveMigrateRequest, RebuildRequest, UnshelveOutcome, UnshelveRequest,
        SHELVED_IMAGE_ID,
    },
    ExpectedError, MigrateOutcome, MigrateServerRequest, TaskError,
};
use fleet_events::event_types;
use harness::{flavor, instance_on, unplaced, Conductor};

// =============================================================================
// Cold migration and resize
// =============================================================================

#[tokio::test]
async fn cold_migration_prepares_resize_on_selected_host() {
    let conductor = Conductor::new(&[("host-b", "n1")]);
    let w1 = conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::ResizePrep)))
        .await;
    let reservations = conductor.quotas.reserve(2);

    let mut request = MigrateServerRequest::cold(w1.clone(), w1.flavor.clone());
    request.reservations = reservations.clone();
    let outcome = conductor.manager().migrate_server(request).await.unwrap();

    let MigrateOutcome::Cold(outcome) = outcome else {
        panic!("expected a cold migration");
    };
    assert_eq!(outcome.host, "host-b");
    assert_eq!(outcome.node.as_deref(), Some("n1"));

    let calls = conductor.dispatcher.records_for(ComputeOperation::PrepResize);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].host, "host-b");
    let args: PrepResizeArgs = calls[0].decode().unwrap();
    assert_eq!(args.instance_type, w1.flavor);
    assert_eq!(args.reservations, reservations);
    assert_eq!(args.node.as_deref(), Some("n1"));
    assert!(args.clean_shutdown);
    assert_eq!(args.image.unwrap().disk_format.as_deref(), Some("qcow2"));

    let migrations = conductor.migrations.for_instance(w1.id);
    assert_eq!(migrations.len(), 1);
    let migration = &migrations[0];
    assert_eq!(migration.id, outcome.migration_id);
    assert_eq!(migration.status, MigrationStatus::PreMigrating);
    assert_eq!(migration.kind, MigrationKind::Migration);
    assert_eq!(migration.source_compute.as_deref(), Some("host-a"));
    assert_eq!(migration.dest_compute.as_deref(), Some("host-b"));

    for r in reservations {
        assert_eq!(conductor.quotas.state_of(r), Some(ReservationState::Committed));
    }
}

#[tokio::test]
async fn resize_without_valid_host_restores_state() {
    let conductor = Conductor::with_scheduler(
        MockScheduler::new().then(Err(SchedulerError::NoValidHost {
            reason: "no capacity".to_string(),
        })),
        ["host-a"],
    );
    let w1 = conductor
        .add(instance_on("host-a", VmState::Stopped, Some(TaskState::ResizePrep)))
        .await;
    let reservations = conductor.quotas.reserve(1);

    let mut request = MigrateServerRequest::cold(w1.clone(), flavor(2, 1024));
    request.reservations = reservations.clone();
    let err = conductor.manager().migrate_server(request).await.unwrap_err();

    assert!(err.is_no_valid_host());
    assert!(err.to_string().contains("resize"));

    let current = conductor.current(w1.id);
    assert_eq!(current.vm_state, VmState::Stopped);
    assert_eq!(current.task_state, None);

    let migrations = conductor.migrations.for_instance(w1.id);
    assert_eq!(migrations[0].kind, MigrationKind::Resize);
    assert_eq!(migrations[0].status, MigrationStatus::Reverted);
    assert_eq!(
        conductor.quotas.state_of(reservations[0]),
        Some(ReservationState::RolledBack)
    );

    let failures = conductor.notifier.of_type(event_types::MIGRATE_SERVER);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].payload["state"], "stopped");
    assert!(failures[0].payload["reason"]
        .as_str()
        .unwrap()
        .contains("no capacity"));
    assert_eq!(
        conductor.notifier.event_types().last().map(String::as_str),
        Some("conductor.migrate_server.error")
    );
}

// =============================================================================
// Live migration
// =============================================================================

#[tokio::test]
async fn live_migration_cpu_mismatch_reports_original_request_spec() {
    let conductor = Conductor::new(&[("host-a", "host-a"), ("host-b", "host-b")]);
    conductor.dispatcher.fail_next(
        "host-b",
        ComputeOperation::CheckCanLiveMigrateDestination,
        DispatchError::remote(
            "host-b",
            ComputeOperation::CheckCanLiveMigrateDestination,
            RemoteFault::new(FaultKind::InvalidCpuInfo, "cpu flags differ"),
        ),
    );
    let w1 = conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::Migrating)))
        .await;

    let err = conductor
        .manager()
        .migrate_server(MigrateServerRequest::live(w1.clone(), Some("host-b".to_string())))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TaskError::Expected(ExpectedError::InvalidCpuInfo { .. })
    ));

    let failures = conductor.notifier.of_type(event_types::MIGRATE_SERVER);
    assert_eq!(failures.len(), 1);
    let payload = &failures[0].payload;
    assert_eq!(payload["state"], "active");
    assert_eq!(payload["task_state"], serde_json::Value::Null);
    assert_eq!(payload["expected_task_state"], "migrating");
    assert_eq!(
        payload["request_spec"]["instance_properties"]["uuid"],
        w1.id.to_string()
    );
    assert_eq!(payload["request_spec"]["instance_type"]["id"], 1);

    let current = conductor.current(w1.id);
    assert_eq!(current.vm_state, VmState::Active);
    assert_eq!(current.task_state, None);
    assert_eq!(
        conductor.migrations.for_instance(w1.id)[0].status,
        MigrationStatus::Error
    );
    assert_eq!(conductor.dispatcher.count(ComputeOperation::LiveMigration), 0);
}

#[tokio::test]
async fn live_migration_scheduled_skips_failing_destinations() {
    let conductor = Conductor::new(&[("host-a", "host-a"), ("host-b", "host-b"), ("host-c", "host-c")]);
    conductor.dispatcher.fail_next(
        "host-b",
        ComputeOperation::CheckCanLiveMigrateDestination,
        DispatchError::remote(
            "host-b",
            ComputeOperation::CheckCanLiveMigrateDestination,
            RemoteFault::new(FaultKind::HypervisorUnavailable, "libvirt down"),
        ),
    );
    let w1 = conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::Migrating)))
        .await;

    let outcome = conductor
        .manager()
        .live_migrate_instance(LiveMigrateRequest::new(w1.clone(), None))
        .await
        .unwrap();

    assert_eq!(outcome.destination, "host-c");
    let cast = &conductor.dispatcher.records_for(ComputeOperation::LiveMigration)[0];
    assert_eq!(cast.host, "host-a");
    assert_eq!(cast.args["dest"], "host-c");

    let migration = &conductor.migrations.for_instance(w1.id)[0];
    assert_eq!(migration.kind, MigrationKind::LiveMigration);
    assert_eq!(migration.dest_compute.as_deref(), Some("host-c"));
}

// =============================================================================
// Build
// =============================================================================

#[tokio::test]
async fn build_casts_once_per_surviving_instance() {
    let conductor = Conductor::new(&[("h1", "h1"), ("h2", "h2"), ("h3", "h3"), ("h4", "h4")]);
    let mut instances = Vec::new();
    for instance in unplaced(4) {
        instances.push(conductor.add(instance).await);
    }
    conductor.instances.delete(instances[2].id).await.unwrap();

    let report = conductor
        .manager()
        .build_instances(BuildRequest::new(instances.clone()))
        .await
        .unwrap();

    assert_eq!(
        conductor.dispatcher.count(ComputeOperation::BuildAndRunInstance),
        3
    );
    assert_eq!(report.dispatched.len(), 3);
    assert_eq!(report.skipped, vec![instances[2].id]);
}

#[tokio::test]
async fn build_scheduling_failure_is_not_raised() {
    let conductor = Conductor::with_scheduler(MockScheduler::new(), []);
    let mut instances = Vec::new();
    for instance in unplaced(3) {
        instances.push(conductor.add(instance).await);
    }

    let report = conductor
        .manager()
        .build_instances(BuildRequest::new(instances.clone()))
        .await
        .unwrap();

    assert!(report.scheduling_error.is_some());
    for instance in &instances {
        assert_eq!(conductor.current(instance.id).vm_state, VmState::Error);
    }
    assert_eq!(conductor.notifier.of_type(event_types::BUILD_INSTANCES).len(), 3);
    assert_eq!(
        conductor.notifier.event_types().last().map(String::as_str),
        Some("conductor.build_instances.end")
    );
}

// =============================================================================
// Unshelve and rebuild
// =============================================================================

#[tokio::test]
async fn unshelve_with_missing_image_fails() {
    let conductor = Conductor::new(&[("host-b", "host-b")]);
    let mut w1 = instance_on("host-a", VmState::ShelvedOffloaded, Some(TaskState::Unshelving));
    w1.system_metadata
        .insert(SHELVED_IMAGE_ID.to_string(), "image_not_found".to_string());
    let w1 = conductor.add(w1).await;

    let err = conductor
        .manager()
        .unshelve_instance(UnshelveRequest::new(w1.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::UnshelveFailed { .. }));
    assert_eq!(
        err.to_string(),
        "Unshelve attempted but the image image_not_found cannot be found."
    );
    assert_eq!(conductor.current(w1.id).vm_state, VmState::Error);
    assert_eq!(conductor.dispatcher.records().len(), 0);
}

#[tokio::test]
async fn unshelve_without_host_is_recoverable() {
    let conductor = Conductor::with_scheduler(MockScheduler::new(), []);
    let w1 = conductor
        .add(instance_on("host-a", VmState::ShelvedOffloaded, Some(TaskState::Unshelving)))
        .await;

    let outcome = conductor
        .manager()
        .unshelve_instance(UnshelveRequest::new(w1.clone()))
        .await
        .unwrap();

    assert!(matches!(outcome, UnshelveOutcome::NoValidHost { .. }));
    let current = conductor.current(w1.id);
    assert_eq!(current.vm_state, VmState::ShelvedOffloaded);
    assert_eq!(current.task_state, None);
}

#[tokio::test]
async fn evacuation_without_valid_host_restores_state() {
    let conductor = Conductor::with_scheduler(MockScheduler::new(), ["host-a"]);
    let w1 = conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::Rebuilding)))
        .await;

    let mut request = RebuildRequest::new(w1.clone(), None);
    request.recreate = true;
    let err = conductor.manager().rebuild_instance(request).await.unwrap_err();

    assert!(err.is_no_valid_host());
    let current = conductor.current(w1.id);
    assert_eq!(current.vm_state, VmState::Active);
    assert_eq!(current.task_state, None);
    let failures = conductor.notifier.of_type(event_types::REBUILD_SERVER);
    assert_eq!(failures.len(), 1);
    assert_eq!(
        conductor.scheduler.calls()[0].filter_properties.ignore_hosts,
        vec!["host-a".to_string()]
    );
}
