//! Workflows dispatched over the versioned RPC layer and the in-process
//! transport.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use fleet_conductor::{
    compat::Version,
    dispatch::{
        ComputeOperation, FaultKind, HandlerRegistry, LocalTransport, RemoteFault, RpcDispatcher,
        RpcMessage, TransportError,
    },
    model::{MigrationStatus, TaskState, VmState},
    quota::ReservationState,
    tasks::{LiveMigrateRequest, RebuildRequest},
    ComputeTaskManager, MigrateServerRequest, TaskError,
};
use harness::{flavor, instance_on, Conductor};
use serde_json::Value;
use tokio::sync::mpsc;

struct Rpc {
    conductor: Conductor,
    transport: Arc<LocalTransport>,
    dispatcher: Arc<RpcDispatcher>,
}

impl Rpc {
    fn new(candidates: &[(&str, &str)]) -> Self {
        let conductor = Conductor::new(candidates);
        let transport = Arc::new(LocalTransport::new());
        let dispatcher = Arc::new(RpcDispatcher::new(transport.clone(), &conductor.config));
        Self {
            conductor,
            transport,
            dispatcher,
        }
    }

    fn manager(&self) -> ComputeTaskManager {
        ComputeTaskManager::new(self.conductor.context_with(self.dispatcher.clone()))
    }
}

/// Agent that forwards every message it receives for `operation`.
fn forwarding(operation: ComputeOperation) -> (HandlerRegistry, mpsc::UnboundedReceiver<RpcMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = HandlerRegistry::new().register(operation, move |message: RpcMessage| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok(Value::Null)
        }
    });
    (registry, rx)
}

#[tokio::test]
async fn live_migration_skips_host_whose_precheck_faults() {
    let rpc = Rpc::new(&[("host-a", "host-a"), ("host-b", "host-b"), ("host-c", "host-c")]);
    let (source_agent, mut casts) = forwarding(ComputeOperation::LiveMigration);
    rpc.transport.register_agent("host-a", source_agent);
    rpc.transport.register_agent(
        "host-b",
        HandlerRegistry::new().register(
            ComputeOperation::CheckCanLiveMigrateDestination,
            |_message: RpcMessage| async {
                Err(RemoteFault::new(FaultKind::PreCheckFailed, "shared storage mismatch"))
            },
        ),
    );
    rpc.transport
        .register_agent("host-c", HandlerRegistry::acknowledging("host-c"));

    let w1 = rpc
        .conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::Migrating)))
        .await;
    let outcome = rpc
        .manager()
        .live_migrate_instance(LiveMigrateRequest::new(w1.clone(), None))
        .await
        .unwrap();
    assert_eq!(outcome.destination, "host-c");

    let message = tokio::time::timeout(Duration::from_secs(1), casts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "compute.host-a");
    assert_eq!(message.version, Version::new(4, 2));
    assert_eq!(message.args["dest"], "host-c");
    assert_eq!(message.args["migration"]["id"], outcome.migration_id.to_string());
}

#[tokio::test]
async fn live_migration_to_old_host_drops_migration_record() {
    let rpc = Rpc::new(&[("host-a", "host-a"), ("host-b", "host-b")]);
    let (source_agent, mut casts) = forwarding(ComputeOperation::LiveMigration);
    rpc.transport.register_agent("host-a", source_agent);
    rpc.transport
        .register_agent("host-b", HandlerRegistry::acknowledging("host-b"));
    rpc.dispatcher.pin_host_version("host-a", Version::new(4, 0));

    let w1 = rpc
        .conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::Migrating)))
        .await;
    rpc.manager()
        .migrate_server(MigrateServerRequest::live(w1, Some("host-b".to_string())))
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), casts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.version, Version::new(4, 0));
    assert!(message.args.get("migration").is_none());
}

#[tokio::test]
async fn host_capped_below_minimum_rolls_back_resize() {
    let rpc = Rpc::new(&[("host-b", "host-b")]);
    rpc.transport
        .register_agent("host-b", HandlerRegistry::acknowledging("host-b"));
    rpc.dispatcher.pin_host_version("host-b", Version::new(3, 9));

    let w1 = rpc
        .conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::ResizePrep)))
        .await;
    let reservations = rpc.conductor.quotas.reserve(1);
    let mut request = MigrateServerRequest::cold(w1.clone(), flavor(2, 1024));
    request.reservations = reservations.clone();

    let err = rpc.manager().migrate_server(request).await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Transport(TransportError::Incompatible { .. })
    ));
    assert_eq!(
        rpc.conductor.migrations.for_instance(w1.id)[0].status,
        MigrationStatus::Reverted
    );
    assert_eq!(
        rpc.conductor.quotas.state_of(reservations[0]),
        Some(ReservationState::RolledBack)
    );
    let current = rpc.conductor.current(w1.id);
    assert_eq!(current.vm_state, VmState::Active);
    assert_eq!(current.task_state, None);
}

#[tokio::test]
async fn unreachable_rebuild_target_is_left_in_flight() {
    let rpc = Rpc::new(&[]);
    let w1 = rpc
        .conductor
        .add(instance_on("host-a", VmState::Active, Some(TaskState::Rebuilding)))
        .await;

    let err = rpc
        .manager()
        .rebuild_instance(RebuildRequest::new(w1.clone(), Some("host-c".to_string())))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TaskError::Transport(TransportError::Unreachable(ref topic)) if topic == "compute.host-c"
    ));
    let current = rpc.conductor.current(w1.id);
    assert_eq!(current.task_state, Some(TaskState::Rebuilding));
    assert!(rpc
        .conductor
        .notifier
        .of_type(fleet_events::event_types::REBUILD_SERVER)
        .is_empty());
}
