//! Property tests over placement retries and rollback.

mod harness;

use fleet_conductor::{
    dispatch::{ComputeOperation, DispatchError, FaultKind, RemoteFault},
    model::{MigrationStatus, TaskState, VmState},
    quota::ReservationState,
    tasks::{ColdMigrateRequest, MigrationTask, Task},
    ConductorConfig, MigrateServerRequest,
};
use harness::{flavor, instance_on, Conductor};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn pool(size: usize) -> Vec<(String, String)> {
    (0..size)
        .map(|i| (format!("host-{i}"), format!("node-{i}")))
        .collect()
}

fn conductor(hosts: &[(String, String)], max_attempts: u32) -> Conductor {
    let pairs: Vec<(&str, &str)> = hosts
        .iter()
        .map(|(h, n)| (h.as_str(), n.as_str()))
        .collect();
    let mut conductor = Conductor::new(&pairs);
    conductor.config = ConductorConfig {
        scheduler_max_attempts: max_attempts,
        ..Default::default()
    };
    conductor
}

fn reject_everywhere(conductor: &Conductor, hosts: &[(String, String)]) {
    for (host, _) in hosts {
        conductor.dispatcher.fail_next(
            host,
            ComputeOperation::PrepResize,
            DispatchError::remote(
                host,
                ComputeOperation::PrepResize,
                RemoteFault::new(FaultKind::Rejected, "no room"),
            ),
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_exclusions_only_grow(size in 1usize..6, max_attempts in 1u32..6) {
        let hosts = pool(size);
        let conductor = conductor(&hosts, max_attempts);
        reject_everywhere(&conductor, &hosts);

        let err = runtime().block_on(async {
            let w1 = conductor
                .add(instance_on("source", VmState::Active, Some(TaskState::ResizePrep)))
                .await;
            conductor
                .manager()
                .migrate_server(MigrateServerRequest::cold(w1.clone(), flavor(2, 1024)))
                .await
                .unwrap_err()
        });
        prop_assert!(err.is_no_valid_host());

        let calls = conductor.scheduler.calls();
        let expected_calls = if size < max_attempts as usize { size + 1 } else { max_attempts as usize };
        prop_assert_eq!(calls.len(), expected_calls);

        let seen: Vec<_> = calls
            .iter()
            .map(|c| c.filter_properties.excluded_hosts())
            .collect();
        for pair in seen.windows(2) {
            prop_assert!(pair[0].is_subset(&pair[1]));
            prop_assert!(pair[1].len() > pair[0].len());
        }

        let tried: Vec<String> = conductor
            .dispatcher
            .records_for(ComputeOperation::PrepResize)
            .into_iter()
            .map(|r| r.host)
            .collect();
        for (i, host) in tried.iter().enumerate() {
            prop_assert!(!seen[i].contains(host));
        }
        let mut distinct = tried.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(distinct.len(), tried.len());
    }

    #[test]
    fn prop_rollback_is_idempotent(rollbacks in 1usize..5, reservations in 0usize..4) {
        let conductor = conductor(&pool(0), 3);

        let (w1, ids, migration) = runtime().block_on(async {
            let w1 = conductor
                .add(instance_on("source", VmState::Active, Some(TaskState::ResizePrep)))
                .await;
            let ids = conductor.quotas.reserve(reservations);
            let mut request = ColdMigrateRequest::new(w1.clone(), flavor(2, 1024));
            request.reservations = ids.clone();

            let mut task = MigrationTask::new(conductor.context(), request);
            let err = task.execute().await.unwrap_err();
            assert!(err.is_no_valid_host());
            for _ in 0..rollbacks {
                task.rollback().await;
            }
            (w1, ids, task.migration().cloned())
        });

        for id in ids {
            prop_assert_eq!(conductor.quotas.state_of(id), Some(ReservationState::RolledBack));
        }
        let migration = migration.unwrap();
        prop_assert_eq!(migration.status, MigrationStatus::Reverted);
        let stored = conductor.migrations.for_instance(w1.id);
        prop_assert_eq!(stored.len(), 1);
        prop_assert_eq!(stored[0].status, MigrationStatus::Reverted);
    }
}
