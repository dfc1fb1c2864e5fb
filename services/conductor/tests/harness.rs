//! Test harness for conductor integration tests.
//!
//! Wires a conductor with in-memory stores, a scripted scheduler, a
//! recording dispatcher and a recording notifier, and builds instances
//! in the states the workflows expect.

#![allow(dead_code)]

use std::sync::Arc;

use fleet_conductor::{
    config::ConductorConfig,
    dispatch::{Dispatcher, MockDispatcher},
    image::InMemoryImageService,
    model::{Candidate, Flavor, HostRecord, Instance, TaskState, VmState},
    notifier::RecordingNotifier,
    quota::InMemoryQuotaEngine,
    registry::{
        InMemoryHostRegistry, InMemoryInstanceStore, InMemoryMigrationStore, InstanceStore,
    },
    scheduler::MockScheduler,
    Collaborators, ComputeTaskManager, TaskContext,
};
use fleet_id::InstanceId;

pub struct Conductor {
    pub config: ConductorConfig,
    pub instances: Arc<InMemoryInstanceStore>,
    pub migrations: Arc<InMemoryMigrationStore>,
    pub hosts: Arc<InMemoryHostRegistry>,
    pub images: Arc<InMemoryImageService>,
    pub quotas: Arc<InMemoryQuotaEngine>,
    pub scheduler: Arc<MockScheduler>,
    pub dispatcher: Arc<MockDispatcher>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Conductor {
    /// Conductor whose scheduler answers from `candidates`, in order.
    /// Every candidate host is registered and up.
    pub fn new(candidates: &[(&str, &str)]) -> Self {
        Self::with_scheduler(
            MockScheduler::with_hosts(
                candidates
                    .iter()
                    .map(|(host, node)| Candidate::new(*host, Some(*node))),
            ),
            candidates.iter().map(|(host, _)| *host),
        )
    }

    pub fn with_scheduler<'a>(
        scheduler: MockScheduler,
        hosts: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let registry = InMemoryHostRegistry::new();
        for host in hosts {
            registry.upsert(HostRecord::new(host, 8, 16384, 200));
        }
        Self {
            config: ConductorConfig::default(),
            instances: Arc::new(InMemoryInstanceStore::new()),
            migrations: Arc::new(InMemoryMigrationStore::new()),
            hosts: Arc::new(registry),
            images: Arc::new(InMemoryImageService::new()),
            quotas: Arc::new(InMemoryQuotaEngine::new()),
            scheduler: Arc::new(scheduler),
            dispatcher: Arc::new(MockDispatcher::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    pub fn context(&self) -> TaskContext {
        self.context_with(self.dispatcher.clone())
    }

    /// Context that dispatches through `dispatcher` instead of the recorder.
    pub fn context_with(&self, dispatcher: Arc<dyn Dispatcher>) -> TaskContext {
        TaskContext::new(
            self.config.clone(),
            Collaborators {
                instances: self.instances.clone(),
                migrations: self.migrations.clone(),
                hosts: self.hosts.clone(),
                images: self.images.clone(),
                quotas: self.quotas.clone(),
                scheduler: self.scheduler.clone(),
                dispatcher,
                notifier: self.notifier.clone(),
            },
        )
    }

    pub fn manager(&self) -> ComputeTaskManager {
        ComputeTaskManager::new(self.context())
    }

    pub async fn add(&self, instance: Instance) -> Instance {
        self.instances.create(instance).await.unwrap()
    }

    pub fn current(&self, id: InstanceId) -> Instance {
        self.instances.snapshot(id).unwrap()
    }
}

pub fn flavor(id: i64, memory_mb: u64) -> Flavor {
    Flavor {
        id,
        name: format!("flavor-{id}"),
        vcpus: 1,
        memory_mb,
        root_gb: 1,
        ephemeral_gb: 0,
        extra_specs: Default::default(),
    }
}

pub fn instance_on(host: &str, vm_state: VmState, task_state: Option<TaskState>) -> Instance {
    let flavor = flavor(1, 512);
    Instance {
        id: InstanceId::new(),
        host: Some(host.to_string()),
        node: Some(host.to_string()),
        vm_state,
        task_state,
        instance_type_id: flavor.id,
        flavor,
        image_ref: Some("fake-image".to_string()),
        system_metadata: [
            ("image_min_ram".to_string(), "0".to_string()),
            ("image_disk_format".to_string(), "qcow2".to_string()),
        ]
        .into_iter()
        .collect(),
        metadata: Default::default(),
        revision: 0,
    }
}

pub fn unplaced(count: usize) -> Vec<Instance> {
    (0..count)
        .map(|_| {
            let mut instance = instance_on("", VmState::Building, Some(TaskState::Scheduling));
            instance.host = None;
            instance.node = None;
            instance
        })
        .collect()
}
