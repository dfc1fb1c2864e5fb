//! Shared wiring for workflow unit tests.

use std::sync::Arc;

use fleet_id::InstanceId;

use super::{Collaborators, TaskContext};
use crate::config::ConductorConfig;
use crate::dispatch::MockDispatcher;
use crate::image::InMemoryImageService;
use crate::model::{Candidate, Flavor, HostRecord, Instance, VmState};
use crate::notifier::RecordingNotifier;
use crate::quota::InMemoryQuotaEngine;
use crate::registry::{InMemoryHostRegistry, InMemoryInstanceStore, InMemoryMigrationStore};
use crate::scheduler::MockScheduler;

pub(crate) fn flavor(id: i64) -> Flavor {
    Flavor {
        id,
        name: format!("m1.flavor{id}"),
        vcpus: 1,
        memory_mb: 512,
        root_gb: 1,
        ephemeral_gb: 0,
        extra_specs: Default::default(),
    }
}

pub(crate) fn instance(vm_state: VmState, host: &str) -> Instance {
    Instance {
        id: InstanceId::new(),
        host: Some(host.to_string()),
        node: Some(host.to_string()),
        vm_state,
        task_state: None,
        flavor: flavor(1),
        instance_type_id: 1,
        image_ref: Some("img-1".to_string()),
        system_metadata: Default::default(),
        metadata: Default::default(),
        revision: 0,
    }
}

pub(crate) struct Harness {
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

impl Harness {
    /// Harness whose scheduler answers from `hosts`, all registered and up.
    pub fn with_hosts(hosts: &[&str]) -> Self {
        Self::scripted(MockScheduler::with_hosts(
            hosts.iter().map(|h| Candidate::new(*h, Some(h))),
        ))
        .register_hosts(hosts)
    }

    pub fn scripted(scheduler: MockScheduler) -> Self {
        Self {
            config: ConductorConfig::default(),
            instances: Arc::new(InMemoryInstanceStore::new()),
            migrations: Arc::new(InMemoryMigrationStore::new()),
            hosts: Arc::new(InMemoryHostRegistry::new()),
            images: Arc::new(InMemoryImageService::new()),
            quotas: Arc::new(InMemoryQuotaEngine::new()),
            scheduler: Arc::new(scheduler),
            dispatcher: Arc::new(MockDispatcher::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    pub fn register_hosts(self, hosts: &[&str]) -> Self {
        for host in hosts {
            self.hosts.upsert(HostRecord::new(*host, 8, 16384, 200));
        }
        self
    }

    pub fn ctx(&self) -> TaskContext {
        TaskContext::new(self.config.clone(), self.collaborators())
    }

    /// The harness collaborators, for tests that swap one out.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            instances: self.instances.clone(),
            migrations: self.migrations.clone(),
            hosts: self.hosts.clone(),
            images: self.images.clone(),
            quotas: self.quotas.clone(),
            scheduler: self.scheduler.clone(),
            dispatcher: self.dispatcher.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Stores `instance` and returns it.
    pub async fn add(&self, instance: Instance) -> Instance {
        use crate::registry::InstanceStore;
        self.instances.create(instance).await.unwrap()
    }

    pub fn current(&self, id: InstanceId) -> Instance {
        self.instances.snapshot(id).unwrap()
    }
}
