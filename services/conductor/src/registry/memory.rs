//! In-memory registry implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_id::{InstanceId, MigrationId};
use tracing::debug;

use super::{HostRegistry, InstanceStore, MigrationStore, RegistryError};
use crate::model::{
    ExpectedTaskState, HostRecord, Instance, InstanceUpdate, Migration, MigrationKind,
    MigrationStatus,
};

fn poisoned() -> RegistryError {
    RegistryError::Backend("registry lock poisoned".to_string())
}

fn describe(task_state: Option<crate::model::TaskState>) -> String {
    task_state.map_or_else(|| "None".to_string(), |s| s.to_string())
}

// =============================================================================
// Instances
// =============================================================================

/// Instance store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: Mutex<HashMap<InstanceId, Instance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `instances`.
    pub fn with_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.instances.lock() {
            map.extend(instances.into_iter().map(|i| (i.id, i)));
        }
        store
    }

    /// Current record, if any. Test helper.
    pub fn snapshot(&self, id: InstanceId) -> Option<Instance> {
        self.instances.lock().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn get(&self, id: InstanceId) -> Result<Instance, RegistryError> {
        self.instances
            .lock()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .ok_or(RegistryError::InstanceNotFound(id))
    }

    async fn save(
        &self,
        id: InstanceId,
        update: &InstanceUpdate,
        expected: ExpectedTaskState,
    ) -> Result<Instance, RegistryError> {
        let mut instances = self.instances.lock().map_err(|_| poisoned())?;
        let instance = instances
            .get_mut(&id)
            .ok_or(RegistryError::InstanceNotFound(id))?;

        if !expected.matches(instance.task_state) {
            return Err(RegistryError::Conflict {
                instance_id: id,
                expected: expected
                    .expected()
                    .map_or_else(|| "any".to_string(), describe),
                actual: describe(instance.task_state),
            });
        }

        update.apply(instance);
        instance.revision += 1;
        debug!(
            instance_id = %id,
            vm_state = %instance.vm_state,
            task_state = %describe(instance.task_state),
            revision = instance.revision,
            "Instance saved"
        );
        Ok(instance.clone())
    }

    async fn create(&self, instance: Instance) -> Result<Instance, RegistryError> {
        let mut instances = self.instances.lock().map_err(|_| poisoned())?;
        if instances.contains_key(&instance.id) {
            return Err(RegistryError::Backend(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn delete(&self, id: InstanceId) -> Result<(), RegistryError> {
        self.instances
            .lock()
            .map_err(|_| poisoned())?
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::InstanceNotFound(id))
    }
}

// =============================================================================
// Migrations
// =============================================================================

/// Migration store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    migrations: Mutex<HashMap<MigrationId, Migration>>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records for an instance, oldest first. Test helper.
    pub fn for_instance(&self, instance_id: InstanceId) -> Vec<Migration> {
        let Ok(migrations) = self.migrations.lock() else {
            return Vec::new();
        };
        let mut found: Vec<Migration> = migrations
            .values()
            .filter(|m| m.instance_id == instance_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.created_at, m.id));
        found
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn create(&self, migration: Migration) -> Result<Migration, RegistryError> {
        self.migrations
            .lock()
            .map_err(|_| poisoned())?
            .insert(migration.id, migration.clone());
        Ok(migration)
    }

    async fn save(&self, migration: &Migration) -> Result<Migration, RegistryError> {
        let mut migrations = self.migrations.lock().map_err(|_| poisoned())?;
        let stored = migrations
            .get_mut(&migration.id)
            .ok_or(RegistryError::MigrationNotFound(migration.id))?;
        if stored.is_terminal() && stored != migration {
            return Err(RegistryError::Backend(format!(
                "migration {} is {} and cannot change",
                migration.id, stored.status
            )));
        }
        *stored = migration.clone();
        Ok(migration.clone())
    }

    async fn get(&self, id: MigrationId) -> Result<Migration, RegistryError> {
        self.migrations
            .lock()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .ok_or(RegistryError::MigrationNotFound(id))
    }

    async fn get_by_instance_and_status(
        &self,
        instance_id: InstanceId,
        status: MigrationStatus,
        kind: Option<MigrationKind>,
    ) -> Result<Option<Migration>, RegistryError> {
        let migrations = self.migrations.lock().map_err(|_| poisoned())?;
        Ok(migrations
            .values()
            .filter(|m| m.instance_id == instance_id && m.status == status)
            .filter(|m| kind.map_or(true, |k| m.kind == k))
            .max_by_key(|m| (m.created_at, m.id))
            .cloned())
    }
}

// =============================================================================
// Hosts
// =============================================================================

/// Host registry backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryHostRegistry {
    hosts: Mutex<HashMap<String, HostRecord>>,
}

impl InMemoryHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hosts(hosts: impl IntoIterator<Item = HostRecord>) -> Self {
        let registry = Self::new();
        for host in hosts {
            registry.upsert(host);
        }
        registry
    }

    pub fn upsert(&self, host: HostRecord) {
        if let Ok(mut hosts) = self.hosts.lock() {
            hosts.insert(host.host.clone(), host);
        }
    }

    /// Marks a host's service up or down.
    pub fn set_service_up(&self, host: &str, up: bool) {
        if let Ok(mut hosts) = self.hosts.lock() {
            if let Some(record) = hosts.get_mut(host) {
                record.service_up = up;
            }
        }
    }
}

#[async_trait]
impl HostRegistry for InMemoryHostRegistry {
    async fn get_host(&self, host: &str) -> Result<HostRecord, RegistryError> {
        self.hosts
            .lock()
            .map_err(|_| poisoned())?
            .get(host)
            .cloned()
            .ok_or_else(|| RegistryError::HostNotFound(host.to_string()))
    }

    async fn list_hosts(&self) -> Result<Vec<HostRecord>, RegistryError> {
        let mut hosts: Vec<HostRecord> = self
            .hosts
            .lock()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(hosts)
    }
}
