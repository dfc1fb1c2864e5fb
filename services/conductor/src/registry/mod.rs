//! Persistence interfaces for instance, migration and host records.
//!
//! The storage engine is external. Workflows only see these traits; the
//! in-memory implementations back dev mode and tests.

mod memory;

pub use memory::{InMemoryHostRegistry, InMemoryInstanceStore, InMemoryMigrationStore};

use async_trait::async_trait;
use fleet_id::{InstanceId, MigrationId};

use crate::model::{
    ExpectedTaskState, HostRecord, Instance, InstanceUpdate, Migration, MigrationKind,
    MigrationStatus,
};

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("migration {0} not found")]
    MigrationNotFound(MigrationId),

    #[error("host {0} not found")]
    HostNotFound(String),

    /// The stored `task_state` did not match what the writer expected.
    #[error("conflict saving instance {instance_id}: expected task_state {expected}, found {actual}")]
    Conflict {
        instance_id: InstanceId,
        expected: String,
        actual: String,
    },

    #[error("registry backend failure: {0}")]
    Backend(String),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::InstanceNotFound(_)
                | RegistryError::MigrationNotFound(_)
                | RegistryError::HostNotFound(_)
        )
    }
}

/// Instance records with optimistic locking on `task_state`.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: InstanceId) -> Result<Instance, RegistryError>;

    /// Applies `update` if the stored `task_state` satisfies `expected`,
    /// bumping the revision. Returns the saved record.
    async fn save(
        &self,
        id: InstanceId,
        update: &InstanceUpdate,
        expected: ExpectedTaskState,
    ) -> Result<Instance, RegistryError>;

    async fn create(&self, instance: Instance) -> Result<Instance, RegistryError>;

    async fn delete(&self, id: InstanceId) -> Result<(), RegistryError>;
}

/// Migration records.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn create(&self, migration: Migration) -> Result<Migration, RegistryError>;

    /// Persists the record. Terminal records cannot be overwritten.
    async fn save(&self, migration: &Migration) -> Result<Migration, RegistryError>;

    async fn get(&self, id: MigrationId) -> Result<Migration, RegistryError>;

    /// Most recent record for the instance in `status`, optionally of one kind.
    async fn get_by_instance_and_status(
        &self,
        instance_id: InstanceId,
        status: MigrationStatus,
        kind: Option<MigrationKind>,
    ) -> Result<Option<Migration>, RegistryError>;
}

/// Known hosts and their capacity.
#[async_trait]
pub trait HostRegistry: Send + Sync {
    async fn get_host(&self, host: &str) -> Result<HostRecord, RegistryError>;

    async fn list_hosts(&self) -> Result<Vec<HostRecord>, RegistryError>;
}
