//! Migration records.

use chrono::{DateTime, Utc};
use fleet_id::{InstanceId, MigrationId};
use serde::{Deserialize, Serialize};

use super::{Flavor, Instance};

/// Status of a migration record.
///
/// Records move forward through `accepted → pre-migrating → migrating →
/// post-migrating → completed`, or jump to one of the failure statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    Accepted,
    PreMigrating,
    Migrating,
    PostMigrating,
    Completed,
    Error,
    Failed,
    Reverted,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Accepted => "accepted",
            MigrationStatus::PreMigrating => "pre-migrating",
            MigrationStatus::Migrating => "migrating",
            MigrationStatus::PostMigrating => "post-migrating",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Error => "error",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Reverted => "reverted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed
                | MigrationStatus::Error
                | MigrationStatus::Failed
                | MigrationStatus::Reverted
        )
    }

    fn progress(&self) -> Option<u8> {
        match self {
            MigrationStatus::Accepted => Some(0),
            MigrationStatus::PreMigrating => Some(1),
            MigrationStatus::Migrating => Some(2),
            MigrationStatus::PostMigrating => Some(3),
            MigrationStatus::Completed => Some(4),
            _ => None,
        }
    }

    /// Whether a record in this status may move to `next`.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.progress(), next.progress()) {
            (Some(from), Some(to)) => to > from,
            // Any live record may fail
            _ => true,
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a migration record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationKind {
    Resize,
    Migration,
    LiveMigration,
    Evacuation,
}

impl MigrationKind {
    /// Kind for records that predate the explicit kind field.
    pub fn from_flavors(old_instance_type_id: Option<i64>, new_instance_type_id: Option<i64>) -> Self {
        if old_instance_type_id != new_instance_type_id {
            MigrationKind::Resize
        } else {
            MigrationKind::Migration
        }
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("migration {id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: MigrationId,
    pub from: MigrationStatus,
    pub to: MigrationStatus,
}

/// A migration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub id: MigrationId,
    pub instance_id: InstanceId,
    pub source_compute: Option<String>,
    pub source_node: Option<String>,
    pub dest_compute: Option<String>,
    pub dest_node: Option<String>,
    pub old_instance_type_id: Option<i64>,
    pub new_instance_type_id: Option<i64>,
    pub status: MigrationStatus,
    #[serde(rename = "migration_type")]
    pub kind: MigrationKind,
    #[serde(default)]
    pub hidden: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Migration {
    /// New `pre-migrating` record sourced at the instance's current host.
    pub fn new(instance: &Instance, kind: MigrationKind, new_flavor: Option<&Flavor>) -> Self {
        let now = Utc::now();
        Self {
            id: MigrationId::new(),
            instance_id: instance.id,
            source_compute: instance.host.clone(),
            source_node: instance.node.clone(),
            dest_compute: None,
            dest_node: None,
            old_instance_type_id: Some(instance.instance_type_id),
            new_instance_type_id: Some(new_flavor.map_or(instance.instance_type_id, |f| f.id)),
            status: MigrationStatus::PreMigrating,
            kind,
            hidden: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style destination setter.
    pub fn with_destination(mut self, host: Option<String>, node: Option<String>) -> Self {
        self.dest_compute = host;
        self.dest_node = node;
        self
    }

    pub fn with_status(mut self, status: MigrationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the record to `next`, refusing to touch terminal records.
    pub fn transition(&mut self, next: MigrationStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
