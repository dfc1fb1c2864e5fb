//! Instance record and lifecycle states.

use std::collections::BTreeMap;

use fleet_id::InstanceId;
use serde::{Deserialize, Serialize};

/// Stable lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Active,
    Building,
    Stopped,
    Paused,
    Error,
    Shelved,
    ShelvedOffloaded,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Active => "active",
            VmState::Building => "building",
            VmState::Stopped => "stopped",
            VmState::Paused => "paused",
            VmState::Error => "error",
            VmState::Shelved => "shelved",
            VmState::ShelvedOffloaded => "shelved_offloaded",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker for the operation currently owning an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduling,
    ResizePrep,
    Migrating,
    Rebuilding,
    Unshelving,
    PoweringOn,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduling => "scheduling",
            TaskState::ResizePrep => "resize_prep",
            TaskState::Migrating => "migrating",
            TaskState::Rebuilding => "rebuilding",
            TaskState::Unshelving => "unshelving",
            TaskState::PoweringOn => "powering_on",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource shape of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    /// Database id, compared against the instance's `instance_type_id`.
    pub id: i64,
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub root_gb: u64,
    pub ephemeral_gb: u64,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl Flavor {
    /// Total disk footprint in GB.
    pub fn disk_gb(&self) -> u64 {
        self.root_gb + self.ephemeral_gb
    }
}

/// An instance (workload) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub host: Option<String>,
    pub node: Option<String>,
    pub vm_state: VmState,
    pub task_state: Option<TaskState>,
    pub flavor: Flavor,
    /// Id of the flavor the instance currently runs with.
    pub instance_type_id: i64,
    pub image_ref: Option<String>,
    #[serde(default)]
    pub system_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Bumped on every successful save.
    pub revision: u64,
}

impl Instance {
    /// A migration to `target` is a resize when the flavor changes.
    pub fn is_resize_to(&self, target: &Flavor) -> bool {
        self.instance_type_id != target.id
    }
}

/// Expected `task_state` guard for a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedTaskState {
    /// Unconditional save.
    #[default]
    Any,
    /// The save fails with a conflict unless the stored value matches.
    Is(Option<TaskState>),
}

impl ExpectedTaskState {
    pub fn matches(&self, actual: Option<TaskState>) -> bool {
        match self {
            ExpectedTaskState::Any => true,
            ExpectedTaskState::Is(expected) => *expected == actual,
        }
    }

    pub fn expected(&self) -> Option<Option<TaskState>> {
        match self {
            ExpectedTaskState::Any => None,
            ExpectedTaskState::Is(expected) => Some(*expected),
        }
    }
}

/// A partial update of an instance. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub vm_state: Option<VmState>,
    pub task_state: Option<Option<TaskState>>,
    pub host: Option<Option<String>>,
    pub node: Option<Option<String>>,
    pub system_metadata: Option<BTreeMap<String, String>>,
}

impl InstanceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vm_state(mut self, vm_state: VmState) -> Self {
        self.vm_state = Some(vm_state);
        self
    }

    pub fn task_state(mut self, task_state: Option<TaskState>) -> Self {
        self.task_state = Some(task_state);
        self
    }

    pub fn host(mut self, host: Option<String>, node: Option<String>) -> Self {
        self.host = Some(host);
        self.node = Some(node);
        self
    }

    pub fn system_metadata(mut self, system_metadata: BTreeMap<String, String>) -> Self {
        self.system_metadata = Some(system_metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the update in place. Does not touch the revision.
    pub fn apply(&self, instance: &mut Instance) {
        if let Some(vm_state) = self.vm_state {
            instance.vm_state = vm_state;
        }
        if let Some(task_state) = self.task_state {
            instance.task_state = task_state;
        }
        if let Some(host) = &self.host {
            instance.host = host.clone();
        }
        if let Some(node) = &self.node {
            instance.node = node.clone();
        }
        if let Some(system_metadata) = &self.system_metadata {
            instance.system_metadata = system_metadata.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn flavor(id: i64) -> Flavor {
        Flavor {
            id,
            name: format!("m1.{id}"),
            vcpus: 1,
            memory_mb: 512,
            root_gb: 1,
            ephemeral_gb: 0,
            extra_specs: BTreeMap::new(),
        }
    }

    fn instance() -> Instance {
        Instance {
            id: InstanceId::new(),
            host: Some("host-a".to_string()),
            node: Some("node-a".to_string()),
            vm_state: VmState::Active,
            task_state: Some(TaskState::Migrating),
            flavor: flavor(1),
            instance_type_id: 1,
            image_ref: None,
            system_metadata: BTreeMap::new(),
            metadata: BTreeMap::new(),
            revision: 0,
        }
    }

    #[test]
    fn test_vm_state_serialization() {
        assert_eq!(
            serde_json::to_string(&VmState::ShelvedOffloaded).unwrap(),
            "\"shelved_offloaded\""
        );
        assert_eq!(TaskState::PoweringOn.to_string(), "powering_on");
    }

    #[test]
    fn test_resize_detection() {
        let instance = instance();
        assert!(!instance.is_resize_to(&flavor(1)));
        assert!(instance.is_resize_to(&flavor(2)));
    }

    #[rstest]
    #[case(ExpectedTaskState::Any, Some(TaskState::Migrating), true)]
    #[case(ExpectedTaskState::Is(Some(TaskState::Migrating)), Some(TaskState::Migrating), true)]
    #[case(ExpectedTaskState::Is(Some(TaskState::Unshelving)), Some(TaskState::Migrating), false)]
    #[case(ExpectedTaskState::Is(None), None, true)]
    #[case(ExpectedTaskState::Is(None), Some(TaskState::Scheduling), false)]
    fn test_expected_task_state(
        #[case] expected: ExpectedTaskState,
        #[case] actual: Option<TaskState>,
        #[case] matches: bool,
    ) {
        assert_eq!(expected.matches(actual), matches);
    }

    #[test]
    fn test_update_clears_task_state() {
        let mut instance = instance();
        InstanceUpdate::new()
            .vm_state(VmState::Error)
            .task_state(None)
            .apply(&mut instance);
        assert_eq!(instance.vm_state, VmState::Error);
        assert_eq!(instance.task_state, None);
        assert_eq!(instance.host.as_deref(), Some("host-a"));
    }

    #[test]
    fn test_empty_update() {
        assert!(InstanceUpdate::new().is_empty());
        assert!(!InstanceUpdate::new().task_state(None).is_empty());
    }
}
