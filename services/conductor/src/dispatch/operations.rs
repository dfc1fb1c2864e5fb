//! The closed set of compute operations and their wire versions.

use serde::{Deserialize, Serialize};

use crate::compat::{Downgrade, Fields, Version};

/// Whether an operation expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Cast,
    Call,
}

/// Operations the conductor sends to compute hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeOperation {
    BuildAndRunInstance,
    PrepResize,
    CheckCanLiveMigrateDestination,
    LiveMigration,
    RebuildInstance,
    UnshelveInstance,
    StartInstance,
}

const BASE: Version = Version::new(4, 0);

fn drop_keys(fields: &mut Fields, keys: &[&str]) {
    for key in keys {
        fields.remove(*key);
    }
}

const REBUILD_LADDER: &[Downgrade] = &[Downgrade {
    below: Version::new(4, 5),
    apply: |f| drop_keys(f, &["migration", "node", "limits"]),
}];

const PREP_RESIZE_LADDER: &[Downgrade] = &[Downgrade {
    below: Version::new(4, 1),
    apply: |f| drop_keys(f, &["clean_shutdown"]),
}];

const LIVE_MIGRATION_LADDER: &[Downgrade] = &[Downgrade {
    below: Version::new(4, 2),
    apply: |f| drop_keys(f, &["migration"]),
}];

impl ComputeOperation {
    pub const ALL: [ComputeOperation; 7] = [
        ComputeOperation::BuildAndRunInstance,
        ComputeOperation::PrepResize,
        ComputeOperation::CheckCanLiveMigrateDestination,
        ComputeOperation::LiveMigration,
        ComputeOperation::RebuildInstance,
        ComputeOperation::UnshelveInstance,
        ComputeOperation::StartInstance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ComputeOperation::BuildAndRunInstance => "build_and_run_instance",
            ComputeOperation::PrepResize => "prep_resize",
            ComputeOperation::CheckCanLiveMigrateDestination => {
                "check_can_live_migrate_destination"
            }
            ComputeOperation::LiveMigration => "live_migration",
            ComputeOperation::RebuildInstance => "rebuild_instance",
            ComputeOperation::UnshelveInstance => "unshelve_instance",
            ComputeOperation::StartInstance => "start_instance",
        }
    }

    pub fn mode(&self) -> DispatchMode {
        match self {
            ComputeOperation::PrepResize | ComputeOperation::CheckCanLiveMigrateDestination => {
                DispatchMode::Call
            }
            _ => DispatchMode::Cast,
        }
    }

    /// Version of the current argument shape.
    pub fn latest_version(&self) -> Version {
        match self {
            ComputeOperation::RebuildInstance => Version::new(4, 5),
            ComputeOperation::LiveMigration => Version::new(4, 2),
            ComputeOperation::PrepResize => Version::new(4, 1),
            _ => BASE,
        }
    }

    /// Oldest version the operation can be backported to.
    pub fn min_version(&self) -> Version {
        BASE
    }

    /// Payload downgrade steps for older hosts.
    pub fn backports(&self) -> &'static [Downgrade] {
        match self {
            ComputeOperation::RebuildInstance => REBUILD_LADDER,
            ComputeOperation::PrepResize => PREP_RESIZE_LADDER,
            ComputeOperation::LiveMigration => LIVE_MIGRATION_LADDER,
            _ => &[],
        }
    }
}

impl std::fmt::Display for ComputeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ComputeOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| format!("unknown compute operation: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::make_compatible;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_names_parse_back() {
        for op in ComputeOperation::ALL {
            assert_eq!(op.name().parse::<ComputeOperation>().unwrap(), op);
            assert_eq!(
                serde_json::to_value(op).unwrap(),
                serde_json::Value::from(op.name())
            );
        }
    }

    #[rstest]
    #[case(ComputeOperation::PrepResize, DispatchMode::Call)]
    #[case(ComputeOperation::CheckCanLiveMigrateDestination, DispatchMode::Call)]
    #[case(ComputeOperation::BuildAndRunInstance, DispatchMode::Cast)]
    #[case(ComputeOperation::LiveMigration, DispatchMode::Cast)]
    fn test_modes(#[case] op: ComputeOperation, #[case] mode: DispatchMode) {
        assert_eq!(op.mode(), mode);
    }

    #[test]
    fn test_rebuild_backport_to_4_0() {
        let mut fields = json!({
            "instance": {},
            "migration": {"id": "mig_x"},
            "node": "n1",
            "limits": {},
            "recreate": true
        })
        .as_object()
        .cloned()
        .unwrap();
        let op = ComputeOperation::RebuildInstance;

        make_compatible(&mut fields, op.latest_version(), Version::new(4, 0), op.backports())
            .unwrap();

        assert!(!fields.contains_key("migration"));
        assert!(!fields.contains_key("node"));
        assert!(!fields.contains_key("limits"));
        assert_eq!(fields["recreate"], json!(true));
    }

    #[test]
    fn test_prep_resize_backport_keeps_current_fields_at_4_1() {
        let mut fields = json!({"clean_shutdown": false}).as_object().cloned().unwrap();
        let op = ComputeOperation::PrepResize;
        make_compatible(&mut fields, op.latest_version(), Version::new(4, 1), op.backports())
            .unwrap();
        assert!(fields.contains_key("clean_shutdown"));
    }
}
