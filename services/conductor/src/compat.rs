//! Versioned wire and record compatibility.
//!
//! Every versioned shape is a typed current-version struct plus an ordered
//! ladder of pure downgrade steps. Producing a primitive for an older
//! reader serializes the current struct and applies, newest first, every
//! step introduced after the target version.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::model::{HostRecord, Migration, MigrationKind};

/// Field map a downgrade step rewrites.
pub type Fields = Map<String, Value>;

/// A `major.minor` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for Version {
    type Err = CompatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CompatError::InvalidVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors producing or reading a versioned primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompatError {
    /// Not a `major.minor` string.
    #[error("invalid version: {0:?}")]
    InvalidVersion(String),

    /// The reader asked for something newer than we produce.
    #[error("cannot produce version {target}, current is {current}")]
    NewerThanCurrent { target: Version, current: Version },

    /// Major versions never downgrade.
    #[error("cannot downgrade across major versions ({current} to {target})")]
    MajorMismatch { target: Version, current: Version },

    /// The serialized shape was not a JSON object.
    #[error("versioned payload must be an object")]
    NotAnObject,

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CompatError {
    fn from(e: serde_json::Error) -> Self {
        CompatError::Serialization(e.to_string())
    }
}

/// One rung of a downgrade ladder.
#[derive(Debug, Clone, Copy)]
pub struct Downgrade {
    /// Applied when the target version is older than this.
    pub below: Version,
    pub apply: fn(&mut Fields),
}

/// Rewrites `fields` from `current` down to `target`.
pub fn make_compatible(
    fields: &mut Fields,
    current: Version,
    target: Version,
    ladder: &[Downgrade],
) -> Result<(), CompatError> {
    if target > current {
        return Err(CompatError::NewerThanCurrent { target, current });
    }
    if target.major != current.major {
        return Err(CompatError::MajorMismatch { target, current });
    }

    let mut steps: Vec<&Downgrade> = ladder.iter().filter(|step| target < step.below).collect();
    steps.sort_by(|a, b| b.below.cmp(&a.below));
    for step in steps {
        (step.apply)(fields);
    }
    Ok(())
}

/// Serializes `value` into a field map.
pub fn to_fields<T: Serialize + ?Sized>(value: &T) -> Result<Fields, CompatError> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(CompatError::NotAnObject),
    }
}

fn remove(fields: &mut Fields, keys: &[&str]) {
    for key in keys {
        fields.remove(*key);
    }
}

/// A record with a current version and a downgrade ladder.
pub trait Versioned: Serialize {
    const VERSION: Version;

    fn ladder() -> &'static [Downgrade];

    /// Primitive form readable by a peer at `target`.
    fn to_primitive(&self, target: Version) -> Result<Fields, CompatError> {
        let mut fields = to_fields(self)?;
        make_compatible(&mut fields, Self::VERSION, target, Self::ladder())?;
        Ok(fields)
    }
}

// =============================================================================
// Host record
// =============================================================================

const HOST_RECORD_LADDER: &[Downgrade] = &[
    Downgrade {
        below: Version::new(1, 14),
        apply: |f| remove(f, &["ram_allocation_ratio", "cpu_allocation_ratio"]),
    },
    Downgrade {
        below: Version::new(1, 13),
        apply: |f| {
            // Older readers require a service id
            if f.get("service_id").map_or(true, Value::is_null) {
                f.insert("service_id".to_string(), Value::from(-1));
            }
        },
    },
    Downgrade {
        below: Version::new(1, 7),
        apply: |f| remove(f, &["host"]),
    },
    Downgrade {
        below: Version::new(1, 5),
        apply: |f| remove(f, &["numa_topology"]),
    },
    Downgrade {
        below: Version::new(1, 4),
        apply: |f| remove(f, &["host_ip"]),
    },
    Downgrade {
        below: Version::new(1, 3),
        apply: |f| remove(f, &["stats"]),
    },
];

impl Versioned for HostRecord {
    const VERSION: Version = Version::new(1, 14);

    fn ladder() -> &'static [Downgrade] {
        HOST_RECORD_LADDER
    }
}

// =============================================================================
// Migration record
// =============================================================================

const MIGRATION_LADDER: &[Downgrade] = &[Downgrade {
    below: Version::new(1, 2),
    apply: |f| remove(f, &["migration_type", "hidden"]),
}];

impl Versioned for Migration {
    const VERSION: Version = Version::new(1, 2);

    fn ladder() -> &'static [Downgrade] {
        MIGRATION_LADDER
    }
}

/// Reads a migration primitive of any supported version, deriving the kind
/// from the flavor ids when an older writer left it out.
pub fn migration_from_primitive(mut fields: Fields) -> Result<Migration, CompatError> {
    if !fields.contains_key("migration_type") {
        let flavor_id = |key: &str| fields.get(key).and_then(Value::as_i64);
        let kind = MigrationKind::from_flavors(
            flavor_id("old_instance_type_id"),
            flavor_id("new_instance_type_id"),
        );
        fields.insert("migration_type".to_string(), serde_json::to_value(kind)?);
    }
    Ok(serde_json::from_value(Value::Object(fields))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_id::InstanceId;
    use rstest::rstest;

    use crate::model::{Flavor, Instance, VmState};

    fn instance() -> Instance {
        Instance {
            id: InstanceId::new(),
            host: Some("host-a".to_string()),
            node: None,
            vm_state: VmState::Active,
            task_state: None,
            flavor: Flavor {
                id: 1,
                name: "m1.tiny".to_string(),
                vcpus: 1,
                memory_mb: 512,
                root_gb: 1,
                ephemeral_gb: 0,
                extra_specs: Default::default(),
            },
            instance_type_id: 1,
            image_ref: None,
            system_metadata: Default::default(),
            metadata: Default::default(),
            revision: 0,
        }
    }

    #[rstest]
    #[case("4.5", Version::new(4, 5))]
    #[case(" 1.14 ", Version::new(1, 14))]
    fn test_version_parse(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(input.parse::<Version>().unwrap(), expected);
    }

    #[rstest]
    #[case("4")]
    #[case("4.x")]
    #[case("")]
    fn test_version_parse_rejects(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Version>(),
            Err(CompatError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(1, 3) < Version::new(1, 14));
        assert!(Version::new(4, 0) < Version::new(4, 5));
    }

    #[test]
    fn test_host_record_current_version_is_untouched() {
        let host = HostRecord::new("host-a", 4, 4096, 40);
        let fields = host.to_primitive(HostRecord::VERSION).unwrap();
        assert_eq!(fields, to_fields(&host).unwrap());
    }

    #[test]
    fn test_host_record_1_13_drops_allocation_ratios() {
        let fields = HostRecord::new("host-a", 4, 4096, 40)
            .to_primitive(Version::new(1, 13))
            .unwrap();
        assert!(!fields.contains_key("ram_allocation_ratio"));
        assert!(!fields.contains_key("cpu_allocation_ratio"));
        assert_eq!(fields["service_id"], Value::Null);
        assert!(fields.contains_key("host"));
    }

    #[test]
    fn test_host_record_1_12_requires_service_id() {
        let fields = HostRecord::new("host-a", 4, 4096, 40)
            .to_primitive(Version::new(1, 12))
            .unwrap();
        assert_eq!(fields["service_id"], Value::from(-1));

        let mut host = HostRecord::new("host-a", 4, 4096, 40);
        host.service_id = Some(7);
        let fields = host.to_primitive(Version::new(1, 12)).unwrap();
        assert_eq!(fields["service_id"], Value::from(7));
    }

    #[test]
    fn test_host_record_1_2_drops_everything() {
        let fields = HostRecord::new("host-a", 4, 4096, 40)
            .to_primitive(Version::new(1, 2))
            .unwrap();
        for key in ["host", "numa_topology", "host_ip", "stats", "ram_allocation_ratio"] {
            assert!(!fields.contains_key(key), "{key} should be dropped");
        }
        assert!(fields.contains_key("hypervisor_type"));
    }

    #[test]
    fn test_rejects_newer_and_cross_major_targets() {
        let host = HostRecord::new("host-a", 4, 4096, 40);
        assert!(matches!(
            host.to_primitive(Version::new(1, 15)),
            Err(CompatError::NewerThanCurrent { .. })
        ));
        assert!(matches!(
            host.to_primitive(Version::new(0, 9)),
            Err(CompatError::MajorMismatch { .. })
        ));
    }

    #[test]
    fn test_migration_1_1_drops_kind_and_hidden() {
        let migration = Migration::new(&instance(), MigrationKind::LiveMigration, None);
        let fields = migration.to_primitive(Version::new(1, 1)).unwrap();
        assert!(!fields.contains_key("migration_type"));
        assert!(!fields.contains_key("hidden"));
        assert_eq!(fields["status"], Value::from("pre-migrating"));
    }

    #[test]
    fn test_migration_from_old_primitive_derives_kind() {
        let mut resize = Flavor {
            id: 2,
            ..instance().flavor
        };
        resize.name = "m1.small".to_string();
        let migration = Migration::new(&instance(), MigrationKind::Resize, Some(&resize));
        let fields = migration.to_primitive(Version::new(1, 1)).unwrap();

        let restored = migration_from_primitive(fields).unwrap();
        assert_eq!(restored.kind, MigrationKind::Resize);
        assert!(!restored.hidden);
        assert_eq!(restored.id, migration.id);
    }

    #[test]
    fn test_to_fields_rejects_non_objects() {
        let values: &[u32] = &[1, 2];
        assert!(matches!(to_fields(values), Err(CompatError::NotAnObject)));
        assert!(matches!(to_fields("host-a"), Err(CompatError::NotAnObject)));
    }
}
