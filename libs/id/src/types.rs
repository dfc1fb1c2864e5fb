//! ID definitions for conductor records.

use crate::define_prefixed_id;
use crate::IdError;

define_prefixed_id!(
    /// Identifies a migration record (resize, cold, live or evacuation).
    MigrationId,
    "mig"
);
define_prefixed_id!(
    /// Identifies a quota reservation held for the duration of a resize.
    ReservationId,
    "resv"
);
define_prefixed_id!(
    /// Correlates every notification emitted for one conductor request.
    RequestId,
    "req"
);

// =============================================================================
// Instance UUID
// =============================================================================

/// Opaque instance identity.
///
/// Instances are identified by a hyphenated UUID minted by the API tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    /// Mints a random instance ID. Only tests and dev mode create instances.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> uuid::Uuid {
        self.0
    }

    /// Parses a hyphenated UUID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdError::InvalidUuid(e.to_string()))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
