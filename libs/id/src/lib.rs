//! # fleet-id
//!
//! Typed identifiers used by the fleet conductor.
//!
//! Two families of IDs exist:
//!
//! - **Prefixed ULIDs** for records the conductor itself mints
//!   (`mig_01HV4Z…`, `resv_01HV4Z…`, `req_01HV4Z…`). The prefix names the
//!   record type and the ULID keeps them time-ordered.
//! - **Instance UUIDs** for workloads. Instances are created by the API tier
//!   and arrive here as opaque hyphenated UUIDs; the conductor never mints
//!   them outside of tests and dev mode.
//!
//! Both families parse strictly and roundtrip through `Display`/`FromStr` and
//! serde.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
