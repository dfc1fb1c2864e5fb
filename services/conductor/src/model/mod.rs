//! Records the conductor reads and writes.
//!
//! - [`Instance`] and its lifecycle states
//! - [`Migration`] records and their status machine
//! - [`HostRecord`] capacity views
//! - Placement inputs: [`RequestSpec`], [`FilterProperties`], [`Candidate`]

mod host;
mod instance;
mod migration;
mod request;

pub use host::HostRecord;
pub use instance::{ExpectedTaskState, Flavor, Instance, InstanceUpdate, TaskState, VmState};
pub use migration::{Migration, MigrationKind, MigrationStatus, TransitionError};
pub use request::{
    Candidate, FilterProperties, GroupHints, ImageMeta, InstanceProperties, Limits, RequestSpec,
    RetryRecord, ServerGroup,
};
