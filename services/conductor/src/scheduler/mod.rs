//! Placement: the scheduler interface and the per-invocation bookkeeping
//! around it.
//!
//! The scheduler is responsible for:
//! - Filtering and weighing hosts for a request spec
//! - Honouring the exclusion set carried in the filter properties
//!
//! The conductor side is responsible for:
//! - Retry counting and the exclusion set ([`PlacementRequest`])
//! - Server-group policy setup ([`setup_instance_group`])
//! - Never returning an excluded host ([`PlacementSelector`])

mod capacity;
mod mock;
mod placement;

pub use capacity::CapacityScheduler;
pub use mock::{MockScheduler, SchedulerCall};
pub use placement::{
    populate_filter_properties, setup_instance_group, PlacementRequest, PlacementSelector,
};

use async_trait::async_trait;

use crate::dispatch::TransportError;
use crate::model::{Candidate, FilterProperties, RequestSpec};

/// Filter that enforces the `anti-affinity` group policy.
pub const ANTI_AFFINITY_FILTER: &str = "ServerGroupAntiAffinityFilter";

/// Filter that enforces the `affinity` group policy.
pub const AFFINITY_FILTER: &str = "ServerGroupAffinityFilter";

/// Reason reported when too few hosts pass the filters.
pub const NOT_ENOUGH_HOSTS: &str = "There are not enough hosts available.";

/// Errors returned by a scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("no valid host: {reason}")]
    NoValidHost { reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("scheduler failure: {0}")]
    Internal(String),
}

/// The scheduler black box.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Ordered candidates for `spec`, at least one per requested instance.
    async fn select_destinations(
        &self,
        spec: &RequestSpec,
        filter_properties: &FilterProperties,
    ) -> Result<Vec<Candidate>, SchedulerError>;
}
