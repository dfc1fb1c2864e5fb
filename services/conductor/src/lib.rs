//! fleet conductor library.
//!
//! The conductor sits between the API tier and the compute hosts. It drives
//! multi-step instance workflows (build, cold migrate and resize, live
//! migrate, rebuild and evacuate, unshelve): it asks the scheduler for
//! destinations, dispatches work to compute hosts, retries on other hosts
//! within a bound and puts instance state back when a workflow fails.
//!
//! ## Architecture
//!
//! ```text
//! ConductorService  (mpsc loop, one tokio task per request)
//! └── ComputeTaskManager
//!     └── tasks::{Build, Migration, LiveMigration, Rebuild, Unshelve}Task
//!         ├── PlacementSelector  -> SchedulerClient
//!         ├── ComputeApi         -> Dispatcher -> Transport
//!         ├── InstanceStore / MigrationStore / HostRegistry
//!         └── Notifier
//! ```
//!
//! ## Modules
//!
//! - `tasks`: the workflows
//! - `scheduler`: placement bookkeeping and scheduler clients
//! - `dispatch`: compute operations, cast/call and version caps
//! - `registry`: instance, migration and host stores
//! - `compat`: versioned record downgrades

pub mod compat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod image;
pub mod manager;
pub mod model;
pub mod notifier;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod tasks;

pub use config::ConductorConfig;
pub use error::{ErrorClass, ExpectedError, TaskError, TaskResult};
pub use manager::{ComputeTaskManager, MigrateOutcome, MigrateServerRequest};
pub use service::{channel, ConductorHandle, ConductorService, TaskOutcome, TaskRequest};
pub use tasks::{Collaborators, TaskContext};
