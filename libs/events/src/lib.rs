//! # fleet-events
//!
//! Notification envelope and event types emitted by the fleet conductor.
//!
//! ## Design Principles
//!
//! - Notifications are fire-and-forget records of what a workflow did
//! - Every notification carries a publisher, a priority and a timestamp
//! - Failure notifications carry the original error text and the request
//!   spec the workflow started with, so audit trails stay stable across
//!   scheduling retries
//!
//! ## Event Types
//!
//! - Workflow failures (`compute_task.*`)
//! - Instance lifecycle (`compute.instance.*`)
//! - Operation lifecycle (`conductor.<action>.start|end|error`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
