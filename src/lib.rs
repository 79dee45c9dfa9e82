#![doc = include_str!("../README.md")]
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod client;
pub mod diff;
pub mod error;
pub mod plan;
pub mod planner;
pub mod selection;
pub mod session;
pub mod throttle;
pub mod topology;
pub mod tracker;

pub use error::{Error, Result};
pub use plan::ReassignmentPlan;
pub use planner::AssignmentPlanner;
pub use selection::PartitionSelection;
pub use session::{ReassignmentSession, SessionBuilder};
pub use throttle::ThrottleController;
pub use topology::TopologySnapshot;
pub use tracker::{ReassignmentTracker, TrackerBuilder};
