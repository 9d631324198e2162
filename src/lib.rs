pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod registry;
pub mod status;
pub mod tracking;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use registry::{BatchRegistry, Engine, PlanJob, PlanJobStatus};
pub use status::{BatchLookup, StatusProjector};
