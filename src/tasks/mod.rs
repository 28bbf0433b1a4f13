//! Live task state for the currently-open task group.

pub mod model;
pub mod registry;

pub use model::{SourceSeed, TaskRecord};
pub use registry::TaskRegistry;
