//! Run lifecycle: start, retry, continue, stop, and task-level operations.

mod coordinator;
mod error;
mod prompt;

pub use coordinator::{RunLifecycleCoordinator, StartRunRequest};
pub use error::{ErrorCode, RunError};
pub use prompt::assemble_prompt;
