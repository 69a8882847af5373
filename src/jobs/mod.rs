//! Jobs: the per-upload state machine, the registry that stores them and the
//! background execution that drives a job through its two encoder passes.

mod execution;
mod job;
mod registry;

pub use execution::Executor;
pub use job::{Job, JobStatus};
pub use registry::{JobRegistry, JobSlot};

pub(crate) use registry::{remove_dir_if_exists, remove_file_if_exists};
