pub mod model;
pub mod planner;
pub mod prepare;
pub mod process;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod store;

pub use model::{JobRecord, JobStatus, Progress, WorkDescriptor};
pub use planner::{parse_params, PlannerOptions, PlannerRegistry};
pub use prepare::PrepareStep;
pub use process::{Invocation, ProgressRule};
pub use scheduler::{Scheduler, SchedulerConfig, Submitted};
pub use status::{LogTail, StatusReader};
pub use store::{JobPaths, StatusStore};
