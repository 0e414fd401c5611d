pub mod assigner;
pub mod job;
pub mod policy;
pub mod queue;
pub mod requirements;

pub use assigner::{CycleReport, Scheduler, SchedulerError};
pub use job::{
    Command, CommandState, Job, JobSnapshot, JobSpec, JobState, Task, TaskSnapshot, TaskSpec,
    TaskState,
};
pub use policy::{AllocationAction, AllocationPlan, FifoPolicy, SchedulerPolicy};
pub use queue::TaskQueue;
pub use requirements::{Capabilities, Requirements};
