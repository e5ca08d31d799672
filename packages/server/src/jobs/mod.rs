// Job data model: jobs, optimizing jobs, folders.
//
// These are the durable records the scheduler drives. They carry no behavior
// beyond validation and state-transition bookkeeping; execution lives in the
// scheduler and the optimizing-job controller.

mod folder;
mod job;
mod optimizing;

pub use folder::{JobFolder, DEFAULT_FOLDER};
pub use job::{ClientStats, DependencyRef, Job, JobState, JobTemplate};
pub use optimizing::{OptimizingJob, OptimizingJobTemplate};
