pub mod clock;
pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{SchedulerError, SchedulerResult};
pub use models::{
    AttemptOutcome, AttemptRecord, BackoffKind, CronState, InstanceSnapshot, InstanceStatus,
    LeaseStatus, RetryPolicy, TaskInstance, TraceContext,
};
pub use traits::{handler_fn, HandlerError, LeaseToken, LockProvider, TaskContext, TaskHandler, TaskStore};
