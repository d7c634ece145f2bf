pub mod attempt;
pub mod instance;
pub mod policy;
pub mod trace;

pub use attempt::{AttemptOutcome, AttemptRecord};
pub use instance::{CronState, InstanceSnapshot, InstanceStatus, LeaseStatus, TaskInstance};
pub use policy::{BackoffKind, RetryPolicy};
pub use trace::TraceContext;
