pub mod heartbeat_manager;
pub mod task_execution;

pub use heartbeat_manager::{HeartbeatExit, LeaseHeartbeat};
pub use task_execution::{execute, ExecutionOutcome, SlotPermit, WorkerPool};
