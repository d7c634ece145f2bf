//! 任务执行层：有界执行池、租约心跳和内置处理器

pub mod components;
pub mod executors;

pub use components::{
    execute, ExecutionOutcome, HeartbeatExit, LeaseHeartbeat, SlotPermit, WorkerPool,
};
pub use executors::{
    build_handler, HttpHandler, HttpTaskParams, ShellHandler, ShellTaskParams,
};
