//! 调度核心
//!
//! 包含任务注册表、周期触发器、重试策略计算、轮询调度循环以及对外的任务控制入口。

pub mod controller;
pub mod cron_utils;
pub mod registry;
pub mod retry_service;
pub mod scheduler;

#[cfg(test)]
mod test_utils;

pub use controller::{ScheduleOptions, TaskController};
pub use cron_utils::{next_fire_after, CronTrigger};
pub use registry::{TaskDefinition, TaskRef, TaskRegistry, TaskRegistryBuilder};
pub use retry_service::{backoff_delay, next_attempt, RetryDecision};
pub use scheduler::{cron_instance_key, CycleReport, SchedulerSettings, TaskScheduler};
