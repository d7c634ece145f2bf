pub mod models;

pub use models::{
    ApiConfig, AppConfig, DatabaseConfig, LockBackend, LockConfig, LogFormat, ObservabilityConfig,
    SchedulerConfig, StoreBackend, TaskConfig, WorkerConfig,
};
