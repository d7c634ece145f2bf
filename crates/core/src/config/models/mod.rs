pub mod api_observability;
pub mod app_config;
pub mod database;
pub mod lock;
pub mod scheduler_worker;
pub mod tasks;

pub use api_observability::{ApiConfig, LogFormat, ObservabilityConfig};
pub use app_config::AppConfig;
pub use database::{DatabaseConfig, StoreBackend};
pub use lock::{LockBackend, LockConfig};
pub use scheduler_worker::{SchedulerConfig, WorkerConfig};
pub use tasks::TaskConfig;
