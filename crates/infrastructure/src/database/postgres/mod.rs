pub mod postgres_task_store;

pub use postgres_task_store::PostgresTaskStore;
