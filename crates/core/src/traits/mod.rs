pub mod handler;
pub mod lock;
pub mod store;

pub use handler::{handler_fn, HandlerError, TaskContext, TaskHandler};
pub use lock::{LeaseToken, LockProvider};
pub use store::TaskStore;
