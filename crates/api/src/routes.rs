use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use taskman_dispatcher::TaskController;

use crate::middleware::propagate_trace_context;
use crate::handlers::{
    health::health_check,
    instances::{
        cancel_instance, get_instance, get_instance_attempts, list_instances, list_tasks,
        schedule_task,
    },
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TaskController>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{name}/schedule", post(schedule_task))
        .route("/api/instances", get(list_instances))
        .route(
            "/api/instances/{id}",
            get(get_instance).delete(cancel_instance),
        )
        .route("/api/instances/{id}/attempts", get(get_instance_attempts))
        .layer(axum::middleware::from_fn(propagate_trace_context))
        .with_state(state)
}
