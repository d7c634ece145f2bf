//! # Taskman API
//!
//! 任务管理器的HTTP接口，基于Axum构建。
//!
//! ## API 端点
//!
//! - `GET /health` - 健康检查
//! - `GET /api/tasks` - 已注册的任务
//! - `POST /api/tasks/{name}/schedule` - 调度任务实例
//! - `GET /api/instances?reference=..` - 按外部引用查询实例
//! - `GET /api/instances/{id}` - 实例状态
//! - `DELETE /api/instances/{id}` - 取消实例
//! - `GET /api/instances/{id}/attempts` - 尝试历史
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use taskman_api::create_app;
//!
//! let app = create_app(controller, &config.api);
//! let listener = tokio::net::TcpListener::bind(&config.api.bind_address).await?;
//! axum::serve(listener, app).await?;
//! ```
//!
//! ## 响应格式
//!
//! 成功响应：
//! ```json
//! { "success": true, "data": { "id": "..." }, "message": null, "timestamp": "..." }
//! ```
//!
//! 错误响应中 `UnknownTask`、`InstanceNotFound` 返回404，参数问题返回400：
//! ```json
//! { "success": false, "error": { "message": "...", "type": "UNKNOWN_TASK", "code": 404, "timestamp": "..." } }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, request_timeout, trace_layer};
use routes::{create_routes, AppState};
use taskman_core::config::ApiConfig;
use taskman_dispatcher::TaskController;

/// 创建完整的API应用
pub fn create_app(controller: Arc<TaskController>, api_config: &ApiConfig) -> Router {
    let state = AppState { controller };
    let timeout = Duration::from_secs(api_config.request_timeout_seconds);

    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging))
            .layer(axum::middleware::from_fn_with_state(timeout, request_timeout)),
    );

    if api_config.cors_enabled {
        router.layer(cors_layer(&api_config.cors_origins))
    } else {
        router
    }
}
