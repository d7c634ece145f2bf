use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use taskman_core::RetryPolicy;
use taskman_dispatcher::ScheduleOptions;

use crate::{
    error::{ApiError, ApiResult},
    middleware::RequestTrace,
    response::{created, success, ApiResponse},
    routes::AppState,
};

/// 调度请求
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub payload: serde_json::Value,
    pub eta: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub reference: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout_seconds: Option<u64>,
}

impl ScheduleRequest {
    fn into_options(self) -> ApiResult<(serde_json::Value, ScheduleOptions)> {
        if self.timeout_seconds == Some(0) {
            return Err(ApiError::BadRequest("timeout_seconds必须大于0".to_string()));
        }
        if matches!(&self.idempotency_key, Some(key) if key.trim().is_empty()) {
            return Err(ApiError::BadRequest("idempotency_key不能为空".to_string()));
        }

        let options = ScheduleOptions {
            eta: self.eta,
            idempotency_key: self.idempotency_key,
            reference: self.reference,
            retry_policy: self.retry_policy,
            timeout: self.timeout_seconds.map(Duration::from_secs),
            trace: None,
        };
        Ok((self.payload, options))
    }
}

#[derive(Debug, Serialize)]
pub struct ScheduledResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// 实例查询参数
#[derive(Debug, Deserialize)]
pub struct InstanceQueryParams {
    pub reference: Option<String>,
}

/// 已注册的任务名称
pub async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    success(state.controller.registry().names())
}

/// 调度任务实例
pub async fn schedule_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(RequestTrace(trace)): Extension<RequestTrace>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let (payload, mut options) = request.into_options()?;
    options.trace = trace;
    let id = state.controller.schedule(&name, payload, options).await?;
    Ok(created(ScheduledResponse { id }))
}

/// 获取实例状态
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.status(id).await?))
}

/// 取消实例
pub async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state.controller.cancel(id).await?;
    let message = if cancelled {
        "实例已取消"
    } else {
        "实例已处于终态，未做修改"
    };
    Ok(ApiResponse::success_with_message(CancelResponse { cancelled }, message))
}

/// 获取实例的尝试历史
pub async fn get_instance_attempts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.attempts(id).await?))
}

/// 按外部引用查询实例
pub async fn list_instances(
    State(state): State<AppState>,
    Query(params): Query<InstanceQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let reference = params
        .reference
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::BadRequest("缺少reference查询参数".to_string()))?;
    Ok(success(state.controller.find_by_reference(&reference).await?))
}
