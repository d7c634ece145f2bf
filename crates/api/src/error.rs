use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use taskman_core::SchedulerError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("请求超时")]
    Timeout,

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Scheduler(SchedulerError::UnknownTask { .. }) => {
                (StatusCode::NOT_FOUND, "UNKNOWN_TASK")
            }
            ApiError::Scheduler(SchedulerError::InstanceNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "INSTANCE_NOT_FOUND")
            }
            ApiError::Scheduler(SchedulerError::Configuration(_))
            | ApiError::Scheduler(SchedulerError::InvalidCronExpression { .. })
            | ApiError::Scheduler(SchedulerError::Serialization(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            ApiError::Scheduler(e) if e.is_transient() => {
                (StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE")
            }
            ApiError::Scheduler(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Timeout => (StatusCode::REQUEST_TIMEOUT, "TIMEOUT"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.classify();
        let message = match (&self, status) {
            (_, StatusCode::INTERNAL_SERVER_ERROR) => {
                tracing::error!("请求处理失败: {}", self);
                "系统内部错误".to_string()
            }
            (ApiError::Scheduler(e), _) => e.to_string(),
            _ => self.to_string(),
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_not_found_mapping() {
        let unknown = ApiError::from(SchedulerError::UnknownTask {
            name: "send_email".into(),
        });
        assert_eq!(unknown.into_response().status(), StatusCode::NOT_FOUND);

        let missing = ApiError::from(SchedulerError::InstanceNotFound { id: Uuid::new_v4() });
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_mapping() {
        let invalid = ApiError::from(SchedulerError::Configuration("max_attempts必须大于0".into()));
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_backend_errors() {
        let down = ApiError::from(SchedulerError::StoreUnavailable("pool closed".into()));
        assert_eq!(down.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let internal = ApiError::from(SchedulerError::Internal("boom".into()));
        assert_eq!(internal.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
