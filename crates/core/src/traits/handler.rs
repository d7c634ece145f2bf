use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::TraceContext;

/// 业务处理失败
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// 按重试策略重新调度
    #[error("可重试错误: {0}")]
    Retryable(String),
    /// 立即进入终态失败
    #[error("不可重试错误: {0}")]
    Fatal(String),
    /// 处理器响应取消令牌提前返回，未完成业务处理
    ///
    /// 停机期间出现时实例被归还，不消耗尝试次数；其他情况下按可重试错误处理。
    #[error("执行被中断: {0}")]
    Interrupted(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        HandlerError::Interrupted(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_) | HandlerError::Interrupted(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, HandlerError::Interrupted(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(m) | HandlerError::Fatal(m) | HandlerError::Interrupted(m) => m,
        }
    }
}

/// 传给处理器的执行上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub instance_id: Uuid,
    pub task_name: String,
    pub payload: serde_json::Value,
    /// 当前尝试序号，从1开始
    pub attempt: u32,
    /// 周期任务实例对应的触发时间
    pub fire_time: Option<DateTime<Utc>>,
    pub trace: TraceContext,
    /// 在超时、租约丢失、取消或停机时触发
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 可取消的等待，被取消时返回 `false`
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancellation.cancelled() => false,
        }
    }
}

/// 业务处理器
///
/// 在崩溃场景下同一负载可能被执行多次，实现方需要保证重复执行是安全的。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, HandlerError> {
        (self.0)(ctx).await
    }
}

/// 将异步闭包包装为处理器
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TaskContext {
        TaskContext {
            instance_id: Uuid::new_v4(),
            task_name: "echo".to_string(),
            payload: serde_json::json!({"n": 1}),
            attempt: 1,
            fire_time: None,
            trace: TraceContext::default(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_handler_fn_passes_payload() {
        let handler = handler_fn(|ctx: TaskContext| async move { Ok(ctx.payload) });
        let result = handler.handle(context()).await.unwrap();
        assert_eq!(result, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_context_sleep_observes_cancellation() {
        let ctx = context();
        ctx.cancellation.cancel();
        assert!(!ctx.sleep(Duration::from_secs(60)).await);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_handler_error_kinds() {
        assert!(HandlerError::retryable("smtp down").is_retryable());
        assert!(!HandlerError::fatal("bad address").is_retryable());
        assert_eq!(HandlerError::fatal("bad address").message(), "bad address");

        let interrupted = HandlerError::interrupted("stopped");
        assert!(interrupted.is_interrupted());
        assert!(interrupted.is_retryable());
        assert!(!HandlerError::retryable("x").is_interrupted());
    }
}
