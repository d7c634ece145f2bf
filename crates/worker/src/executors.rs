use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use taskman_core::{HandlerError, SchedulerError, SchedulerResult, TaskContext, TaskHandler};
use taskman_infrastructure::CrossComponentTracer;

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    /// 要执行的命令
    pub command: String,
    /// 命令参数
    #[serde(default)]
    pub args: Vec<String>,
    /// 工作目录
    pub working_dir: Option<String>,
    /// 环境变量
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    /// 请求URL
    pub url: String,
    /// HTTP方法
    #[serde(default = "default_method")]
    pub method: String,
    /// 请求头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 固定请求体，未设置时发送实例负载
    pub body: Option<Value>,
    /// 超时时间（秒）
    pub timeout_seconds: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Shell任务处理器
///
/// 负载中的 `args` 数组追加到配置的参数之后。非零退出码可重试，
/// 命令无法启动不可重试；取消或超时时子进程随future一起被终止。
pub struct ShellHandler {
    params: ShellTaskParams,
}

impl ShellHandler {
    pub fn new(params: ShellTaskParams) -> Self {
        Self { params }
    }

    fn build_command(&self, payload: &Value) -> Command {
        let mut cmd = Command::new(&self.params.command);
        cmd.args(&self.params.args);
        if let Some(extra) = payload.get("args").and_then(Value::as_array) {
            cmd.args(extra.iter().filter_map(Value::as_str));
        }
        if let Some(dir) = &self.params.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.params.env_vars);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        info!(
            "执行Shell任务: instance_id={}, command={}, args={:?}",
            ctx.instance_id, self.params.command, self.params.args
        );

        let child = self
            .build_command(&ctx.payload)
            .spawn()
            .map_err(|e| HandlerError::fatal(format!("启动Shell命令失败: {e}")))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| HandlerError::retryable(format!("等待进程结束失败: {e}")))?
            }
            _ = ctx.cancellation.cancelled() => {
                warn!("Shell任务被取消，终止子进程: instance_id={}", ctx.instance_id);
                return Err(HandlerError::interrupted("任务已取消"));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code();

        info!(
            "Shell任务执行完成: instance_id={}, success={}, exit_code={:?}",
            ctx.instance_id,
            output.status.success(),
            exit_code
        );

        if output.status.success() {
            Ok(json!({
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }))
        } else if stderr.is_empty() {
            Err(HandlerError::retryable(format!(
                "命令执行失败，退出码: {exit_code:?}"
            )))
        } else {
            Err(HandlerError::retryable(format!(
                "命令执行失败，退出码: {exit_code:?}: {stderr}"
            )))
        }
    }
}

/// HTTP任务处理器
pub struct HttpHandler {
    client: reqwest::Client,
    params: HttpTaskParams,
}

impl HttpHandler {
    pub fn new(params: HttpTaskParams) -> SchedulerResult<Self> {
        reqwest::Method::from_bytes(params.method.to_uppercase().as_bytes()).map_err(|_| {
            SchedulerError::Configuration(format!("不支持的HTTP方法: {}", params.method))
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            params,
        })
    }

    /// 5xx可重试，其余非2xx状态不可重试
    pub fn classify_status(status: StatusCode) -> Option<HandlerError> {
        if status.is_success() {
            None
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Some(HandlerError::retryable(format!("HTTP请求失败，状态码: {status}")))
        } else {
            Some(HandlerError::fatal(format!("HTTP请求失败，状态码: {status}")))
        }
    }

    fn build_request(&self, ctx: &TaskContext) -> Result<reqwest::RequestBuilder, HandlerError> {
        let method = reqwest::Method::from_bytes(self.params.method.to_uppercase().as_bytes())
            .map_err(|_| HandlerError::fatal(format!("不支持的HTTP方法: {}", self.params.method)))?;

        let mut request = self.client.request(method, &self.params.url);
        if let Some(timeout) = self.params.timeout_seconds {
            request = request.timeout(Duration::from_secs(timeout));
        }
        for (key, value) in &self.params.headers {
            request = request.header(key, value);
        }

        // 下游服务沿用实例的追踪上下文
        let mut trace_headers = HashMap::new();
        CrossComponentTracer::inject_trace_context_into_headers(&ctx.trace, &mut trace_headers);
        for (key, value) in trace_headers {
            request = request.header(key, value);
        }

        match (&self.params.body, &ctx.payload) {
            (Some(body), _) => request = request.json(body),
            (None, Value::Null) => {}
            (None, payload) => request = request.json(payload),
        }
        Ok(request)
    }
}

#[async_trait]
impl TaskHandler for HttpHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<Value, HandlerError> {
        info!(
            "执行HTTP任务: instance_id={}, method={}, url={}",
            ctx.instance_id, self.params.method, self.params.url
        );

        let request = self.build_request(&ctx)?;
        let response = tokio::select! {
            response = request.send() => {
                response.map_err(|e| HandlerError::retryable(format!("HTTP请求失败: {e}")))?
            }
            _ = ctx.cancellation.cancelled() => {
                return Err(HandlerError::interrupted("任务已取消"));
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("读取响应体失败: {e}"));

        info!(
            "HTTP任务执行完成: instance_id={}, status={}",
            ctx.instance_id, status
        );

        if let Some(error) = Self::classify_status(status) {
            return Err(error);
        }

        let body = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
        Ok(json!({
            "status": status.as_u16(),
            "body": body,
        }))
    }
}

/// 根据配置中的处理器类型创建处理器
pub fn build_handler(kind: &str, params: &Value) -> SchedulerResult<Arc<dyn TaskHandler>> {
    match kind {
        "shell" => {
            let params: ShellTaskParams = serde_json::from_value(params.clone()).map_err(|e| {
                SchedulerError::Configuration(format!("解析Shell任务参数失败: {e}"))
            })?;
            Ok(Arc::new(ShellHandler::new(params)))
        }
        "http" => {
            let params: HttpTaskParams = serde_json::from_value(params.clone()).map_err(|e| {
                SchedulerError::Configuration(format!("解析HTTP任务参数失败: {e}"))
            })?;
            Ok(Arc::new(HttpHandler::new(params)?))
        }
        other => Err(SchedulerError::Configuration(format!(
            "未知的处理器类型: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskman_core::TraceContext;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context(payload: Value) -> TaskContext {
        TaskContext {
            instance_id: Uuid::new_v4(),
            task_name: "builtin".to_string(),
            payload,
            attempt: 1,
            fire_time: None,
            trace: TraceContext::default(),
            cancellation: CancellationToken::new(),
        }
    }

    fn shell(command: &str, args: &[&str]) -> ShellHandler {
        ShellHandler::new(ShellTaskParams {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            env_vars: HashMap::new(),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_success_captures_output() {
        let handler = shell("echo", &["hello"]);
        let result = handler
            .handle(context(json!({"args": ["world"]})))
            .await
            .unwrap();
        assert_eq!(result["stdout"], "hello world");
        assert_eq!(result["exit_code"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_nonzero_exit_is_retryable() {
        let handler = shell("sh", &["-c", "echo oops >&2; exit 3"]);
        let err = handler.handle(context(Value::Null)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message().contains("oops"));
    }

    #[tokio::test]
    async fn test_shell_missing_command_is_fatal() {
        let handler = shell("definitely-not-a-real-command-xyz", &[]);
        let err = handler.handle(context(Value::Null)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_cancellation_kills_process() {
        let handler = shell("sleep", &["30"]);
        let ctx = context(Value::Null);
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let err = handler.handle(ctx).await.unwrap_err();
        assert!(err.is_interrupted());
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_http_status_classification() {
        assert!(HttpHandler::classify_status(StatusCode::OK).is_none());
        assert!(HttpHandler::classify_status(StatusCode::BAD_GATEWAY)
            .unwrap()
            .is_retryable());
        assert!(HttpHandler::classify_status(StatusCode::TOO_MANY_REQUESTS)
            .unwrap()
            .is_retryable());
        assert!(!HttpHandler::classify_status(StatusCode::NOT_FOUND)
            .unwrap()
            .is_retryable());
    }

    #[tokio::test]
    async fn test_http_connection_refused_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handler = HttpHandler::new(HttpTaskParams {
            url: format!("http://127.0.0.1:{port}/hook"),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout_seconds: Some(2),
        })
        .unwrap();
        let err = handler.handle(context(json!({"n": 1}))).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_http_request_carries_traceparent() {
        let handler = HttpHandler::new(HttpTaskParams {
            url: "http://localhost/hook".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout_seconds: None,
        })
        .unwrap();
        let mut ctx = context(json!({"n": 1}));
        ctx.trace = TraceContext::new(
            "4bf92f3577b34da6a3ce929d0e0e4736",
            Some("00f067aa0ba902b7".to_string()),
        );

        let request = handler.build_request(&ctx).unwrap().build().unwrap();
        assert_eq!(
            request.headers()["traceparent"],
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );

        let request = handler
            .build_request(&context(Value::Null))
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get("traceparent").is_none());
    }

    #[test]
    fn test_build_handler_from_config() {
        assert!(build_handler("shell", &json!({"command": "echo"})).is_ok());
        assert!(build_handler("http", &json!({"url": "http://localhost/x"})).is_ok());
        assert!(matches!(
            build_handler("http", &json!({"url": "http://x", "method": "NOT A METHOD"})),
            Err(SchedulerError::Configuration(_))
        ));
        assert!(matches!(
            build_handler("shell", &json!({})),
            Err(SchedulerError::Configuration(_))
        ));
        assert!(matches!(
            build_handler("ftp", &Value::Null),
            Err(SchedulerError::Configuration(_))
        ));
    }
}
