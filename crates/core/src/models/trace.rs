use serde::{Deserialize, Serialize};

/// 分布式追踪上下文
///
/// 在调度调用处捕获，随实例持久化，执行时作为远程父上下文恢复。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>, span_id: Option<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            span_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none()
    }
}
