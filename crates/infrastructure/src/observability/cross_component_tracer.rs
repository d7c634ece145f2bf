//! Cross-component tracing utilities
//!
//! Trace context crosses two boundaries in the task manager: inbound HTTP
//! requests carry a W3C `traceparent` header, and scheduled instances carry
//! the ids of the span that scheduled them until some node executes them.

use std::collections::HashMap;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use taskman_core::TraceContext;

struct HeaderExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

pub struct CrossComponentTracer;

impl CrossComponentTracer {
    /// 从请求头的 `traceparent` 中读取调用方的追踪上下文
    pub fn extract_trace_context_from_headers(
        headers: &HashMap<String, String>,
    ) -> Option<TraceContext> {
        let context = TraceContextPropagator::new().extract(&HeaderExtractor(headers));
        Self::from_context(&context)
    }

    /// 把追踪上下文写入出站请求头
    ///
    /// 当前span带有效上下文时以它为父，否则使用实例上保存的上下文。
    pub fn inject_trace_context_into_headers(
        fallback: &TraceContext,
        headers: &mut HashMap<String, String>,
    ) {
        let current = tracing::Span::current().context();
        let context = if current.span().span_context().is_valid() {
            current
        } else {
            match Self::remote_context(fallback) {
                Some(context) => context,
                None => return,
            }
        };
        TraceContextPropagator::new().inject_context(&context, &mut HeaderInjector(headers));
    }

    /// 以调用方上下文为远程父的请求span
    pub fn request_span(parent: &TraceContext, method: &str, path: &str) -> tracing::Span {
        let span = tracing::info_span!(
            target: "taskman",
            "http_request",
            http.method = method,
            http.path = path,
            trace_id = parent.trace_id.as_deref().unwrap_or_default(),
        );
        if let Some(context) = Self::remote_context(parent) {
            span.set_parent(context);
        }
        span
    }

    /// 当前span的追踪上下文，没有有效上下文时返回 `None`
    pub fn current() -> Option<TraceContext> {
        Self::from_context(&tracing::Span::current().context())
    }

    /// 读取当前span的追踪上下文
    ///
    /// 当前没有有效的上下文时生成新的trace id，保证每个实例都可追踪。
    pub fn capture_current() -> TraceContext {
        Self::current().unwrap_or_else(Self::new_root)
    }

    fn from_context(context: &opentelemetry::Context) -> Option<TraceContext> {
        let span = context.span();
        let span_context = span.span_context();
        span_context.is_valid().then(|| {
            TraceContext::new(
                span_context.trace_id().to_string(),
                Some(span_context.span_id().to_string()),
            )
        })
    }

    /// 生成新的根追踪上下文
    pub fn new_root() -> TraceContext {
        let trace_id = TraceId::from_bytes(rand::random::<u128>().max(1).to_be_bytes());
        let span_id = SpanId::from_bytes(rand::random::<u64>().max(1).to_be_bytes());
        TraceContext::new(trace_id.to_string(), Some(span_id.to_string()))
    }

    /// 将持久化的追踪上下文还原为远程父上下文
    pub fn remote_context(trace: &TraceContext) -> Option<opentelemetry::Context> {
        let trace_id = TraceId::from_hex(trace.trace_id.as_deref()?).ok()?;
        let span_id = trace
            .span_id
            .as_deref()
            .and_then(|s| SpanId::from_hex(s).ok())
            .unwrap_or_else(|| SpanId::from_bytes(rand::random::<u64>().max(1).to_be_bytes()));

        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        if !span_context.is_valid() {
            return None;
        }

        Some(opentelemetry::Context::new().with_remote_span_context(span_context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_without_active_span_creates_root() {
        let trace = CrossComponentTracer::capture_current();
        let trace_id = trace.trace_id.as_deref().unwrap();
        assert_eq!(trace_id.len(), 32);
        assert_eq!(trace.span_id.as_deref().unwrap().len(), 16);
        assert_ne!(trace_id, "00000000000000000000000000000000");
    }

    #[test]
    fn test_remote_context_round_trip() {
        let trace = TraceContext::new(
            "4bf92f3577b34da6a3ce929d0e0e4736",
            Some("00f067aa0ba902b7".to_string()),
        );
        let context = CrossComponentTracer::remote_context(&trace).unwrap();
        let span = context.span();
        let span_context = span.span_context();
        assert!(span_context.is_remote());
        assert_eq!(
            span_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(span_context.span_id().to_string(), "00f067aa0ba902b7");
    }

    #[test]
    fn test_remote_context_rejects_garbage() {
        assert!(CrossComponentTracer::remote_context(&TraceContext::default()).is_none());
        let bad = TraceContext::new("not-hex", None);
        assert!(CrossComponentTracer::remote_context(&bad).is_none());
    }

    #[test]
    fn test_extract_traceparent_header() {
        let mut headers = HashMap::new();
        headers.insert(
            "TraceParent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        let trace = CrossComponentTracer::extract_trace_context_from_headers(&headers).unwrap();
        assert_eq!(trace.trace_id.as_deref(), Some("4bf92f3577b34da6a3ce929d0e0e4736"));
        assert_eq!(trace.span_id.as_deref(), Some("00f067aa0ba902b7"));

        headers.insert("traceparent".to_string(), "garbage".to_string());
        headers.remove("TraceParent");
        assert!(CrossComponentTracer::extract_trace_context_from_headers(&headers).is_none());
        assert!(CrossComponentTracer::extract_trace_context_from_headers(&HashMap::new()).is_none());
    }

    #[test]
    fn test_inject_uses_stored_context_outside_spans() {
        let trace = TraceContext::new(
            "4bf92f3577b34da6a3ce929d0e0e4736",
            Some("00f067aa0ba902b7".to_string()),
        );
        let mut headers = HashMap::new();
        CrossComponentTracer::inject_trace_context_into_headers(&trace, &mut headers);
        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );

        let mut empty = HashMap::new();
        CrossComponentTracer::inject_trace_context_into_headers(&TraceContext::default(), &mut empty);
        assert!(empty.is_empty());
    }
}
