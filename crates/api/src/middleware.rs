use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn, Instrument};

use taskman_core::TraceContext;
use taskman_infrastructure::CrossComponentTracer;

use crate::error::ApiError;

/// 请求携带的调用方追踪上下文，没有或无法解析 `traceparent` 时为空
#[derive(Debug, Clone, Default)]
pub struct RequestTrace(pub Option<TraceContext>);

/// 读取入站 `traceparent`，让请求span以调用方为父，并交给处理函数
pub async fn propagate_trace_context(mut request: Request, next: Next) -> Response {
    let headers: HashMap<String, String> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    let parent = CrossComponentTracer::extract_trace_context_from_headers(&headers);
    request.extensions_mut().insert(RequestTrace(parent.clone()));

    match parent {
        Some(parent) => {
            let span = CrossComponentTracer::request_span(
                &parent,
                request.method().as_str(),
                request.uri().path(),
            );
            next.run(request).instrument(span).await
        }
        None => next.run(request).await,
    }
}

pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    info!(
        "完成请求处理: {} {} - 状态: {} - 耗时: {:?}",
        method,
        uri,
        response.status(),
        start.elapsed()
    );

    response
}

/// 超过时限的请求返回 408
pub async fn request_timeout(
    State(limit): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let uri = request.uri().clone();
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!("请求处理超时: {}", uri);
            ApiError::Timeout.into_response()
        }
    }
}

pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

pub fn trace_layer(
) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>
{
    TraceLayer::new_for_http()
}
