use tracing_opentelemetry::OpenTelemetrySpanExt;

use taskman_core::TaskInstance;

use super::CrossComponentTracer;

pub struct TaskTracer;

impl TaskTracer {
    pub fn schedule_task_span(task_name: &str) -> tracing::Span {
        let span = tracing::info_span!(
            "schedule_task",
            task.name = task_name,
            otel.kind = "internal"
        );
        span.set_attribute("taskman.task.name", task_name.to_string());

        span
    }

    /// 执行span，以实例中保存的调度方上下文作为远程父级
    pub fn execute_task_span(instance: &TaskInstance, node_id: &str) -> tracing::Span {
        let span = tracing::info_span!(
            "execute_task",
            instance.id = %instance.id,
            task.name = %instance.task_name,
            attempt = instance.attempt_count,
            node.id = node_id,
            trace_id = instance.trace_id.as_deref().unwrap_or_default(),
            otel.kind = "internal"
        );

        if let Some(parent) = CrossComponentTracer::remote_context(&instance.trace()) {
            span.set_parent(parent);
        }

        span.set_attribute("taskman.instance.id", instance.id.to_string());
        span.set_attribute("taskman.task.name", instance.task_name.clone());
        span.set_attribute("taskman.attempt", i64::from(instance.attempt_count));
        span.set_attribute("taskman.node.id", node_id.to_string());

        span
    }

    pub fn poll_cycle_span(node_id: &str) -> tracing::Span {
        tracing::debug_span!("poll_cycle", node.id = node_id, otel.kind = "internal")
    }

    pub fn record_error(error: &dyn std::error::Error) {
        let span = tracing::Span::current();
        span.set_attribute("error", true);
        span.set_attribute("error.message", error.to_string());
    }
}
