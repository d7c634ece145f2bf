use anyhow::{Context, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskman_core::config::{LogFormat, ObservabilityConfig};

/// 持有追踪导出器，进程退出前调用 [`TelemetryGuard::shutdown`] 刷新剩余数据
#[derive(Default)]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                warn!("关闭追踪导出器失败: {e}");
            }
        }
        info!("OpenTelemetry observability shutdown completed");
    }
}

fn build_tracer_provider(config: &ObservabilityConfig, endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .context("创建OTLP导出器失败")?;

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
        .build();

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build())
}

/// 初始化日志与分布式追踪
///
/// `RUST_LOG` 优先于配置中的日志级别；配置了 `otlp_endpoint` 时追加 OpenTelemetry 层。
/// 无论是否导出，都会安装 W3C trace-context 传播器。
pub fn init_observability(config: &ObservabilityConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let provider = match (&config.otlp_endpoint, config.tracing_enabled) {
        (Some(endpoint), true) => Some(build_tracer_provider(config, endpoint)?),
        _ => None,
    };
    let otel_layer = provider.as_ref().map(|provider| {
        global::set_tracer_provider(provider.clone());
        tracing_opentelemetry::layer().with_tracer(provider.tracer("taskman"))
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer);

    let init_result = match config.log_format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_span_events(FmtSpan::CLOSE);

            registry.with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(true)
                .with_line_number(true);

            registry.with(fmt_layer).try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer().compact();

            registry.with(fmt_layer).try_init()
        }
    };
    init_result.context("安装日志订阅器失败")?;

    info!(
        logging.format = ?config.log_format,
        logging.level = %config.log_level,
        otlp = config.otlp_endpoint.is_some() && config.tracing_enabled,
        "Logging and tracing initialized"
    );

    Ok(TelemetryGuard { provider })
}

/// 启动 Prometheus 指标端点
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let addr: std::net::SocketAddr = config
        .metrics_bind_address
        .parse()
        .context("无效的指标监听地址")?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}
