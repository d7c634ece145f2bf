use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};

use taskman::app::{build_registry, resolve_node_id, AppMode, Application};
use taskman_core::config::{AppConfig, LogFormat};
use taskman_infrastructure::{init_metrics, init_observability};

#[derive(Debug, Parser)]
#[command(name = "taskman", version, about = "分布式任务管理器")]
struct Cli {
    /// 配置文件路径，未指定时依次查找 config/taskman.toml、taskman.toml、/etc/taskman/config.toml
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// 运行模式
    #[arg(short, long, value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// 节点标识，覆盖配置中的 scheduler.node_id
    #[arg(long, value_name = "ID")]
    node_id: Option<String>,

    /// 日志级别，覆盖配置中的 observability.log_level
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// 日志格式: pretty | json | compact
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Scheduler,
    Api,
    All,
}

impl From<Mode> for AppMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Scheduler => AppMode::Scheduler,
            Mode::Api => AppMode::Api,
            Mode::All => AppMode::All,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 校验配置文件和任务声明后退出
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.observability.log_format = format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    if let Some(Command::CheckConfig) = cli.command {
        return check_config(&config);
    }

    let telemetry = init_observability(&config.observability)?;
    if config.observability.metrics_enabled {
        init_metrics(&config.observability)?;
    }

    let node_id = resolve_node_id(cli.node_id.clone(), &config.scheduler);
    let mode = AppMode::from(cli.mode);
    info!("启动分布式任务管理器");
    info!("运行模式: {:?}", mode);
    info!("节点标识: {}", node_id);

    let grace = config.worker.shutdown_grace();
    let app = Arc::new(Application::new(config, mode, node_id).await?);

    let app_handle = {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run().await {
                error!("应用运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    app.shutdown();

    // 执行池自身在宽限期后放弃剩余执行，这里再留出少量余量
    match tokio::time::timeout(grace + Duration::from_secs(5), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    telemetry.shutdown();
    info!("分布式任务管理器已退出");
    Ok(())
}

fn check_config(config: &AppConfig) -> Result<()> {
    let registry = build_registry(config)?;
    println!("配置有效");
    println!("  存储后端: {:?}", config.database.backend);
    println!("  锁服务: {:?}", config.lock.backend);
    println!("  API地址: {}", config.api.bind_address);
    println!("  任务: {}", registry.names().join(", "));
    for definition in registry.cron_definitions() {
        if let Some(trigger) = definition.cron() {
            let upcoming: Vec<String> = trigger
                .upcoming_times(chrono::Utc::now(), 3)
                .iter()
                .map(|t| t.to_rfc3339())
                .collect();
            println!(
                "  周期任务 {}: {}，接下来: {}",
                definition.name,
                trigger.expression(),
                upcoming.join(", ")
            );
        }
    }
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
