use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{debug, error, info};

use taskman_api::create_app;
use taskman_core::config::{AppConfig, SchedulerConfig};
use taskman_core::{Clock, SystemClock};
use taskman_dispatcher::{
    SchedulerSettings, TaskController, TaskDefinition, TaskRegistry, TaskScheduler,
};
use taskman_infrastructure::{BackendFactory, MetricsCollector};
use taskman_worker::{build_handler, WorkerPool};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行调度循环和执行池
    Scheduler,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    fn runs_scheduler(self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    fn runs_api(self) -> bool {
        matches!(self, AppMode::Api | AppMode::All)
    }
}

/// 主应用程序
///
/// 停机信号由应用自身持有：`run` 启动时为每个组件订阅一次，
/// `shutdown` 只生效一次。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    scheduler: Arc<TaskScheduler>,
    controller: Arc<TaskController>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig, mode: AppMode, node_id: String) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}，节点: {}", mode, node_id);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backends = BackendFactory::create(&config.database, &config.lock, clock.clone())
            .await
            .context("初始化存储和锁服务失败")?;

        let registry = Arc::new(build_registry(&config)?);
        info!("已注册 {} 个任务: {:?}", registry.len(), registry.names());

        let metrics = Arc::new(MetricsCollector::new());
        let pool = Arc::new(WorkerPool::with_metrics(
            config.worker.max_in_flight,
            metrics.clone(),
        ));

        let settings = SchedulerSettings::from_config(node_id, &config.scheduler, &config.worker);
        let scheduler = Arc::new(
            TaskScheduler::new(
                backends.store.clone(),
                backends.lock,
                registry.clone(),
                pool.clone(),
                settings,
            )
            .with_clock(clock.clone())
            .with_metrics(metrics.clone()),
        );

        let mut controller = TaskController::new(backends.store, registry)
            .with_clock(clock)
            .with_metrics(metrics);
        if mode.runs_scheduler() {
            controller = controller.with_pool(pool);
        }

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config,
            mode,
            scheduler,
            controller: Arc::new(controller),
            shutdown_tx,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn controller(&self) -> &Arc<TaskController> {
        &self.controller
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// 通知所有组件停机，重复调用无效果
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("停机信号已经发送过");
            return;
        }
        info!("通知 {} 个组件停机", self.shutdown_tx.receiver_count());
        // 组件尚未启动时没有订阅者
        let _ = self.shutdown_tx.send(());
    }

    /// 运行应用程序直到 `shutdown` 被调用
    pub async fn run(&self) -> Result<()> {
        let run_scheduler = self.mode.runs_scheduler() && self.config.scheduler.enabled;
        let run_api = self.mode.runs_api() && self.config.api.enabled;
        if !run_scheduler && !run_api {
            return Err(anyhow::anyhow!("当前模式下没有启用任何组件，请检查配置"));
        }

        // 先订阅再检查标志，停机信号不会在两者之间丢失
        let scheduler_rx = self.shutdown_tx.subscribe();
        let api_rx = self.shutdown_tx.subscribe();
        if self.is_stopping() {
            info!("应用已在停机，不再启动组件");
            return Ok(());
        }
        info!("启动应用程序，模式: {:?}", self.mode);

        let mut handles = Vec::new();

        if run_scheduler {
            let scheduler = Arc::clone(&self.scheduler);
            let shutdown_rx = scheduler_rx;
            handles.push(tokio::spawn(async move {
                scheduler.run(shutdown_rx).await;
            }));
        }

        if run_api {
            let listener = TcpListener::bind(&self.config.api.bind_address)
                .await
                .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
            let app = create_app(Arc::clone(&self.controller), &self.config.api);
            let mut shutdown_rx = api_rx;

            info!("API服务器启动在 http://{}", self.config.api.bind_address);
            handles.push(tokio::spawn(async move {
                let server = axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.recv().await;
                    });
                if let Err(e) = server.await {
                    error!("API服务器运行失败: {}", e);
                }
                info!("API服务器已停止");
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("组件异常退出: {}", e);
            }
        }

        info!("所有组件已停止");
        Ok(())
    }
}

/// 根据配置中声明的任务构建注册表
pub fn build_registry(config: &AppConfig) -> Result<TaskRegistry> {
    let mut builder = TaskRegistry::builder().with_defaults(
        config.scheduler.default_retry.clone(),
        config.scheduler.default_timeout(),
    );

    for task in &config.tasks {
        let handler = build_handler(&task.handler, &task.params)
            .with_context(|| format!("创建任务 {} 的处理器失败", task.name))?;

        let mut definition = TaskDefinition::new(task.name.clone(), handler)
            .with_catch_up(task.catch_up)
            .with_default_payload(task.payload.clone());
        if let Some(expr) = &task.cron {
            definition = definition.with_cron(expr)?;
        }
        if let Some(retry) = &task.retry {
            definition = definition.with_retry_policy(retry.clone());
        }
        if let Some(seconds) = task.timeout_seconds {
            definition = definition.with_timeout(Duration::from_secs(seconds));
        }
        if let Some(limit) = task.max_concurrency {
            definition = definition.with_max_concurrency(limit);
        }

        builder.register(definition)?;
    }

    Ok(builder.build())
}

/// 节点标识：命令行参数优先，其次是配置，最后使用 主机名-随机后缀
pub fn resolve_node_id(cli: Option<String>, config: &SchedulerConfig) -> String {
    if let Some(id) = cli.or_else(|| config.node_id.clone()) {
        return id;
    }

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "taskman".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskman_core::config::{StoreBackend, TaskConfig};

    #[test]
    fn test_build_registry_from_config() {
        let config = AppConfig::from_toml(
            r#"
            [scheduler]
            default_timeout_seconds = 120

            [[tasks]]
            name = "nightly_report"
            handler = "shell"
            cron = "0 2 * * *"
            params = { command = "echo", args = ["report"] }

            [[tasks]]
            name = "ping"
            handler = "http"
            timeout_seconds = 5
            max_concurrency = 2
            params = { url = "http://localhost:9000/ping" }
            "#,
        )
        .unwrap();

        let registry = build_registry(&config).unwrap();
        assert_eq!(registry.names(), vec!["nightly_report", "ping"]);

        let report = registry.resolve("nightly_report").unwrap();
        assert!(report.cron().is_some());
        assert_eq!(report.timeout(), Duration::from_secs(120));

        let ping = registry.resolve("ping").unwrap();
        assert_eq!(ping.timeout(), Duration::from_secs(5));
        assert_eq!(ping.max_concurrency, Some(2));
        assert_eq!(registry.cron_definitions().len(), 1);
    }

    #[test]
    fn test_build_registry_rejects_bad_cron() {
        let mut config = AppConfig::default();
        config.tasks.push(TaskConfig {
            name: "broken".into(),
            handler: "shell".into(),
            cron: Some("every day".into()),
            catch_up: false,
            timeout_seconds: None,
            max_concurrency: None,
            retry: None,
            params: serde_json::json!({"command": "true"}),
            payload: serde_json::Value::Null,
        });
        assert!(build_registry(&config).is_err());
    }

    #[test]
    fn test_resolve_node_id_precedence() {
        let mut scheduler = SchedulerConfig::default();
        assert_eq!(resolve_node_id(Some("cli".into()), &scheduler), "cli");

        scheduler.node_id = Some("from-config".into());
        assert_eq!(resolve_node_id(None, &scheduler), "from-config");

        scheduler.node_id = None;
        let generated = resolve_node_id(None, &scheduler);
        assert!(generated.len() > 9);
        assert_ne!(generated, resolve_node_id(None, &scheduler));
    }

    #[tokio::test]
    async fn test_application_with_memory_backends() {
        let mut config = AppConfig::default();
        config.database.backend = StoreBackend::Memory;
        config.tasks.push(TaskConfig {
            name: "echo".into(),
            handler: "shell".into(),
            cron: None,
            catch_up: false,
            timeout_seconds: Some(5),
            max_concurrency: None,
            retry: None,
            params: serde_json::json!({"command": "echo", "args": ["hi"]}),
            payload: serde_json::Value::Null,
        });

        let app = Application::new(config, AppMode::All, "node-test".into())
            .await
            .unwrap();
        let id = app
            .controller()
            .schedule("echo", serde_json::Value::Null, Default::default())
            .await
            .unwrap();

        let report = app.scheduler().run_cycle().await.unwrap();
        assert_eq!(report.dispatched, 1);
        app.scheduler().pool().wait_idle().await;

        let snapshot = app.controller().status(id).await.unwrap();
        assert_eq!(snapshot.status, taskman_core::InstanceStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_returns_immediately() {
        let mut config = AppConfig::default();
        config.database.backend = StoreBackend::Memory;
        config.api.enabled = false;

        let app = Application::new(config, AppMode::All, "node-test".into())
            .await
            .unwrap();
        app.shutdown();
        app.shutdown();
        assert!(app.is_stopping());

        tokio::time::timeout(Duration::from_secs(5), app.run())
            .await
            .unwrap()
            .unwrap();
        assert!(!app.scheduler().pool().is_shutting_down());
    }

    #[tokio::test]
    async fn test_run_fails_without_components() {
        let mut config = AppConfig::default();
        config.database.backend = StoreBackend::Memory;
        config.api.enabled = false;

        let app = Application::new(config, AppMode::Api, "node-test".into())
            .await
            .unwrap();
        assert!(app.run().await.is_err());
    }
}
