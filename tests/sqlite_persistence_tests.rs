use std::time::Duration;

use anyhow::Result;
use taskman::app::{AppMode, Application};
use taskman_core::config::{AppConfig, StoreBackend, TaskConfig};
use taskman_core::InstanceStatus;
use taskman_dispatcher::ScheduleOptions;
use tempfile::TempDir;

fn sqlite_config(temp_dir: &TempDir) -> AppConfig {
    let db_path = temp_dir.path().join("taskman.db");

    let mut config = AppConfig::default();
    config.database.backend = StoreBackend::Sqlite;
    config.database.url = format!("sqlite://{}?mode=rwc", db_path.display());
    config.database.max_connections = 1;
    config.api.bind_address = "127.0.0.1:0".to_string();
    config.tasks.push(TaskConfig {
        name: "touch".to_string(),
        handler: "shell".to_string(),
        cron: None,
        catch_up: false,
        timeout_seconds: Some(10),
        max_concurrency: None,
        retry: None,
        params: serde_json::json!({"command": "echo", "args": ["done"]}),
        payload: serde_json::Value::Null,
    });
    config
}

/// 实例在进程重启后仍然存在，并由新进程执行
#[tokio::test]
async fn test_instances_survive_restart() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let id = {
        let app = Application::new(sqlite_config(&temp_dir), AppMode::Api, "node-1".into()).await?;
        app.controller()
            .schedule(
                "touch",
                serde_json::json!({"file": "a"}),
                ScheduleOptions::new().with_reference("restart-test"),
            )
            .await?
    };
    assert!(temp_dir.path().join("taskman.db").exists());

    let app = Application::new(sqlite_config(&temp_dir), AppMode::All, "node-2".into()).await?;
    let snapshot = app.controller().status(id).await?;
    assert_eq!(snapshot.status, InstanceStatus::Pending);

    let report = app.scheduler().run_cycle().await?;
    assert_eq!(report.dispatched, 1);
    tokio::time::timeout(Duration::from_secs(10), app.scheduler().pool().wait_idle()).await?;

    let snapshot = app.controller().status(id).await?;
    assert_eq!(snapshot.status, InstanceStatus::Succeeded);
    assert_eq!(snapshot.attempt_count, 1);

    let attempts = app.controller().attempts(id).await?;
    assert_eq!(attempts.len(), 1);
    assert_eq!(
        attempts[0].result.as_ref().and_then(|r| r["exit_code"].as_i64()),
        Some(0)
    );

    let by_reference = app.controller().find_by_reference("restart-test").await?;
    assert_eq!(by_reference.len(), 1);
    Ok(())
}

/// 调度循环随关闭信号退出
#[tokio::test]
async fn test_application_stops_on_shutdown() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut config = sqlite_config(&temp_dir);
    config.scheduler.poll_interval_ms = 20;
    config.worker.shutdown_grace_seconds = 1;

    let app = std::sync::Arc::new(Application::new(config, AppMode::All, "node-1".into()).await?);
    let handle = {
        let app = app.clone();
        tokio::spawn(async move { app.run().await })
    };

    let id = app
        .controller()
        .schedule("touch", serde_json::Value::Null, ScheduleOptions::new())
        .await?;
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match app.controller().status(id).await {
                Ok(snapshot) if snapshot.status == InstanceStatus::Succeeded => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await?;

    app.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    assert!(app.scheduler().pool().is_shutting_down());
    Ok(())
}
