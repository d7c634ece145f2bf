//! 任务注册表
//!
//! 启动阶段通过 [`TaskRegistryBuilder`] 显式注册全部任务定义，构建完成后只读，
//! 以 `Arc<TaskRegistry>` 在调度器、控制器之间共享。
//!
//! ```rust,ignore
//! let mut builder = TaskRegistry::builder();
//! builder.register(
//!     TaskDefinition::new("send_email", handler)
//!         .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(5))),
//! )?;
//! let registry = Arc::new(builder.build());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use taskman_core::{RetryPolicy, SchedulerError, SchedulerResult, TaskHandler};

use crate::cron_utils::CronTrigger;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// 任务定义
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    cron: Option<CronTrigger>,
    /// 单个定义允许的最大并发实例数
    pub max_concurrency: Option<usize>,
    /// 周期任务是否补跑错过的触发时间
    pub catch_up: bool,
    /// 周期任务实例使用的负载
    pub default_payload: serde_json::Value,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("cron", &self.cron.as_ref().map(CronTrigger::expression))
            .field("max_concurrency", &self.max_concurrency)
            .field("catch_up", &self.catch_up)
            .finish()
    }
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            retry_policy: None,
            timeout: None,
            cron: None,
            max_concurrency: None,
            catch_up: false,
            default_payload: serde_json::Value::Null,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 设置CRON表达式，无效表达式在此立即报错
    pub fn with_cron(mut self, expr: &str) -> SchedulerResult<Self> {
        self.cron = Some(CronTrigger::parse(expr)?);
        Ok(self)
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_catch_up(mut self, catch_up: bool) -> Self {
        self.catch_up = catch_up;
        self
    }

    pub fn with_default_payload(mut self, payload: serde_json::Value) -> Self {
        self.default_payload = payload;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn cron(&self) -> Option<&CronTrigger> {
        self.cron.as_ref()
    }
}

/// 注册成功后返回的句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    name: String,
}

impl TaskRef {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsRef<str> for TaskRef {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

pub struct TaskRegistryBuilder {
    definitions: HashMap<String, Arc<TaskDefinition>>,
    default_policy: RetryPolicy,
    default_timeout: Duration,
}

impl Default for TaskRegistryBuilder {
    fn default() -> Self {
        Self {
            definitions: HashMap::new(),
            default_policy: RetryPolicy::default(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TaskRegistryBuilder {
    /// 未显式指定重试策略或超时的定义使用这里的默认值
    pub fn with_defaults(mut self, policy: RetryPolicy, timeout: Duration) -> Self {
        self.default_policy = policy;
        self.default_timeout = timeout;
        self
    }

    pub fn register(&mut self, mut definition: TaskDefinition) -> SchedulerResult<TaskRef> {
        if self.definitions.contains_key(&definition.name) {
            return Err(SchedulerError::DuplicateTask {
                name: definition.name,
            });
        }

        let policy = definition
            .retry_policy
            .get_or_insert_with(|| self.default_policy.clone());
        policy.validate().map_err(|e| {
            SchedulerError::Configuration(format!("任务 {} 的重试策略无效: {e}", definition.name))
        })?;
        definition.timeout.get_or_insert(self.default_timeout);
        if definition.max_concurrency == Some(0) {
            return Err(SchedulerError::Configuration(format!(
                "任务 {} 的max_concurrency必须大于0",
                definition.name
            )));
        }

        info!(
            task = %definition.name,
            cron = definition.cron.as_ref().map(CronTrigger::expression).unwrap_or("-"),
            "注册任务定义"
        );

        let task_ref = TaskRef {
            name: definition.name.clone(),
        };
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(task_ref)
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            definitions: self.definitions,
        }
    }
}

/// 只读任务注册表
#[derive(Debug, Default)]
pub struct TaskRegistry {
    definitions: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> SchedulerResult<Arc<TaskDefinition>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// 带CRON表达式的定义，按名称排序
    pub fn cron_definitions(&self) -> Vec<Arc<TaskDefinition>> {
        let mut definitions: Vec<_> = self
            .definitions
            .values()
            .filter(|d| d.cron.is_some())
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
