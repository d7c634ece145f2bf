use thiserror::Error;
use uuid::Uuid;

/// 任务管理器错误类型定义
///
/// 注册期错误（`DuplicateTask`、`UnknownTask`、`InvalidCronExpression`）在启动阶段直接失败；
/// 基础设施错误（`StoreUnavailable`、`LockUnavailable`、`Database`）可恢复，由轮询循环退避重试；
/// `LeaseLost` 表示当前执行必须立即放弃且不写入任何结果。
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("任务已注册: {name}")]
    DuplicateTask { name: String },

    #[error("未知任务: {name}")]
    UnknownTask { name: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCronExpression { expr: String, message: String },

    #[error("幂等键重复: {key} (已存在实例 {existing_id})")]
    DuplicateInstance { key: String, existing_id: Uuid },

    #[error("任务实例未找到: {id}")]
    InstanceNotFound { id: Uuid },

    #[error("租约已丢失: 实例 {id}")]
    LeaseLost { id: Uuid },

    #[error("任务存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("锁服务不可用: {0}")]
    LockUnavailable(String),

    #[error("任务处理失败: {0}")]
    Handler(String),

    #[error("重试次数已耗尽: 实例 {id} 共尝试 {attempts} 次")]
    RetriesExhausted { id: Uuid, attempts: u32 },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 是否为可通过退避重试恢复的基础设施错误
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::StoreUnavailable(_) | SchedulerError::LockUnavailable(_) => true,
            SchedulerError::Database(sqlx::Error::Database(db)) => {
                is_contention(db.code().as_deref(), db.message())
            }
            SchedulerError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

/// 锁等待、序列化冲突等并发竞争造成的数据库错误
///
/// SQLite: SQLITE_BUSY(5) / SQLITE_LOCKED(6) 及其扩展码；
/// Postgres: 40001 serialization_failure、40P01 deadlock_detected、55P03 lock_not_available。
fn is_contention(code: Option<&str>, message: &str) -> bool {
    let by_code = match code {
        Some("40001" | "40P01" | "55P03") => true,
        // SQLite 扩展码不超过4位，5位的是 Postgres SQLSTATE
        Some(code) if code.len() < 5 => code
            .parse::<i32>()
            .is_ok_and(|extended| matches!(extended & 0xff, 5 | 6)),
        Some(_) => false,
        None => false,
    };
    by_code || message.contains("database is locked") || message.contains("database table is locked")
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
