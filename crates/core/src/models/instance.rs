use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RetryPolicy, TraceContext};

/// 任务实例状态
///
/// `Pending → Leased → {Succeeded | Pending(重试) | Failed | Cancelled}`，
/// 其中 `Succeeded`、`Failed`、`Cancelled` 为终态，不会再被认领。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "LEASED")]
    Leased,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Leased => "LEASED",
            InstanceStatus::Succeeded => "SUCCEEDED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(InstanceStatus::Pending),
            "LEASED" => Ok(InstanceStatus::Leased),
            "SUCCEEDED" => Ok(InstanceStatus::Succeeded),
            "FAILED" => Ok(InstanceStatus::Failed),
            "CANCELLED" => Ok(InstanceStatus::Cancelled),
            _ => Err(format!("Invalid instance status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for InstanceStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl sqlx::Type<sqlx::Sqlite> for InstanceStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for InstanceStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for InstanceStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for InstanceStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for InstanceStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 一次具体的可调度任务实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub id: Uuid,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub status: InstanceStatus,
    pub eta: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub trace_id: Option<String>,
    pub trace_span_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub reference: Option<String>,
    pub retry_policy: RetryPolicy,
    pub timeout_ms: Option<i64>,
    pub fire_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl TaskInstance {
    /// 创建新的待执行实例，`max_attempts` 取自重试策略
    pub fn new(
        task_name: impl Into<String>,
        payload: serde_json::Value,
        eta: DateTime<Utc>,
        retry_policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_name: task_name.into(),
            payload,
            status: InstanceStatus::Pending,
            eta,
            attempt_count: 0,
            max_attempts: retry_policy.max_attempts,
            last_error: None,
            trace_id: None,
            trace_span_id: None,
            idempotency_key: None,
            reference: None,
            retry_policy,
            timeout_ms: None,
            fire_time: None,
            created_at: now,
            updated_at: now,
            lease_owner: None,
            lease_expiry: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace_id = trace.trace_id;
        self.trace_span_id = trace.span_id;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_fire_time(mut self, fire_time: DateTime<Utc>) -> Self {
        self.fire_time = Some(fire_time);
        self
    }

    pub fn trace(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: self.trace_span_id.clone(),
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.status == InstanceStatus::Leased && self.lease_owner.as_deref() == Some(owner)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot::from(self)
    }
}

/// `status()` 返回的只读视图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub id: Uuid,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub status: InstanceStatus,
    pub eta: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub trace_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub reference: Option<String>,
    pub fire_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl From<&TaskInstance> for InstanceSnapshot {
    fn from(instance: &TaskInstance) -> Self {
        Self {
            id: instance.id,
            task_name: instance.task_name.clone(),
            payload: instance.payload.clone(),
            status: instance.status,
            eta: instance.eta,
            attempt_count: instance.attempt_count,
            max_attempts: instance.max_attempts,
            last_error: instance.last_error.clone(),
            trace_id: instance.trace_id.clone(),
            idempotency_key: instance.idempotency_key.clone(),
            reference: instance.reference.clone(),
            fire_time: instance.fire_time,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            lease_owner: instance.lease_owner.clone(),
            lease_expiry: instance.lease_expiry,
        }
    }
}

/// 续约结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// 仍由调用方持有，到期时间已延长
    Held,
    /// 实例已被取消，调用方应停止执行
    Cancelled,
    /// 租约已过期或被其他节点接管
    Lost,
}

/// 某个周期任务定义在存储中的状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CronState {
    /// 是否存在 Pending 或 Leased 的实例
    pub active: bool,
    /// 已创建的最晚触发时间
    pub last_fire_time: Option<DateTime<Utc>>,
}
