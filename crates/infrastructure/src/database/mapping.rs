//! Shared database mapping utilities
//!
//! SQLite stores timestamps as epoch milliseconds and JSON as text, while
//! PostgreSQL uses native `TIMESTAMPTZ`/`JSONB`/`UUID` columns. Both stores
//! go through these helpers so the domain conversion lives in one place.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use taskman_core::{
    AttemptOutcome, AttemptRecord, InstanceStatus, RetryPolicy, SchedulerError, SchedulerResult,
    TaskInstance,
};

pub const INSTANCE_COLUMNS: &str = "id, task_name, payload, status, eta, attempt_count, \
    max_attempts, last_error, trace_id, trace_span_id, idempotency_key, reference, retry_policy, \
    timeout_ms, fire_time, created_at, updated_at, lease_owner, lease_expiry";

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn millis_to_datetime(millis: i64) -> SchedulerResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的时间戳: {millis}")))
    }

    pub fn opt_millis_to_datetime(millis: Option<i64>) -> SchedulerResult<Option<DateTime<Utc>>> {
        millis.map(Self::millis_to_datetime).transpose()
    }

    pub fn to_u32(value: i64, field: &str) -> SchedulerResult<u32> {
        u32::try_from(value)
            .map_err(|_| SchedulerError::Serialization(format!("字段 {field} 超出范围: {value}")))
    }

    pub fn parse_json_sqlite(text: &str, field: &str) -> SchedulerResult<serde_json::Value> {
        serde_json::from_str(text)
            .map_err(|e| SchedulerError::Serialization(format!("解析{field}失败: {e}")))
    }

    pub fn parse_policy(value: serde_json::Value) -> SchedulerResult<RetryPolicy> {
        serde_json::from_value(value)
            .map_err(|e| SchedulerError::Serialization(format!("解析重试策略失败: {e}")))
    }

    pub fn parse_outcome(text: &str) -> SchedulerResult<AttemptOutcome> {
        text.parse().map_err(SchedulerError::Serialization)
    }

    pub fn sqlite_row_to_instance(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<TaskInstance> {
        let id: String = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;
        let policy: String = row.try_get("retry_policy")?;

        Ok(TaskInstance {
            id: Uuid::parse_str(&id)
                .map_err(|e| SchedulerError::Serialization(format!("无效的实例ID {id}: {e}")))?,
            task_name: row.try_get("task_name")?,
            payload: Self::parse_json_sqlite(&payload, "负载")?,
            status: row.try_get::<InstanceStatus, _>("status")?,
            eta: Self::millis_to_datetime(row.try_get("eta")?)?,
            attempt_count: Self::to_u32(row.try_get("attempt_count")?, "attempt_count")?,
            max_attempts: Self::to_u32(row.try_get("max_attempts")?, "max_attempts")?,
            last_error: row.try_get("last_error")?,
            trace_id: row.try_get("trace_id")?,
            trace_span_id: row.try_get("trace_span_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            reference: row.try_get("reference")?,
            retry_policy: Self::parse_policy(Self::parse_json_sqlite(&policy, "重试策略")?)?,
            timeout_ms: row.try_get("timeout_ms")?,
            fire_time: Self::opt_millis_to_datetime(row.try_get("fire_time")?)?,
            created_at: Self::millis_to_datetime(row.try_get("created_at")?)?,
            updated_at: Self::millis_to_datetime(row.try_get("updated_at")?)?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expiry: Self::opt_millis_to_datetime(row.try_get("lease_expiry")?)?,
        })
    }

    pub fn postgres_row_to_instance(row: &sqlx::postgres::PgRow) -> SchedulerResult<TaskInstance> {
        Ok(TaskInstance {
            id: row.try_get("id")?,
            task_name: row.try_get("task_name")?,
            payload: row.try_get("payload")?,
            status: row.try_get::<InstanceStatus, _>("status")?,
            eta: row.try_get("eta")?,
            attempt_count: Self::to_u32(
                i64::from(row.try_get::<i32, _>("attempt_count")?),
                "attempt_count",
            )?,
            max_attempts: Self::to_u32(
                i64::from(row.try_get::<i32, _>("max_attempts")?),
                "max_attempts",
            )?,
            last_error: row.try_get("last_error")?,
            trace_id: row.try_get("trace_id")?,
            trace_span_id: row.try_get("trace_span_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            reference: row.try_get("reference")?,
            retry_policy: Self::parse_policy(row.try_get("retry_policy")?)?,
            timeout_ms: row.try_get("timeout_ms")?,
            fire_time: row.try_get("fire_time")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expiry: row.try_get("lease_expiry")?,
        })
    }

    pub fn sqlite_row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<AttemptRecord> {
        let id: String = row.try_get("instance_id")?;
        let result: Option<String> = row.try_get("result")?;
        let outcome: String = row.try_get("outcome")?;

        Ok(AttemptRecord {
            instance_id: Uuid::parse_str(&id)
                .map_err(|e| SchedulerError::Serialization(format!("无效的实例ID {id}: {e}")))?,
            attempt: Self::to_u32(row.try_get("attempt")?, "attempt")?,
            started_at: Self::millis_to_datetime(row.try_get("started_at")?)?,
            finished_at: Self::millis_to_datetime(row.try_get("finished_at")?)?,
            outcome: Self::parse_outcome(&outcome)?,
            result: result
                .map(|text| Self::parse_json_sqlite(&text, "执行结果"))
                .transpose()?,
            error: row.try_get("error")?,
        })
    }

    pub fn postgres_row_to_attempt(row: &sqlx::postgres::PgRow) -> SchedulerResult<AttemptRecord> {
        let outcome: String = row.try_get("outcome")?;

        Ok(AttemptRecord {
            instance_id: row.try_get("instance_id")?,
            attempt: Self::to_u32(i64::from(row.try_get::<i32, _>("attempt")?), "attempt")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            outcome: Self::parse_outcome(&outcome)?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
        })
    }

    /// 唯一约束冲突
    pub fn is_unique_violation(error: &sqlx::Error) -> bool {
        matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversion() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(
            MappingHelpers::millis_to_datetime(now.timestamp_millis()).unwrap(),
            now
        );
        assert!(MappingHelpers::millis_to_datetime(i64::MAX).is_err());
        assert_eq!(MappingHelpers::opt_millis_to_datetime(None).unwrap(), None);
    }

    #[test]
    fn test_integer_range_checks() {
        assert_eq!(MappingHelpers::to_u32(3, "attempt").unwrap(), 3);
        assert!(MappingHelpers::to_u32(-1, "attempt").is_err());
    }
}
