use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use taskman_core::{
    AttemptRecord, Clock, CronState, InstanceStatus, LeaseStatus, SchedulerError,
    SchedulerResult, SystemClock, TaskInstance, TaskStore,
};

use crate::database::mapping::{MappingHelpers, INSTANCE_COLUMNS};
use crate::in_memory_store::LEASE_EXPIRED_EXHAUSTED;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS task_instances (
        id TEXT PRIMARY KEY,
        task_name TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        eta INTEGER NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        last_error TEXT,
        trace_id TEXT,
        trace_span_id TEXT,
        idempotency_key TEXT UNIQUE,
        reference TEXT,
        retry_policy TEXT NOT NULL,
        timeout_ms INTEGER,
        fire_time INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        lease_owner TEXT,
        lease_expiry INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_instances_due ON task_instances (status, eta)",
    "CREATE INDEX IF NOT EXISTS idx_task_instances_reference ON task_instances (reference)",
    "CREATE INDEX IF NOT EXISTS idx_task_instances_cron ON task_instances (task_name, fire_time)",
    r#"
    CREATE TABLE IF NOT EXISTS task_attempts (
        instance_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        started_at INTEGER NOT NULL,
        finished_at INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        result TEXT,
        error TEXT,
        PRIMARY KEY (instance_id, attempt)
    )
    "#,
];

/// 嵌入式SQLite任务存储
///
/// 适用于单节点部署。时间戳按毫秒整数保存，认领通过单条 `UPDATE .. RETURNING`
/// 完成，SQLite的写锁保证其原子性。
pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建表结构
    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite任务存储表结构已就绪");
        Ok(())
    }

    async fn insert_attempt(
        tx: &mut sqlx::SqliteConnection,
        record: &AttemptRecord,
    ) -> SchedulerResult<()> {
        let result = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO task_attempts
                (instance_id, attempt, started_at, finished_at, outcome, result, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.instance_id.to_string())
        .bind(i64::from(record.attempt))
        .bind(record.started_at.timestamp_millis())
        .bind(record.finished_at.timestamp_millis())
        .bind(record.outcome.as_str())
        .bind(result)
        .bind(&record.error)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id, task_name = %instance.task_name))]
    async fn insert(&self, instance: &TaskInstance) -> SchedulerResult<Uuid> {
        let result = sqlx::query(&format!(
            "INSERT INTO task_instances ({INSTANCE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(instance.id.to_string())
        .bind(&instance.task_name)
        .bind(serde_json::to_string(&instance.payload)?)
        .bind(instance.status)
        .bind(instance.eta.timestamp_millis())
        .bind(i64::from(instance.attempt_count))
        .bind(i64::from(instance.max_attempts))
        .bind(&instance.last_error)
        .bind(&instance.trace_id)
        .bind(&instance.trace_span_id)
        .bind(&instance.idempotency_key)
        .bind(&instance.reference)
        .bind(serde_json::to_string(&instance.retry_policy)?)
        .bind(instance.timeout_ms)
        .bind(instance.fire_time.map(|t| t.timestamp_millis()))
        .bind(instance.created_at.timestamp_millis())
        .bind(instance.updated_at.timestamp_millis())
        .bind(&instance.lease_owner)
        .bind(instance.lease_expiry.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(instance.id),
            Err(e) if MappingHelpers::is_unique_violation(&e) => {
                let Some(key) = &instance.idempotency_key else {
                    return Err(SchedulerError::Database(e));
                };
                let row = sqlx::query("SELECT id FROM task_instances WHERE idempotency_key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
                match row {
                    Some(row) => {
                        let existing: String = row.try_get("id")?;
                        let existing_id = Uuid::parse_str(&existing)
                            .map_err(|e| SchedulerError::Serialization(e.to_string()))?;
                        Err(SchedulerError::DuplicateInstance {
                            key: key.clone(),
                            existing_id,
                        })
                    }
                    None => Err(SchedulerError::Database(e)),
                }
            }
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<TaskInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(MappingHelpers::sqlite_row_to_instance)
            .transpose()
    }

    async fn find_by_reference(&self, reference: &str) -> SchedulerResult<Vec<TaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE reference = ? ORDER BY created_at, id"
        ))
        .bind(reference)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(MappingHelpers::sqlite_row_to_instance).collect()
    }

    #[instrument(skip(self))]
    async fn claim_due(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> SchedulerResult<Vec<TaskInstance>> {
        let now_ms = now.timestamp_millis();
        let expiry_ms = now_ms + lease_ttl.as_millis() as i64;
        let mut tx = self.pool.begin().await?;

        let exhausted = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = ?, last_error = ?, lease_owner = NULL, lease_expiry = NULL, updated_at = ?
            WHERE status = ? AND lease_expiry < ? AND attempt_count >= max_attempts
            "#,
        )
        .bind(InstanceStatus::Failed)
        .bind(LEASE_EXPIRED_EXHAUSTED)
        .bind(now_ms)
        .bind(InstanceStatus::Leased)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        if exhausted.rows_affected() > 0 {
            warn!("{} 个实例租约过期且已无剩余尝试次数，标记为失败", exhausted.rows_affected());
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE task_instances
            SET status = ?1, lease_owner = ?2, lease_expiry = ?3,
                attempt_count = attempt_count + 1, updated_at = ?4
            WHERE id IN (
                SELECT id FROM task_instances
                WHERE ((status = ?5 AND eta <= ?4) OR (status = ?1 AND lease_expiry < ?4))
                  AND attempt_count < max_attempts
                ORDER BY eta, created_at
                LIMIT ?6
            )
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(InstanceStatus::Leased)
        .bind(owner)
        .bind(expiry_ms)
        .bind(now_ms)
        .bind(InstanceStatus::Pending)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut claimed = rows
            .iter()
            .map(MappingHelpers::sqlite_row_to_instance)
            .collect::<SchedulerResult<Vec<_>>>()?;
        claimed.sort_by_key(|i| (i.eta, i.created_at));
        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> SchedulerResult<LeaseStatus> {
        let updated = sqlx::query(
            "UPDATE task_instances SET lease_expiry = ? WHERE id = ? AND status = ? AND lease_owner = ?",
        )
        .bind(until.timestamp_millis())
        .bind(id.to_string())
        .bind(InstanceStatus::Leased)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(LeaseStatus::Held);
        }

        let status: Option<InstanceStatus> =
            sqlx::query_scalar("SELECT status FROM task_instances WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(match status {
            Some(InstanceStatus::Cancelled) => LeaseStatus::Cancelled,
            _ => LeaseStatus::Lost,
        })
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> SchedulerResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = ?, attempt_count = MAX(attempt_count - 1, 0),
                lease_owner = NULL, lease_expiry = NULL, updated_at = ?
            WHERE id = ? AND status = ? AND lease_owner = ?
            "#,
        )
        .bind(InstanceStatus::Pending)
        .bind(self.clock.now().timestamp_millis())
        .bind(id.to_string())
        .bind(InstanceStatus::Leased)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SchedulerError::LeaseLost { id });
        }
        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        record: &AttemptRecord,
    ) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = ?, lease_owner = NULL, lease_expiry = NULL, updated_at = ?
            WHERE id = ? AND status = ? AND lease_owner = ?
            "#,
        )
        .bind(InstanceStatus::Succeeded)
        .bind(self.clock.now().timestamp_millis())
        .bind(id.to_string())
        .bind(InstanceStatus::Leased)
        .bind(owner)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SchedulerError::LeaseLost { id });
        }

        Self::insert_attempt(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn mark_failed(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        next_eta: Option<DateTime<Utc>>,
        record: Option<&AttemptRecord>,
    ) -> SchedulerResult<()> {
        let (status, eta) = match next_eta {
            Some(eta) => (InstanceStatus::Pending, Some(eta.timestamp_millis())),
            None => (InstanceStatus::Failed, None),
        };

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = ?, last_error = ?, eta = MAX(eta, COALESCE(?, eta)),
                lease_owner = NULL, lease_expiry = NULL, updated_at = ?
            WHERE id = ? AND status = ? AND lease_owner = ?
            "#,
        )
        .bind(status)
        .bind(error)
        .bind(eta)
        .bind(self.clock.now().timestamp_millis())
        .bind(id.to_string())
        .bind(InstanceStatus::Leased)
        .bind(owner)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SchedulerError::LeaseLost { id });
        }

        if let Some(record) = record {
            Self::insert_attempt(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> SchedulerResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = ?, lease_owner = NULL, lease_expiry = NULL, updated_at = ?
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(InstanceStatus::Cancelled)
        .bind(self.clock.now().timestamp_millis())
        .bind(id.to_string())
        .bind(InstanceStatus::Pending)
        .bind(InstanceStatus::Leased)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(SchedulerError::InstanceNotFound { id }),
        }
    }

    async fn cron_state(&self, task_name: &str) -> SchedulerResult<CronState> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status IN (?, ?) THEN 1 ELSE 0 END), 0) AS active,
                   MAX(fire_time) AS last_fire_time
            FROM task_instances
            WHERE task_name = ? AND fire_time IS NOT NULL
            "#,
        )
        .bind(InstanceStatus::Pending)
        .bind(InstanceStatus::Leased)
        .bind(task_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(CronState {
            active: row.try_get::<i64, _>("active")? > 0,
            last_fire_time: MappingHelpers::opt_millis_to_datetime(row.try_get("last_fire_time")?)?,
        })
    }

    async fn attempts(&self, id: Uuid) -> SchedulerResult<Vec<AttemptRecord>> {
        if self.get(id).await?.is_none() {
            return Err(SchedulerError::InstanceNotFound { id });
        }

        let rows = sqlx::query(
            r#"
            SELECT instance_id, attempt, started_at, finished_at, outcome, result, error
            FROM task_attempts WHERE instance_id = ? ORDER BY attempt
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(MappingHelpers::sqlite_row_to_attempt).collect()
    }
}
