use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
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
        id UUID PRIMARY KEY,
        task_name VARCHAR(255) NOT NULL,
        payload JSONB NOT NULL,
        status VARCHAR(32) NOT NULL,
        eta TIMESTAMPTZ NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        last_error TEXT,
        trace_id VARCHAR(64),
        trace_span_id VARCHAR(32),
        idempotency_key VARCHAR(512) UNIQUE,
        reference VARCHAR(512),
        retry_policy JSONB NOT NULL,
        timeout_ms BIGINT,
        fire_time TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        lease_owner VARCHAR(255),
        lease_expiry TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_instances_due ON task_instances (status, eta)",
    "CREATE INDEX IF NOT EXISTS idx_task_instances_reference ON task_instances (reference)",
    "CREATE INDEX IF NOT EXISTS idx_task_instances_cron ON task_instances (task_name, fire_time)",
    r#"
    CREATE TABLE IF NOT EXISTS task_attempts (
        instance_id UUID NOT NULL REFERENCES task_instances (id) ON DELETE CASCADE,
        attempt INTEGER NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ NOT NULL,
        outcome VARCHAR(32) NOT NULL,
        result JSONB,
        error TEXT,
        PRIMARY KEY (instance_id, attempt)
    )
    "#,
];

/// PostgreSQL任务存储
///
/// 多节点共享。认领使用 `FOR UPDATE SKIP LOCKED`，并发节点互不阻塞且不会选中同一行。
pub struct PostgresTaskStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 创建表结构
    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("PostgreSQL任务存储表结构已就绪");
        Ok(())
    }

    async fn insert_attempt(
        tx: &mut sqlx::PgConnection,
        record: &AttemptRecord,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_attempts
                (instance_id, attempt, started_at, finished_at, outcome, result, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (instance_id, attempt) DO UPDATE
            SET started_at = EXCLUDED.started_at, finished_at = EXCLUDED.finished_at,
                outcome = EXCLUDED.outcome, result = EXCLUDED.result, error = EXCLUDED.error
            "#,
        )
        .bind(record.instance_id)
        .bind(record.attempt as i32)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.outcome.as_str())
        .bind(&record.result)
        .bind(&record.error)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id, task_name = %instance.task_name))]
    async fn insert(&self, instance: &TaskInstance) -> SchedulerResult<Uuid> {
        let result = sqlx::query(&format!(
            "INSERT INTO task_instances ({INSTANCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        ))
        .bind(instance.id)
        .bind(&instance.task_name)
        .bind(&instance.payload)
        .bind(instance.status)
        .bind(instance.eta)
        .bind(instance.attempt_count as i32)
        .bind(instance.max_attempts as i32)
        .bind(&instance.last_error)
        .bind(&instance.trace_id)
        .bind(&instance.trace_span_id)
        .bind(&instance.idempotency_key)
        .bind(&instance.reference)
        .bind(Json(&instance.retry_policy))
        .bind(instance.timeout_ms)
        .bind(instance.fire_time)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(&instance.lease_owner)
        .bind(instance.lease_expiry)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(instance.id),
            Err(e) if MappingHelpers::is_unique_violation(&e) => {
                let Some(key) = &instance.idempotency_key else {
                    return Err(SchedulerError::Database(e));
                };
                let existing: Option<Uuid> =
                    sqlx::query_scalar("SELECT id FROM task_instances WHERE idempotency_key = $1")
                        .bind(key)
                        .fetch_optional(&self.pool)
                        .await?;
                match existing {
                    Some(existing_id) => Err(SchedulerError::DuplicateInstance {
                        key: key.clone(),
                        existing_id,
                    }),
                    None => Err(SchedulerError::Database(e)),
                }
            }
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<TaskInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(MappingHelpers::postgres_row_to_instance)
            .transpose()
    }

    async fn find_by_reference(&self, reference: &str) -> SchedulerResult<Vec<TaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE reference = $1 ORDER BY created_at, id"
        ))
        .bind(reference)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(MappingHelpers::postgres_row_to_instance)
            .collect()
    }

    #[instrument(skip(self))]
    async fn claim_due(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> SchedulerResult<Vec<TaskInstance>> {
        let lease_expiry = now
            + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let mut tx = self.pool.begin().await?;

        let exhausted = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = $1, last_error = $2, lease_owner = NULL, lease_expiry = NULL, updated_at = $3
            WHERE id IN (
                SELECT id FROM task_instances
                WHERE status = $4 AND lease_expiry < $3 AND attempt_count >= max_attempts
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(InstanceStatus::Failed)
        .bind(LEASE_EXPIRED_EXHAUSTED)
        .bind(now)
        .bind(InstanceStatus::Leased)
        .execute(&mut *tx)
        .await?;
        if exhausted.rows_affected() > 0 {
            warn!("{} 个实例租约过期且已无剩余尝试次数，标记为失败", exhausted.rows_affected());
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE task_instances
            SET status = $1, lease_owner = $2, lease_expiry = $3,
                attempt_count = attempt_count + 1, updated_at = $4
            WHERE id IN (
                SELECT id FROM task_instances
                WHERE ((status = $5 AND eta <= $4) OR (status = $1 AND lease_expiry < $4))
                  AND attempt_count < max_attempts
                ORDER BY eta, created_at
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(InstanceStatus::Leased)
        .bind(owner)
        .bind(lease_expiry)
        .bind(now)
        .bind(InstanceStatus::Pending)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut claimed = rows
            .iter()
            .map(MappingHelpers::postgres_row_to_instance)
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
            "UPDATE task_instances SET lease_expiry = $1 WHERE id = $2 AND status = $3 AND lease_owner = $4",
        )
        .bind(until)
        .bind(id)
        .bind(InstanceStatus::Leased)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(LeaseStatus::Held);
        }

        let status: Option<InstanceStatus> =
            sqlx::query_scalar("SELECT status FROM task_instances WHERE id = $1")
                .bind(id)
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
            SET status = $1, attempt_count = GREATEST(attempt_count - 1, 0),
                lease_owner = NULL, lease_expiry = NULL, updated_at = $2
            WHERE id = $3 AND status = $4 AND lease_owner = $5
            "#,
        )
        .bind(InstanceStatus::Pending)
        .bind(self.clock.now())
        .bind(id)
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
            SET status = $1, lease_owner = NULL, lease_expiry = NULL, updated_at = $2
            WHERE id = $3 AND status = $4 AND lease_owner = $5
            "#,
        )
        .bind(InstanceStatus::Succeeded)
        .bind(self.clock.now())
        .bind(id)
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
        let status = if next_eta.is_some() {
            InstanceStatus::Pending
        } else {
            InstanceStatus::Failed
        };

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE task_instances
            SET status = $1, last_error = $2, eta = GREATEST(eta, COALESCE($3, eta)),
                lease_owner = NULL, lease_expiry = NULL, updated_at = $4
            WHERE id = $5 AND status = $6 AND lease_owner = $7
            "#,
        )
        .bind(status)
        .bind(error)
        .bind(next_eta)
        .bind(self.clock.now())
        .bind(id)
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
            SET status = $1, lease_owner = NULL, lease_expiry = NULL, updated_at = $2
            WHERE id = $3 AND status IN ($4, $5)
            "#,
        )
        .bind(InstanceStatus::Cancelled)
        .bind(self.clock.now())
        .bind(id)
        .bind(InstanceStatus::Pending)
        .bind(InstanceStatus::Leased)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM task_instances WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(SchedulerError::InstanceNotFound { id })
        }
    }

    async fn cron_state(&self, task_name: &str) -> SchedulerResult<CronState> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status IN ($1, $2) THEN 1 ELSE 0 END), 0)::BIGINT AS active,
                   MAX(fire_time) AS last_fire_time
            FROM task_instances
            WHERE task_name = $3 AND fire_time IS NOT NULL
            "#,
        )
        .bind(InstanceStatus::Pending)
        .bind(InstanceStatus::Leased)
        .bind(task_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(CronState {
            active: row.try_get::<i64, _>("active")? > 0,
            last_fire_time: row.try_get("last_fire_time")?,
        })
    }

    async fn attempts(&self, id: Uuid) -> SchedulerResult<Vec<AttemptRecord>> {
        if self.get(id).await?.is_none() {
            return Err(SchedulerError::InstanceNotFound { id });
        }

        let rows = sqlx::query(
            r#"
            SELECT instance_id, attempt, started_at, finished_at, outcome, result, error
            FROM task_attempts WHERE instance_id = $1 ORDER BY attempt
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(MappingHelpers::postgres_row_to_attempt)
            .collect()
    }
}
