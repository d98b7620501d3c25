//! # Postgres Job Store
//!
//! Transactional job-queue table with native delayed-start scheduling.
//! Jobs become eligible when `start_after` passes; workers claim them
//! with `FOR UPDATE SKIP LOCKED` so concurrent workers never double-run
//! an occurrence. Retry after handler failure is handled here, in the
//! store, rather than per-consumer.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::error::{QueueError, QueueResult};
use crate::message::{QueueStats, TaskInfo, TaskMessage, TaskStatus};

/// Per-queue fetch ceiling for listings; pagination happens client-side
/// over this window.
const LISTING_FETCH_CAP: i64 = 1_000;

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
    config: PostgresConfig,
}

/// A job claimed for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub payload: Option<serde_json::Value>,
    pub retry_count: i32,
}

impl ClaimedJob {
    /// Decode the stored envelope, falling back to wrapping a foreign
    /// payload so externally inserted jobs still reach the handler.
    pub fn task_message(&self, queue_name: &str) -> TaskMessage {
        self.payload
            .as_ref()
            .and_then(|payload| serde_json::from_value(payload.clone()).ok())
            .unwrap_or_else(|| TaskMessage::new(queue_name, self.payload.clone()))
    }
}

impl JobStore {
    /// Connect to the store and return a client owning its pool.
    pub async fn connect(config: &PostgresConfig) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.database_url)
            .await
            .map_err(|e| QueueError::connection(format!("Postgres connection failed: {e}")))?;

        info!("Connected to Postgres job store");
        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job tables if they do not exist. Idempotent.
    pub async fn install_schema(&self) -> QueueResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_registry (
                queue_name  TEXT PRIMARY KEY,
                created_on  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id           UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                queue_name   TEXT NOT NULL,
                payload      JSONB,
                state        TEXT NOT NULL DEFAULT 'created',
                retry_count  INT NOT NULL DEFAULT 0,
                retry_limit  INT NOT NULL DEFAULT 3,
                start_after  TIMESTAMPTZ NOT NULL DEFAULT now(),
                created_on   TIMESTAMPTZ NOT NULL DEFAULT now(),
                started_on   TIMESTAMPTZ,
                completed_on TIMESTAMPTZ,
                failed_on    TIMESTAMPTZ,
                output       JSONB,
                error        TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_fetch
            ON queue_jobs (queue_name, state, start_after)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Job store schema installed");
        Ok(())
    }

    /// Register a queue name. Duplicate registration is success.
    pub async fn ensure_queue(&self, queue_name: &str) -> QueueResult<()> {
        sqlx::query("INSERT INTO queue_registry (queue_name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        debug!(queue_name, "Queue registered");
        Ok(())
    }

    /// Enqueue one occurrence, eligible `delay_ms` from now.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        message: &TaskMessage,
        delay_ms: u64,
    ) -> QueueResult<Uuid> {
        let payload = serde_json::to_value(message)?;

        let row = sqlx::query(
            r#"
            INSERT INTO queue_jobs (queue_name, payload, retry_limit, start_after)
            VALUES ($1, $2, $3, now() + $4::bigint * interval '1 millisecond')
            RETURNING id
            "#,
        )
        .bind(queue_name)
        .bind(&payload)
        .bind(self.config.retry_limit as i32)
        .bind(delay_ms as i64)
        .fetch_one(&self.pool)
        .await?;

        let id: Uuid = row.try_get("id")?;
        info!(
            queue_name,
            job_id = %id,
            delay_ms,
            recurring = message.is_recurring(),
            "Task scheduled on Postgres backend"
        );
        Ok(id)
    }

    /// Claim up to `limit` eligible jobs, transitioning them to `active`.
    pub async fn claim(&self, queue_name: &str, limit: i64) -> QueueResult<Vec<ClaimedJob>> {
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                SELECT id FROM queue_jobs
                WHERE queue_name = $1
                  AND state IN ('created', 'retry')
                  AND start_after <= now()
                ORDER BY start_after, created_on
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs j
            SET state = 'active', started_on = now()
            FROM claimed
            WHERE j.id = claimed.id
            RETURNING j.id, j.payload, j.retry_count
            "#,
        )
        .bind(queue_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ClaimedJob {
                    id: row.try_get("id")?,
                    payload: row.try_get("payload")?,
                    retry_count: row.try_get("retry_count")?,
                })
            })
            .collect()
    }

    /// Mark a claimed job completed.
    pub async fn complete(&self, job_id: Uuid) -> QueueResult<()> {
        sqlx::query(
            "UPDATE queue_jobs SET state = 'completed', completed_on = now() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a claimed job failed; schedules a retry while attempts remain,
    /// with a linearly growing delay, otherwise finalizes as `failed`.
    pub async fn fail(&self, job_id: Uuid, error_text: &str) -> QueueResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'failed' END,
                retry_count = CASE WHEN retry_count < retry_limit
                                   THEN retry_count + 1 ELSE retry_count END,
                start_after = CASE WHEN retry_count < retry_limit
                                   THEN now() + ($2::bigint * (retry_count + 1)) * interval '1 second'
                                   ELSE start_after END,
                failed_on = CASE WHEN retry_count < retry_limit THEN failed_on ELSE now() END,
                error = $3
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(self.config.retry_delay_seconds as i64)
        .bind(error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sweep long-running active jobs to `expired`.
    pub async fn expire_stale(&self, queue_name: &str) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'expired'
            WHERE queue_name = $1
              AND state = 'active'
              AND started_on < now() - $2::bigint * interval '1 second'
            "#,
        )
        .bind(queue_name)
        .bind(self.config.expire_after_seconds as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Queues known to the store.
    pub async fn queue_names(&self) -> QueueResult<Vec<String>> {
        let rows = sqlx::query("SELECT queue_name FROM queue_registry ORDER BY queue_name")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get("queue_name")?))
            .collect()
    }

    /// Aggregate counters per queue, optionally restricted to one queue.
    pub async fn stats(&self, queue_name: Option<&str>) -> QueueResult<Vec<QueueStats>> {
        let rows = sqlx::query(
            r#"
            SELECT r.queue_name,
                   COUNT(j.id) FILTER (WHERE j.state = 'created')               AS created,
                   COUNT(j.id) FILTER (WHERE j.state IN ('created', 'retry'))   AS waiting,
                   COUNT(j.id) FILTER (WHERE j.state = 'active')                AS active,
                   COUNT(j.id) FILTER (WHERE j.state = 'completed')             AS completed,
                   COUNT(j.id) FILTER (WHERE j.state = 'failed')                AS failed,
                   COUNT(j.id) FILTER (WHERE j.state = 'cancelled')             AS cancelled
            FROM queue_registry r
            LEFT JOIN queue_jobs j ON j.queue_name = r.queue_name
            WHERE $1::text IS NULL OR r.queue_name = $1
            GROUP BY r.queue_name
            ORDER BY r.queue_name
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let count = |name: &str| -> QueueResult<u64> {
                    Ok(row.try_get::<i64, _>(name)?.max(0) as u64)
                };
                Ok(QueueStats {
                    queue_name: row.try_get("queue_name")?,
                    created: count("created")?,
                    waiting: count("waiting")?,
                    active: count("active")?,
                    completed: count("completed")?,
                    failed: count("failed")?,
                    cancelled: count("cancelled")?,
                })
            })
            .collect()
    }

    /// Recent jobs for one queue, newest first, capped.
    pub async fn jobs_for_queue(&self, queue_name: &str) -> QueueResult<Vec<TaskInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_name, payload, state, retry_count,
                   created_on, started_on, completed_on, failed_on, output, error
            FROM queue_jobs
            WHERE queue_name = $1
            ORDER BY created_on DESC
            LIMIT $2
            "#,
        )
        .bind(queue_name)
        .bind(LISTING_FETCH_CAP)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_task_info).collect()
    }

    /// Look up one job by id.
    pub async fn job_by_id(&self, job_id: Uuid) -> QueueResult<Option<TaskInfo>> {
        let row = sqlx::query(
            r#"
            SELECT id, queue_name, payload, state, retry_count,
                   created_on, started_on, completed_on, failed_on, output, error
            FROM queue_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_task_info).transpose()
    }

    fn row_to_task_info(row: sqlx::postgres::PgRow) -> QueueResult<TaskInfo> {
        let id: Uuid = row.try_get("id")?;
        let state: String = row.try_get("state")?;
        let retry_count: i32 = row.try_get("retry_count")?;

        Ok(TaskInfo {
            id: id.to_string(),
            name: row.try_get("queue_name")?,
            data: row.try_get("payload")?,
            status: TaskStatus::from_native(&state),
            created_on: row.try_get::<DateTime<Utc>, _>("created_on")?,
            started_on: row.try_get("started_on")?,
            completed_on: row.try_get("completed_on")?,
            failed_on: row.try_get("failed_on")?,
            retries: retry_count.max(0) as u32,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
        })
    }

    /// Close the underlying pool. Safe to call repeatedly.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
