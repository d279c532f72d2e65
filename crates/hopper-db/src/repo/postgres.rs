//! PostgreSQL job store.
//!
//! Dispatch and promotion claim rows with `FOR UPDATE SKIP LOCKED` so any
//! number of processes can share one database. Every state change is a
//! single guarded `UPDATE`; the caller learns whether it won from the
//! affected row count.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hopper_core::{
    Job, JobId, JobQuery, JobState, OverlapPolicy, Page, Payload, RecurringDefinition,
    StateCount,
};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use super::store::{JobStore, RecurringFire, Transition};
use crate::{DbError, DbResult};

const JOB_COLUMNS: &str = "id, queue, handler, args, state, created_at, updated_at, \
    enqueue_at, lease_expires_at, leased_by, lease_id, retry_count, max_retries, attempts, \
    parent_id, recurring_name, cron_expression, last_error, finished_at";

const RECURRING_COLUMNS: &str = "name, cron_expression, queue, handler, args, overlap, \
    max_retries, last_fired_at, next_fire_at, last_job_id, created_at, updated_at";

/// A job row as stored in the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: String,
    pub handler: String,
    pub args: serde_json::Value,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub enqueue_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub lease_id: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub attempts: i32,
    pub parent_id: Option<Uuid>,
    pub recurring_name: Option<String>,
    pub cron_expression: Option<String>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A row of the `recurring_definitions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecurringRecord {
    pub name: String,
    pub cron_expression: String,
    pub queue: String,
    pub handler: String,
    pub args: serde_json::Value,
    pub overlap: String,
    pub max_retries: Option<i32>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: DateTime<Utc>,
    pub last_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct CountRecord {
    queue: String,
    state: String,
    count: i64,
}

fn to_u32(field: &str, value: i32) -> DbResult<u32> {
    u32::try_from(value).map_err(|_| DbError::Corrupt(format!("{} is negative: {}", field, value)))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(row: JobRecord) -> DbResult<Self> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| DbError::Corrupt(format!("job {}: {}", row.id, e)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue: row.queue,
            payload: Payload::new(row.handler, row.args),
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
            enqueue_at: row.enqueue_at,
            lease_expires_at: row.lease_expires_at,
            leased_by: row.leased_by,
            lease_id: row.lease_id,
            retry_count: to_u32("retry_count", row.retry_count)?,
            max_retries: to_u32("max_retries", row.max_retries)?,
            attempts: to_u32("attempts", row.attempts)?,
            parent_id: row.parent_id.map(JobId::from_uuid),
            recurring_name: row.recurring_name,
            cron_expression: row.cron_expression,
            last_error: row.last_error,
            finished_at: row.finished_at,
        })
    }
}

impl TryFrom<RecurringRecord> for RecurringDefinition {
    type Error = DbError;

    fn try_from(row: RecurringRecord) -> DbResult<Self> {
        let overlap = row
            .overlap
            .parse::<OverlapPolicy>()
            .map_err(|e| DbError::Corrupt(format!("recurring {}: {}", row.name, e)))?;
        let max_retries = row
            .max_retries
            .map(|n| to_u32("max_retries", n))
            .transpose()?;

        Ok(RecurringDefinition {
            name: row.name,
            cron_expression: row.cron_expression,
            queue: row.queue,
            payload_template: Payload::new(row.handler, row.args),
            overlap,
            max_retries,
            last_fired_at: row.last_fired_at,
            next_fire_at: row.next_fire_at,
            last_job_id: row.last_job_id.map(JobId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRecord>) -> DbResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Insert `job`. Returns `false` when the id is already taken.
async fn insert_job<'e, E>(executor: E, job: &Job) -> DbResult<bool>
where
    E: PgExecutor<'e>,
{
    let inserted = sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO jobs (
            id, queue, handler, args, state, created_at, updated_at,
            enqueue_at, lease_expires_at, leased_by, lease_id, retry_count, max_retries, attempts,
            parent_id, recurring_name, cron_expression, last_error, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        ON CONFLICT (id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(&job.queue)
    .bind(&job.payload.handler)
    .bind(&job.payload.args)
    .bind(job.state.as_str())
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.enqueue_at)
    .bind(job.lease_expires_at)
    .bind(&job.leased_by)
    .bind(job.lease_id)
    .bind(to_i32(job.retry_count))
    .bind(to_i32(job.max_retries))
    .bind(to_i32(job.attempts))
    .bind(job.parent_id.map(|id| *id.as_uuid()))
    .bind(&job.recurring_name)
    .bind(&job.cron_expression)
    .bind(&job.last_error)
    .bind(job.finished_at)
    .fetch_optional(executor)
    .await?;
    Ok(inserted.is_some())
}

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: JobId) -> DbResult<bool> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn move_children(
        &self,
        parent: JobId,
        to: JobState,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<JobId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET state = $2,
                updated_at = $3,
                enqueue_at = CASE WHEN $2 = 'enqueued' THEN $3 ELSE enqueue_at END,
                finished_at = CASE WHEN $2 = 'deleted' THEN $3 ELSE finished_at END
            WHERE parent_id = $1 AND state = 'awaiting'
            RETURNING id
            "#,
        )
        .bind(parent.as_uuid())
        .bind(to.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> DbResult<JobId> {
        if insert_job(&self.pool, job).await? {
            Ok(job.id)
        } else {
            Err(DbError::DuplicateJob(job.id))
        }
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        Job::try_from(row)
    }

    async fn compare_and_transition(
        &self,
        id: JobId,
        expected: JobState,
        transition: &Transition,
    ) -> DbResult<bool> {
        transition.check_edge(expected)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $3,
                updated_at = $4,
                enqueue_at = COALESCE($5, enqueue_at),
                retry_count = COALESCE($6, retry_count),
                last_error = COALESCE($7, last_error),
                lease_expires_at = CASE WHEN $3 = 'leased' THEN lease_expires_at ELSE NULL END,
                leased_by = CASE WHEN $3 = 'leased' THEN leased_by ELSE NULL END,
                lease_id = CASE WHEN $3 = 'leased' THEN lease_id ELSE NULL END,
                finished_at = CASE WHEN $3 IN ('succeeded', 'failed', 'deleted') THEN $4 ELSE finished_at END
            WHERE id = $1
              AND state = $2
              AND ($8::uuid IS NULL OR lease_id = $8)
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(transition.to.as_str())
        .bind(transition.at)
        .bind(transition.enqueue_at)
        .bind(transition.retry_count.map(to_i32))
        .bind(&transition.last_error)
        .bind(transition.lease_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists(id).await? {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        debug!(job_id = %id, from = %expected, to = %transition.to, "transition guard did not hold");
        Ok(false)
    }

    async fn acquire_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE jobs
            SET state = 'leased',
                leased_by = $2,
                lease_id = $3,
                lease_expires_at = $4,
                attempts = attempts + 1,
                updated_at = $5
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'enqueued' AND queue = $1
                ORDER BY enqueue_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            AND state = 'enqueued'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(queue)
        .bind(worker_id)
        .bind(Uuid::new_v4())
        .bind(now + lease)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn extend_lease(
        &self,
        id: JobId,
        lease_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = $3
            WHERE id = $1 AND state = 'leased' AND lease_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_error(
        &self,
        id: JobId,
        lease_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET last_error = $3, updated_at = $4
            WHERE id = $1 AND state = 'leased' AND lease_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(lease_id)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>, limit: u32) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE state = 'leased' AND lease_expires_at < $1
            ORDER BY lease_expires_at ASC, id ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn promote_due(&self, now: DateTime<Utc>, batch_size: u32) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'enqueued', updated_at = $1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE state = 'scheduled' AND enqueue_at <= $1
                ORDER BY enqueue_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            AND state = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(i64::from(batch_size))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_children(&self, parent: JobId, now: DateTime<Utc>) -> DbResult<u64> {
        let released = self.move_children(parent, JobState::Enqueued, now).await?;
        Ok(released.len() as u64)
    }

    async fn cancel_children(&self, parent: JobId, now: DateTime<Utc>) -> DbResult<Vec<JobId>> {
        self.move_children(parent, JobState::Deleted, now).await
    }

    async fn parents_with_awaiting_children(&self, limit: u32) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            SELECT {} FROM jobs p
            WHERE p.state IN ('succeeded', 'failed', 'deleted')
              AND EXISTS (
                SELECT 1 FROM jobs c WHERE c.parent_id = p.id AND c.state = 'awaiting'
              )
            ORDER BY p.id ASC
            LIMIT $1
            "#,
            JOB_COLUMNS
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        into_jobs(rows)
    }

    async fn query(&self, query: &JobQuery) -> DbResult<Page<Job>> {
        let backward = query.before.is_some() && query.after.is_none();

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE TRUE", JOB_COLUMNS));
        if let Some(state) = query.state {
            builder.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(queue) = &query.queue {
            builder.push(" AND queue = ").push_bind(queue.clone());
        }
        if let Some(after) = query.after {
            builder.push(" AND id > ").push_bind(*after.as_uuid());
        }
        if let Some(before) = query.before {
            builder.push(" AND id < ").push_bind(*before.as_uuid());
        }
        builder.push(if backward {
            " ORDER BY id DESC"
        } else {
            " ORDER BY id ASC"
        });
        builder
            .push(" LIMIT ")
            .push_bind(i64::from(query.effective_limit()) + 1);

        let rows = builder
            .build_query_as::<JobRecord>()
            .fetch_all(&self.pool)
            .await?;
        let mut items = into_jobs(rows)?;
        if backward {
            items.reverse();
        }
        Ok(Page::from_window(items, query))
    }

    async fn counts(&self) -> DbResult<Vec<StateCount>> {
        let rows = sqlx::query_as::<_, CountRecord>(
            r#"
            SELECT queue, state, COUNT(*) AS count
            FROM jobs
            GROUP BY queue, state
            ORDER BY queue, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let state = row
                    .state
                    .parse::<JobState>()
                    .map_err(|e| DbError::Corrupt(e.to_string()))?;
                Ok(StateCount {
                    queue: row.queue,
                    state,
                    count: u64::try_from(row.count).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn purge_finished(
        &self,
        state: JobState,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<u64> {
        if !state.is_terminal() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT p.id FROM jobs p
                WHERE p.state = $1 AND p.finished_at < $2
                  AND NOT EXISTS (
                    SELECT 1 FROM jobs c WHERE c.parent_id = p.id AND c.state = 'awaiting'
                  )
                ORDER BY p.id ASC
                LIMIT $3
            )
            "#,
        )
        .bind(state.as_str())
        .bind(cutoff)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_recurring(&self, definition: &RecurringDefinition) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO recurring_definitions (
                name, cron_expression, queue, handler, args, overlap, max_retries,
                last_fired_at, next_fire_at, last_job_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (name) DO UPDATE SET
                cron_expression = EXCLUDED.cron_expression,
                queue = EXCLUDED.queue,
                handler = EXCLUDED.handler,
                args = EXCLUDED.args,
                overlap = EXCLUDED.overlap,
                max_retries = EXCLUDED.max_retries,
                next_fire_at = EXCLUDED.next_fire_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.cron_expression)
        .bind(&definition.queue)
        .bind(&definition.payload_template.handler)
        .bind(&definition.payload_template.args)
        .bind(definition.overlap.as_str())
        .bind(definition.max_retries.map(to_i32))
        .bind(definition.last_fired_at)
        .bind(definition.next_fire_at)
        .bind(definition.last_job_id.map(|id| *id.as_uuid()))
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_recurring(&self, name: &str) -> DbResult<Option<RecurringDefinition>> {
        let row = sqlx::query_as::<_, RecurringRecord>(&format!(
            "SELECT {} FROM recurring_definitions WHERE name = $1",
            RECURRING_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RecurringDefinition::try_from).transpose()
    }

    async fn list_recurring(&self) -> DbResult<Vec<RecurringDefinition>> {
        let rows = sqlx::query_as::<_, RecurringRecord>(&format!(
            "SELECT {} FROM recurring_definitions ORDER BY name",
            RECURRING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RecurringDefinition::try_from).collect()
    }

    async fn remove_recurring(&self, name: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM recurring_definitions WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<RecurringDefinition>> {
        let rows = sqlx::query_as::<_, RecurringRecord>(&format!(
            r#"
            SELECT {} FROM recurring_definitions
            WHERE next_fire_at <= $1
            ORDER BY next_fire_at ASC, name ASC
            LIMIT $2
            "#,
            RECURRING_COLUMNS
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RecurringDefinition::try_from).collect()
    }

    async fn has_active_instance(&self, name: &str) -> DbResult<bool> {
        let active = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE recurring_name = $1
                  AND state NOT IN ('succeeded', 'failed', 'deleted')
            )
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    async fn fire_recurring(&self, fire: &RecurringFire) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE recurring_definitions
            SET next_fire_at = $3,
                last_fired_at = $4,
                updated_at = $4,
                last_job_id = COALESCE($5, last_job_id)
            WHERE name = $1 AND next_fire_at = $2
            "#,
        )
        .bind(&fire.name)
        .bind(fire.expected_next_fire_at)
        .bind(fire.next_fire_at)
        .bind(fire.fired_at)
        .bind(fire.job.as_ref().map(|job| *job.id.as_uuid()))
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(job) = &fire.job {
            if !insert_job(&mut *tx, job).await? {
                tx.rollback().await?;
                return Err(DbError::DuplicateJob(job.id));
            }
        }

        tx.commit().await?;
        Ok(true)
    }
}
