use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Postgres, postgres::PgPoolOptions};
use uuid::Uuid;

use crate::domain::{
    models::{
        AttemptOutcome, DeliveryAttempt, DeliveryChannel, DeliveryJob, JobState, Message,
        MessageParts, MessageStatus, NewJob, RecurrencePattern, User,
    },
    repositories::{JobQueue, MessageRepository, UserRepository},
};

pub type PgPool = Pool<Postgres>;

const ACTIVE_STATES: &str = "('available', 'retryable', 'running')";
const UNIQUE_VIOLATION: &str = "23505";
const ENQUEUE_RETRIES: usize = 3;

/// Connects to Postgres and applies the bundled migrations.
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .context("failed to connect to postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, email, display_name, push_token, email_enabled, push_enabled,
                   created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(User::from))
    }

    async fn upsert(&self, user: &User) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, email, display_name, push_token, email_enabled, push_enabled,
                created_at, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (id) DO UPDATE
            SET email = EXCLUDED.email,
                display_name = EXCLUDED.display_name,
                push_token = EXCLUDED.push_token,
                email_enabled = EXCLUDED.email_enabled,
                push_enabled = EXCLUDED.push_enabled,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.push_token)
        .bind(user.email_enabled)
        .bind(user.push_enabled)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresMessageRepository {
    pool: PgPool,
}

impl PostgresMessageRepository {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

const MESSAGE_COLUMNS: &str = "id, user_id, title, body, deliver_at, timezone, status, channel, \
     recurrence, reminder_minutes, created_at, updated_at, delivered_at";

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    async fn insert(&self, message: &Message) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, user_id, title, body, deliver_at, timezone, status, channel,
                recurrence, reminder_minutes, created_at, updated_at, delivered_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            "#,
        )
        .bind(message.id())
        .bind(message.user_id())
        .bind(message.title())
        .bind(message.body())
        .bind(message.deliver_at())
        .bind(message.timezone())
        .bind(message.status().as_str())
        .bind(message.channel().as_str())
        .bind(message.recurrence().as_str())
        .bind(message.reminder_minutes().map(|m| m as i32))
        .bind(message.created_at())
        .bind(message.updated_at())
        .bind(message.delivered_at())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Message>> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(Message::try_from).transpose()
    }

    async fn update_if(&self, message: &Message, expected: MessageStatus) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET title = $2,
                body = $3,
                deliver_at = $4,
                timezone = $5,
                status = $6,
                channel = $7,
                recurrence = $8,
                reminder_minutes = $9,
                updated_at = $10,
                delivered_at = $11
            WHERE id = $1 AND status = $12
            "#,
        )
        .bind(message.id())
        .bind(message.title())
        .bind(message.body())
        .bind(message.deliver_at())
        .bind(message.timezone())
        .bind(message.status().as_str())
        .bind(message.channel().as_str())
        .bind(message.recurrence().as_str())
        .bind(message.reminder_minutes().map(|m| m as i32))
        .bind(message.updated_at())
        .bind(message.delivered_at())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM messages WHERE id = $1")
            .bind(message.id())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            anyhow::bail!("message {} does not exist", message.id());
        }
        Ok(false)
    }

    async fn find_due_before(
        &self,
        instant: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = 'scheduled' AND deliver_at <= $1 \
             ORDER BY deliver_at ASC LIMIT $2"
        ))
        .bind(instant)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn find_by_status(
        &self,
        status: MessageStatus,
        limit: u32,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = $1 ORDER BY deliver_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn find_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE status = 'scheduled' AND deliver_at >= $1 AND deliver_at < $2"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn log_attempt(&self, attempt: DeliveryAttempt) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                id, message_id, attempt_number, outcome, detail, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.message_id)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.detail)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, message_id: Uuid) -> anyhow::Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRecord>(
            r#"
            SELECT id, message_id, attempt_number, outcome, detail, created_at
            FROM delivery_attempts
            WHERE message_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeliveryAttempt::try_from).collect()
    }
}

#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    async fn try_enqueue(&self, job: &NewJob, now: DateTime<Utc>) -> sqlx::Result<JobRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "UPDATE delivery_jobs \
             SET state = 'cancelled', leased_until = NULL, updated_at = $2 \
             WHERE message_id = $1 AND state IN {ACTIVE_STATES}"
        ))
        .bind(job.message_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let record = insert_job(&mut tx, job, now).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn finish_running(
        &self,
        job_id: Uuid,
        state: JobState,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = $2, last_error = $3, leased_until = NULL, updated_at = $4
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(state.as_str())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

const JOB_COLUMNS: &str = "id, message_id, queue, scheduled_at, attempt, max_attempts, state, \
     leased_until, last_error, created_at, updated_at";

async fn insert_job(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    job: &NewJob,
    now: DateTime<Utc>,
) -> sqlx::Result<JobRecord> {
    sqlx::query_as::<_, JobRecord>(&format!(
        "INSERT INTO delivery_jobs ( \
             id, message_id, queue, scheduled_at, attempt, max_attempts, state, \
             created_at, updated_at \
         ) \
         VALUES ($1, $2, $3, $4, 0, $5, 'available', $6, $6) \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(job.message_id)
    .bind(&job.queue)
    .bind(job.scheduled_at)
    .bind(job.max_attempts as i32)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> anyhow::Result<DeliveryJob> {
        // A concurrent enqueue for the same message can commit between our
        // UPDATE and INSERT; the partial unique index rejects the loser, which
        // simply tries again.
        let mut last_err = None;
        for _ in 0..ENQUEUE_RETRIES {
            match self.try_enqueue(&job, now).await {
                Ok(record) => return record.try_into(),
                Err(err) if is_unique_violation(&err) => last_err = Some(err),
                Err(err) => return Err(err.into()),
            }
        }
        Err(anyhow::anyhow!(
            "failed to enqueue job for message {}: {:?}",
            job.message_id,
            last_err
        ))
    }

    async fn lease(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<DeliveryJob>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "UPDATE delivery_jobs \
             SET state = 'running', leased_until = $3, updated_at = $2 \
             WHERE id = ( \
                 SELECT id FROM delivery_jobs \
                 WHERE queue = $1 \
                   AND scheduled_at <= $2 \
                   AND (state IN ('available', 'retryable') \
                        OR (state = 'running' AND leased_until < $2)) \
                 ORDER BY scheduled_at ASC, attempt ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(queue)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;
        record.map(DeliveryJob::try_from).transpose()
    }

    async fn complete(
        &self,
        job_id: Uuid,
        follow_up: Option<NewJob>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'completed', leased_until = NULL, updated_at = $2
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(follow_up) = follow_up {
            insert_job(&mut tx, &follow_up, now).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn retry(
        &self,
        job_id: Uuid,
        next_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'retryable',
                attempt = attempt + 1,
                scheduled_at = $2,
                last_error = $3,
                leased_until = NULL,
                updated_at = $4
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(next_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn discard(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.finish_running(job_id, JobState::Discarded, error, now)
            .await
    }

    async fn cancel_active(&self, message_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE delivery_jobs \
             SET state = 'cancelled', leased_until = NULL, updated_at = $2 \
             WHERE message_id = $1 AND state IN {ACTIVE_STATES}"
        ))
        .bind(message_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_active(&self, message_id: Uuid) -> anyhow::Result<Option<DeliveryJob>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs \
             WHERE message_id = $1 AND state IN {ACTIVE_STATES}"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(DeliveryJob::try_from).transpose()
    }

    async fn list_active_between(
        &self,
        queue: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DeliveryJob>> {
        let rows = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs \
             WHERE queue = $1 AND state IN {ACTIVE_STATES} \
               AND scheduled_at >= $2 AND scheduled_at < $3"
        ))
        .bind(queue)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeliveryJob::try_from).collect()
    }
}

#[derive(FromRow)]
struct UserRecord {
    id: Uuid,
    email: String,
    display_name: Option<String>,
    push_token: Option<String>,
    email_enabled: bool,
    push_enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRecord> for User {
    fn from(value: UserRecord) -> Self {
        Self {
            id: value.id,
            email: value.email,
            display_name: value.display_name,
            push_token: value.push_token,
            email_enabled: value.email_enabled,
            push_enabled: value.push_enabled,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MessageRecord {
    id: Uuid,
    user_id: Uuid,
    title: String,
    body: String,
    deliver_at: DateTime<Utc>,
    timezone: String,
    status: String,
    channel: String,
    recurrence: String,
    reminder_minutes: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = anyhow::Error;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let status = MessageStatus::from_str(&value.status)
            .ok_or_else(|| anyhow::anyhow!("unknown message status {}", value.status))?;
        let channel = DeliveryChannel::from_str(&value.channel)
            .ok_or_else(|| anyhow::anyhow!("unknown delivery channel {}", value.channel))?;
        let recurrence = RecurrencePattern::from_str(&value.recurrence)
            .ok_or_else(|| anyhow::anyhow!("unknown recurrence {}", value.recurrence))?;
        let reminder_minutes = value
            .reminder_minutes
            .map(u32::try_from)
            .transpose()
            .context("negative reminder lead time")?;

        Ok(Message::restore(MessageParts {
            id: value.id,
            user_id: value.user_id,
            title: value.title,
            body: value.body,
            deliver_at: value.deliver_at,
            timezone: value.timezone,
            status,
            channel,
            recurrence,
            reminder_minutes,
            created_at: value.created_at,
            updated_at: value.updated_at,
            delivered_at: value.delivered_at,
        }))
    }
}

#[derive(FromRow)]
struct AttemptRecord {
    id: Uuid,
    message_id: Uuid,
    attempt_number: i32,
    outcome: String,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AttemptRecord> for DeliveryAttempt {
    type Error = anyhow::Error;

    fn try_from(value: AttemptRecord) -> Result<Self, Self::Error> {
        let outcome = AttemptOutcome::from_str(&value.outcome)
            .ok_or_else(|| anyhow::anyhow!("unknown attempt outcome {}", value.outcome))?;
        Ok(Self {
            id: value.id,
            message_id: value.message_id,
            attempt_number: value.attempt_number as u32,
            outcome,
            detail: value.detail,
            created_at: value.created_at,
        })
    }
}

#[derive(FromRow)]
struct JobRecord {
    id: Uuid,
    message_id: Uuid,
    queue: String,
    scheduled_at: DateTime<Utc>,
    attempt: i32,
    max_attempts: i32,
    state: String,
    leased_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for DeliveryJob {
    type Error = anyhow::Error;

    fn try_from(value: JobRecord) -> Result<Self, Self::Error> {
        let state = JobState::from_str(&value.state)
            .ok_or_else(|| anyhow::anyhow!("unknown job state {}", value.state))?;
        Ok(Self {
            id: value.id,
            message_id: value.message_id,
            queue: value.queue,
            scheduled_at: value.scheduled_at,
            attempt: value.attempt as u32,
            max_attempts: value.max_attempts as u32,
            state,
            leased_until: value.leased_until,
            last_error: value.last_error,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}
