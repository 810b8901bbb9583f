//! Postgres backend for the durable substrate.
//!
//! Tables live in `migrations/`. Signals are push-free: a blocked receive
//! polls the mailbox at `recv_poll_interval` until its deadline.
//!
//! Signal ids are per-mailbox sequence numbers, not table ids. A sender holds
//! the `workflow_mailboxes` row lock from allocating its slot until commit, so
//! slots become visible in order and a cursor never jumps past a signal that
//! is still in flight.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::{fmt, str::FromStr, time::Duration};
use tracing::{debug, info};

use crate::error::{Result, ScanflowError};

use super::{
    config::QueueConfig,
    events::{EventKind, EventLog, WorkflowEvent},
    record::{InsertOutcome, NewWorkflow, WorkflowId, WorkflowRecord, WorkflowStatus},
    signal::{Signal, SignalBus},
    store::WorkflowStore,
};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    recv_poll_interval: Duration,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("recv_poll_interval", &self.recv_poll_interval)
            .finish()
    }
}

#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    name: String,
    queue: String,
    status: String,
    input: Value,
    output: Option<Value>,
    error: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for WorkflowRecord {
    type Error = ScanflowError;

    fn try_from(row: WorkflowRow) -> Result<Self> {
        Ok(WorkflowRecord {
            id: WorkflowId::from(row.id),
            name: row.name,
            queue: row.queue,
            status: WorkflowStatus::from_str(&row.status)?,
            input: row.input,
            output: row.output,
            error: row.error,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            attempts: row.attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    seq: i64,
    kind: Value,
    recorded_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct SignalRow {
    mailbox_seq: i64,
    topic: String,
    payload: Value,
    sent_at: DateTime<Utc>,
}

const WORKFLOW_COLUMNS: &str = "id, name, queue, status, input, output, error, lease_owner, \
                                lease_expires_at, attempts, created_at, updated_at";

impl PostgresStore {
    /// Wrap `pool` after a health check. Run [`crate::MIGRATOR`] first.
    pub async fn new(pool: PgPool, recv_poll_interval: Duration) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                ScanflowError::Internal(format!("Workflow store failed Postgres health check: {e}"))
            })?;
        info!("Workflow store connected to Postgres");
        Ok(Self {
            pool,
            recv_poll_interval: recv_poll_interval.max(Duration::from_millis(10)),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1");
        sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(WorkflowRecord::try_from)
            .transpose()
    }

    /// Finish a running instance owned by `executor_id`.
    async fn settle(
        &self,
        id: &WorkflowId,
        executor_id: &str,
        status: WorkflowStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET status = $3,
                output = $4,
                error = $5,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lease_owner = $2
            "#,
        )
        .bind(id.as_str())
        .bind(executor_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ScanflowError::Fenced(format!(
                "workflow {id} is not leased by {executor_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PostgresStore {
    async fn insert_workflow(&self, new: NewWorkflow) -> Result<InsertOutcome> {
        let sql = format!(
            r#"
            INSERT INTO workflows (id, name, queue, status, input, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, 'enqueued', $4, 0, NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            RETURNING {WORKFLOW_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(new.id.as_str())
            .bind(&new.name)
            .bind(&new.queue)
            .bind(&new.input)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(InsertOutcome {
                record: row.try_into()?,
                created: true,
            }),
            None => {
                let record = self.fetch_workflow(&new.id).await?.ok_or_else(|| {
                    ScanflowError::Internal(format!("workflow {} vanished after conflict", new.id))
                })?;
                Ok(InsertOutcome {
                    record,
                    created: false,
                })
            }
        }
    }

    async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>> {
        self.fetch_workflow(id).await
    }

    async fn claim_next(
        &self,
        queue: &QueueConfig,
        executor_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<Option<WorkflowRecord>> {
        let mut tx = self.pool.begin().await?;

        if let Some(limit) = queue.concurrency {
            // Serialize claimers of this queue so the running count below
            // cannot be raced past the ceiling.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(&queue.name)
                .execute(&mut *tx)
                .await?;
            let running: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM workflows WHERE queue = $1 AND status = 'running'",
            )
            .bind(&queue.name)
            .fetch_one(&mut *tx)
            .await?;
            if running >= limit as i64 {
                return Ok(None);
            }
        }

        let expires_at = Utc::now() + lease_ttl;
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                FROM workflows
                WHERE queue = $1 AND status = 'enqueued'
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE workflows w
            SET status = 'running',
                lease_owner = $2,
                lease_expires_at = $3,
                attempts = w.attempts + 1,
                updated_at = NOW()
            FROM next
            WHERE w.id = next.id
            RETURNING {}
            "#,
            WORKFLOW_COLUMNS
                .split(", ")
                .map(|column| format!("w.{column}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let claimed = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(&queue.name)
            .bind(executor_id)
            .bind(expires_at)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        let record = claimed.map(WorkflowRecord::try_from).transpose()?;
        if let Some(record) = &record {
            debug!(workflow_id = %record.id, queue = %queue.name, "claimed workflow");
        }
        Ok(record)
    }

    async fn renew_lease(
        &self,
        id: &WorkflowId,
        executor_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET lease_expires_at = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND lease_owner = $2
            "#,
        )
        .bind(id.as_str())
        .bind(executor_id)
        .bind(Utc::now() + lease_ttl)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn complete_workflow(
        &self,
        id: &WorkflowId,
        executor_id: &str,
        output: Value,
    ) -> Result<()> {
        self.settle(id, executor_id, WorkflowStatus::Succeeded, Some(output), None)
            .await
    }

    async fn fail_workflow(&self, id: &WorkflowId, executor_id: &str, error: String) -> Result<()> {
        self.settle(id, executor_id, WorkflowStatus::Failed, None, Some(error))
            .await
    }

    async fn expire_leases(&self) -> Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'enqueued',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running' AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn release_executor_leases(&self, executor_id: &str) -> Result<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'enqueued',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running' AND lease_owner = $1
            "#,
        )
        .bind(executor_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }
}

#[async_trait]
impl EventLog for PostgresStore {
    async fn load_events(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT seq, kind, recorded_at FROM workflow_events WHERE workflow_id = $1 ORDER BY seq",
        )
        .bind(workflow_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<WorkflowEvent> {
                Ok(WorkflowEvent {
                    seq: row.seq.max(0) as u64,
                    kind: serde_json::from_value::<EventKind>(row.kind)?,
                    recorded_at: row.recorded_at,
                })
            })
            .collect()
    }

    async fn append_event(&self, workflow_id: &WorkflowId, event: WorkflowEvent) -> Result<()> {
        let kind = serde_json::to_value(&event.kind)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_events (workflow_id, seq, kind, recorded_at)
            SELECT $1, $2, $3, $4
            WHERE (SELECT COUNT(*) FROM workflow_events WHERE workflow_id = $1) = $2
            ON CONFLICT (workflow_id, seq) DO NOTHING
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event.seq as i64)
        .bind(kind)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(ScanflowError::Fenced(format!(
                "workflow {workflow_id}: seq {} is not the next slot",
                event.seq
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalBus for PostgresStore {
    async fn send(
        &self,
        destination: &WorkflowId,
        topic: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let (seq,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO workflow_mailboxes (workflow_id, topic, last_seq)
            VALUES ($1, $2, 1)
            ON CONFLICT (workflow_id, topic)
            DO UPDATE SET last_seq = workflow_mailboxes.last_seq + 1
            RETURNING last_seq
            "#,
        )
        .bind(destination.as_str())
        .bind(topic)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_signals
                (workflow_id, topic, mailbox_seq, payload, idempotency_key, sent_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(destination.as_str())
        .bind(topic)
        .bind(seq)
        .bind(payload)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Duplicate delivery; give the slot back.
            tx.rollback().await?;
            debug!(workflow_id = %destination, topic, ?idempotency_key, "duplicate signal dropped");
            return Ok(());
        }
        tx.commit().await?;
        Ok(())
    }

    async fn next_signal(
        &self,
        workflow_id: &WorkflowId,
        topic: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<Signal>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let row = sqlx::query_as::<_, SignalRow>(
                r#"
                SELECT mailbox_seq, topic, payload, sent_at
                FROM workflow_signals
                WHERE workflow_id = $1 AND topic = $2 AND mailbox_seq > $3
                ORDER BY mailbox_seq
                LIMIT 1
                "#,
            )
            .bind(workflow_id.as_str())
            .bind(topic)
            .bind(after as i64)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                return Ok(Some(Signal {
                    id: row.mailbox_seq.max(0) as u64,
                    topic: row.topic,
                    payload: row.payload,
                    sent_at: row.sent_at,
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until((now + self.recv_poll_interval).min(deadline)).await;
        }
    }
}
