//! The six (plus `create_queue`) parameterised statements the rest of the
//! crate is built on top of. Every function here is a single round trip and
//! is generic over `sqlx::Executor`, so callers can pass either a pooled
//! connection or an open transaction - mirroring the teacher's
//! `base_ops`/`ops::worker` shape.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::{Bytes, PolledMessage, QueueStatistics};

pub async fn create_queue<'c, E>(
    executor: E,
    name: &str,
    ack_deadline: ChronoDuration,
    retention_period: ChronoDuration,
    max_delivery_attempts: i32,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO pgjobq.queues (name, ack_deadline_millis, retention_period_seconds, max_delivery_attempts)
VALUES ($1, $2, $3, $4)
ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(name)
    .bind(ack_deadline.num_milliseconds())
    .bind(retention_period.num_seconds())
    .bind(max_delivery_attempts)
    .execute(executor)
    .await?;

    Ok(())
}

/// Publish one message. Atomic: the `published_notification` CTE only runs
/// (and so the NOTIFY is only emitted) if `queue_info` resolves a row, and
/// the insert only happens if the notification CTE ran - so a publish to a
/// nonexistent queue neither inserts a row nor emits a notification.
pub async fn publish<'c, E>(
    executor: E,
    queue_name: &str,
    message_id: Uuid,
    body: &[u8],
    delay: Option<ChronoDuration>,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let delay_seconds = delay.unwrap_or_default().num_seconds();

    let inserted: Option<(i32,)> = sqlx::query_as(
        r#"
WITH queue_info AS (
    SELECT
        id AS queue_id,
        retention_period_seconds,
        max_delivery_attempts
    FROM pgjobq.queues
    WHERE name = $1
), published_notification AS (
    SELECT pg_notify('pgjobq.new_job', $1)
)
INSERT INTO pgjobq.messages (queue_id, id, expires_at, delivery_attempts_remaining, available_at, body)
SELECT
    queue_id,
    $2,
    now() + (retention_period_seconds || ' seconds')::interval,
    max_delivery_attempts,
    now() + ($4 || ' seconds')::interval,
    $3
FROM queue_info
LEFT JOIN published_notification ON 1 = 1
RETURNING 1
        "#,
    )
    .bind(queue_name)
    .bind(message_id)
    .bind(body)
    .bind(delay_seconds)
    .fetch_optional(executor)
    .await?;

    if inserted.is_none() {
        return Err(QueueError::QueueNotFound(queue_name.to_owned()));
    }

    Ok(())
}

#[derive(FromRow)]
struct PolledRow {
    id: Uuid,
    next_ack_deadline: DateTime<Utc>,
    body: Bytes,
}

impl From<PolledRow> for PolledMessage {
    fn from(row: PolledRow) -> Self {
        PolledMessage {
            id: row.id,
            body: row.body,
            next_ack_deadline: row.next_ack_deadline,
        }
    }
}

/// Poll up to `batch_size` deliverable rows. `fifo` selects ascending
/// insertion order; otherwise no order is imposed. `FOR UPDATE SKIP LOCKED`
/// keeps two concurrent pollers from ever selecting the same row.
pub async fn poll<'c, E>(
    executor: E,
    queue_name: &str,
    batch_size: i64,
    fifo: bool,
) -> Result<Vec<PolledMessage>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    // `id` is an opaque v4 UUID with no ordering guarantee - FIFO orders by
    // `sequence`, the table's monotonic insertion-order column, instead.
    let order_by = if fifo { "ORDER BY sequence" } else { "" };
    let sql = format!(
        r#"
WITH queue_info AS (
    SELECT id, ack_deadline_millis
    FROM pgjobq.queues
    WHERE name = $1
), selected_messages AS (
    SELECT id
    FROM pgjobq.messages
    WHERE (
        delivery_attempts_remaining != 0
        AND expires_at > now()
        AND available_at < now()
        AND queue_id = (SELECT id FROM queue_info)
    )
    {order_by}
    FOR UPDATE SKIP LOCKED
    LIMIT $2
)
UPDATE pgjobq.messages
SET
    available_at = now() + (SELECT (ack_deadline_millis || ' milliseconds')::interval FROM queue_info),
    delivery_attempts_remaining = delivery_attempts_remaining - 1
FROM selected_messages
WHERE pgjobq.messages.id = selected_messages.id
RETURNING pgjobq.messages.id AS id, available_at AS next_ack_deadline, body
        "#
    );

    let rows: Vec<PolledRow> = sqlx::query_as(&sql)
        .bind(queue_name)
        .bind(batch_size)
        .fetch_all(executor)
        .await?;

    Ok(rows.into_iter().map(PolledMessage::from).collect())
}

/// Delete the row and emit `pgjobq.job_completed` in the same statement, so
/// a subscriber observing the notification may assume the row is gone.
/// No-op (no error) if the row is already gone.
pub async fn ack<'c, E>(executor: E, queue_name: &str, job_id: Uuid) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let payload = format!("{queue_name},{job_id}");
    sqlx::query(
        r#"
WITH msg AS (
    SELECT pg_notify('pgjobq.job_completed', $3)
)
DELETE FROM pgjobq.messages
WHERE queue_id = (SELECT id FROM pgjobq.queues WHERE name = $1)
    AND id = $2
    AND 1 = (SELECT 1 FROM msg)
        "#,
    )
    .bind(queue_name)
    .bind(job_id)
    .bind(payload)
    .execute(executor)
    .await?;

    Ok(())
}

/// Make a message immediately redeliverable. Consumes no further delivery
/// attempt beyond the one the poll that produced this handle already spent.
pub async fn nack<'c, E>(executor: E, queue_name: &str, job_id: Uuid) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
WITH msg AS (
    SELECT pg_notify('pgjobq.new_job', $1)
)
UPDATE pgjobq.messages
SET available_at = now()
WHERE queue_id = (SELECT id FROM pgjobq.queues WHERE name = $1)
    AND id = $2
    AND 1 = (SELECT 1 FROM msg)
        "#,
    )
    .bind(queue_name)
    .bind(job_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Extend a message's lease. Returns `None` if the row's lock couldn't be
/// acquired (another statement holds it) - the caller should treat that as
/// "this handle has moved on".
pub async fn extend_deadline<'c, E>(
    executor: E,
    queue_name: &str,
    job_id: Uuid,
) -> Result<Option<DateTime<Utc>>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
WITH message_for_update AS (
    SELECT id, queue_id
    FROM pgjobq.messages
    WHERE queue_id = (SELECT id FROM pgjobq.queues WHERE name = $1) AND id = $2
    FOR UPDATE SKIP LOCKED
)
UPDATE pgjobq.messages
SET available_at = now() + (
    SELECT (ack_deadline_millis || ' milliseconds')::interval
    FROM pgjobq.queues
    WHERE pgjobq.queues.id = (SELECT queue_id FROM message_for_update)
)
WHERE pgjobq.messages.id = (SELECT id FROM message_for_update)
RETURNING available_at
        "#,
    )
    .bind(queue_name)
    .bind(job_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(deadline,)| deadline))
}

/// `total` counts rows with remaining attempts that haven't expired;
/// `undelivered` additionally requires the row to be currently eligible for
/// delivery (never delivered, or nacked and not yet re-picked-up).
pub async fn statistics<'c, E>(executor: E, queue_name: &str) -> Result<QueueStatistics, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row: (i64, i64) = sqlx::query_as(
        r#"
SELECT
    COUNT(*) FILTER (WHERE delivery_attempts_remaining != 0 AND expires_at > now()) AS total,
    COUNT(*) FILTER (
        WHERE delivery_attempts_remaining != 0 AND expires_at > now() AND available_at <= now()
    ) AS undelivered
FROM pgjobq.messages
WHERE queue_id = (SELECT id FROM pgjobq.queues WHERE name = $1)
        "#,
    )
    .bind(queue_name)
    .fetch_one(executor)
    .await?;

    Ok(QueueStatistics {
        total_messages_in_queue: row.0,
        undelivered_messages: row.1,
    })
}
