//! Event log storage: stream/cursor bookkeeping, append, replay, ack+trim,
//! and the handful of read-only lookups (Save ownership, usage rows) that
//! the duplex subsystem needs from tables it doesn't otherwise own.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::{DeviceCursor, Event, Save, UsageRow};

pub type DbPool = PgPool;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/para".to_string()),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

pub async fn init_db(config: DbConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    Ok(pool)
}

pub async fn init_db_default() -> Result<DbPool> {
    init_db(DbConfig::default()).await
}

// ---------------------------------------------------------------------
// Save ownership
// ---------------------------------------------------------------------

/// Looks up a Save by id. Returns `None` if it doesn't exist; callers
/// check ownership and soft-delete status via `Save::is_owned_by`.
pub async fn get_save(pool: &DbPool, save_id: &str) -> Result<Option<Save>> {
    let save = sqlx::query_as::<_, Save>(
        "SELECT id, user_id, name, created_at, deleted_at FROM saves WHERE id = $1",
    )
    .bind(save_id)
    .fetch_optional(pool)
    .await
    .context("failed to look up save")?;
    Ok(save)
}

// ---------------------------------------------------------------------
// Device cursors
// ---------------------------------------------------------------------

pub async fn device_cursor_exists(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    device_id: &str,
) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM ws_device_cursors \
         WHERE user_id = $1 AND save_id = $2 AND device_id = $3)",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(device_id)
    .fetch_one(pool)
    .await
    .context("failed to check device cursor existence")?;
    Ok(exists)
}

pub async fn count_device_cursors(pool: &DbPool, user_id: &str, save_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM ws_device_cursors WHERE user_id = $1 AND save_id = $2",
    )
    .bind(user_id)
    .bind(save_id)
    .fetch_one(pool)
    .await
    .context("failed to count device cursors")?;
    Ok(count)
}

pub async fn ensure_device_cursor(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    device_id: &str,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO ws_device_cursors (user_id, save_id, device_id, last_acked_seq, created_at, updated_at) \
         VALUES ($1, $2, $3, 0, $4, $4) \
         ON CONFLICT (user_id, save_id, device_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(device_id)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to ensure device cursor")?;
    Ok(())
}

pub async fn get_device_last_acked_seq(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    device_id: &str,
) -> Result<i64> {
    let seq = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT last_acked_seq FROM ws_device_cursors \
         WHERE user_id = $1 AND save_id = $2 AND device_id = $3",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch device cursor")?
    .flatten();
    Ok(seq.unwrap_or(0))
}

pub async fn get_trimmed_upto_seq(pool: &DbPool, user_id: &str, save_id: &str) -> Result<i64> {
    let trimmed = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT trimmed_upto_seq FROM ws_streams WHERE user_id = $1 AND save_id = $2",
    )
    .bind(user_id)
    .bind(save_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch trimmed_upto_seq")?
    .flatten();
    Ok(trimmed.unwrap_or(0))
}

// ---------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------

/// Appends an event to the stream, reserving its seq transactionally:
/// upsert the stream row if missing, then atomically increment
/// `next_seq` and use the pre-increment value as this event's seq.
/// Returns the appended row. Callers are responsible for notifying
/// subscribers only after this returns Ok (i.e. after commit).
pub async fn append_typed_event(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    frame_type: &str,
    payload_json: Option<serde_json::Value>,
    ack_required: bool,
) -> Result<Event> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query(
        "INSERT INTO ws_streams (user_id, save_id, next_seq, trimmed_upto_seq, created_at, updated_at) \
         VALUES ($1, $2, 1, 0, $3, $3) \
         ON CONFLICT (user_id, save_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to upsert stream row")?;

    let seq: i64 = sqlx::query_scalar(
        "UPDATE ws_streams SET next_seq = next_seq + 1, updated_at = $3 \
         WHERE user_id = $1 AND save_id = $2 \
         RETURNING (next_seq - 1)",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("failed to reserve seq")?;

    sqlx::query(
        "INSERT INTO ws_events (user_id, save_id, seq, frame_type, payload_json, ack_required, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(seq)
    .bind(frame_type)
    .bind(&payload_json)
    .bind(ack_required)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to insert event row")?;

    tx.commit().await.context("failed to commit append")?;

    Ok(Event {
        user_id: user_id.to_string(),
        save_id: save_id.to_string(),
        seq,
        frame_type: frame_type.to_string(),
        payload_json,
        ack_required,
        created_at: now,
    })
}

/// Convenience wrapper for the common case: an application event with
/// `frame_type = "EVENT"`, ack not required.
pub async fn append_event(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    payload_json: serde_json::Value,
) -> Result<Event> {
    append_typed_event(
        pool,
        user_id,
        save_id,
        crate::models::frame_type::EVENT,
        Some(payload_json),
        false,
    )
    .await
}

// ---------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------

/// Events strictly after `resume_from`, clamped to what the log still
/// retains (i.e. `max(resume_from, trimmed_upto_seq)`), in seq order.
pub async fn get_events_after(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    resume_from: i64,
) -> Result<Vec<Event>> {
    let trimmed = get_trimmed_upto_seq(pool, user_id, save_id).await?;
    let effective_resume_from = resume_from.max(trimmed);

    let events = sqlx::query_as::<_, Event>(
        "SELECT user_id, save_id, seq, frame_type, payload_json, ack_required, created_at \
         FROM ws_events \
         WHERE user_id = $1 AND save_id = $2 AND seq > $3 \
         ORDER BY seq ASC",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(effective_resume_from)
    .fetch_all(pool)
    .await
    .context("failed to fetch events after cursor")?;

    Ok(events)
}

// ---------------------------------------------------------------------
// Ack + trim
// ---------------------------------------------------------------------

/// Acknowledges `cursor` for `device_id`, clamped to the highest seq the
/// log actually holds and never allowed to move backward for that
/// device. Recomputes the minimum acked seq across all devices on the
/// stream; if it has advanced past the current trim point, advances the
/// trim point and deletes the now-fully-acked events. Returns the
/// effective (bounded, monotonic) cursor that was recorded.
pub async fn ack_device_cursor_and_maybe_trim(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    device_id: &str,
    cursor: i64,
) -> Result<i64> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin ack transaction")?;

    sqlx::query(
        "INSERT INTO ws_streams (user_id, save_id, next_seq, trimmed_upto_seq, created_at, updated_at) \
         VALUES ($1, $2, 1, 0, $3, $3) \
         ON CONFLICT (user_id, save_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to upsert stream row for ack")?;

    let (next_seq, current_trimmed): (i64, i64) = sqlx::query_as(
        "SELECT next_seq, trimmed_upto_seq FROM ws_streams \
         WHERE user_id = $1 AND save_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(save_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to fetch stream row for ack")?;

    let max_seq_in_log = (next_seq - 1).max(0);
    let bounded = cursor.min(max_seq_in_log).max(0);

    sqlx::query(
        "INSERT INTO ws_device_cursors (user_id, save_id, device_id, last_acked_seq, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $5) \
         ON CONFLICT (user_id, save_id, device_id) DO UPDATE \
         SET last_acked_seq = GREATEST(ws_device_cursors.last_acked_seq, EXCLUDED.last_acked_seq), \
             updated_at = EXCLUDED.updated_at",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(device_id)
    .bind(bounded)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("failed to upsert device cursor")?;

    let min_acked: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MIN(last_acked_seq), 0) FROM ws_device_cursors \
         WHERE user_id = $1 AND save_id = $2",
    )
    .bind(user_id)
    .bind(save_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to compute min acked seq")?;

    if min_acked > current_trimmed {
        sqlx::query(
            "UPDATE ws_streams SET trimmed_upto_seq = $3, updated_at = $4 \
             WHERE user_id = $1 AND save_id = $2",
        )
        .bind(user_id)
        .bind(save_id)
        .bind(min_acked)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to advance trim point")?;

        sqlx::query(
            "DELETE FROM ws_events WHERE user_id = $1 AND save_id = $2 AND seq <= $3",
        )
        .bind(user_id)
        .bind(save_id)
        .bind(min_acked)
        .execute(&mut *tx)
        .await
        .context("failed to trim acked events")?;
    }

    tx.commit().await.context("failed to commit ack")?;

    Ok(bounded)
}

// ---------------------------------------------------------------------
// LLM usage rows
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn persist_usage_row(pool: &DbPool, row: &UsageRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO llm_usage_events \
         (id, user_id, save_id, provider, api, model, started_at, ended_at, latency_ms, \
          time_to_first_token_ms, output_chunks, output_chars, interrupted, error, \
          prompt_tokens, completion_tokens, total_tokens, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)",
    )
    .bind(&row.id)
    .bind(&row.user_id)
    .bind(&row.save_id)
    .bind(&row.provider)
    .bind(&row.api)
    .bind(&row.model)
    .bind(row.started_at)
    .bind(row.ended_at)
    .bind(row.latency_ms)
    .bind(row.time_to_first_token_ms)
    .bind(row.output_chunks)
    .bind(row.output_chars)
    .bind(row.interrupted)
    .bind(&row.error)
    .bind(row.prompt_tokens)
    .bind(row.completion_tokens)
    .bind(row.total_tokens)
    .bind(row.created_at)
    .execute(pool)
    .await
    .context("failed to persist usage row")?;

    Ok(())
}

pub async fn get_device_cursor(
    pool: &DbPool,
    user_id: &str,
    save_id: &str,
    device_id: &str,
) -> Result<Option<DeviceCursor>> {
    let cursor = sqlx::query_as::<_, DeviceCursor>(
        "SELECT user_id, save_id, device_id, last_acked_seq, created_at, updated_at \
         FROM ws_device_cursors WHERE user_id = $1 AND save_id = $2 AND device_id = $3",
    )
    .bind(user_id)
    .bind(save_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch device cursor")?;
    Ok(cursor)
}
