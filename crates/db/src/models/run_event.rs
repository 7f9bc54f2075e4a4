use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunEventError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// One immutable entry in the per-run ordered event log.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RunEvent {
    pub id: String,
    pub run_id: Uuid,
    pub seq: i64,
    pub event: String,
    #[ts(type = "unknown")]
    pub data: Json<Value>,
    pub created_at: DateTime<Utc>,
}

impl RunEvent {
    /// Append the next event for a run.
    ///
    /// `seq` is assigned inside the INSERT (`COALESCE(MAX(seq), -1) + 1`),
    /// so assignment and insertion are a single atomic statement. Persisted
    /// before any fan-out delivery.
    pub async fn append(
        pool: &SqlitePool,
        run_id: Uuid,
        event: &str,
        data: Value,
    ) -> Result<Self, RunEventError> {
        let row = sqlx::query_as::<_, RunEvent>(
            r#"
            INSERT INTO run_events (id, run_id, seq, event, data)
            VALUES (
                ?1 || '_event_' || (SELECT COALESCE(MAX(seq), -1) + 1 FROM run_events WHERE run_id = ?2),
                ?2,
                (SELECT COALESCE(MAX(seq), -1) + 1 FROM run_events WHERE run_id = ?2),
                ?3,
                ?4
            )
            RETURNING *
            "#,
        )
        .bind(run_id.to_string())
        .bind(run_id)
        .bind(event)
        .bind(Json(data))
        .fetch_one(pool)
        .await?;

        Ok(row)
    }

    /// All events with `seq > last_seq`, ascending. `last_seq = -1` replays
    /// the full log.
    pub async fn find_since(
        pool: &SqlitePool,
        run_id: Uuid,
        last_seq: i64,
    ) -> Result<Vec<Self>, RunEventError> {
        let events = sqlx::query_as::<_, RunEvent>(
            r#"
            SELECT * FROM run_events
            WHERE run_id = ?1 AND seq > ?2
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .bind(last_seq)
        .fetch_all(pool)
        .await?;

        Ok(events)
    }

    pub async fn max_seq(pool: &SqlitePool, run_id: Uuid) -> Result<Option<i64>, RunEventError> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM run_events WHERE run_id = ?1")
                .bind(run_id)
                .fetch_one(pool)
                .await?;

        Ok(seq)
    }

    /// Retention sweep: delete events older than `cutoff`, but only for
    /// runs that already reached a terminal status.
    pub async fn prune_older_than(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RunEventError> {
        // Match the TEXT format written by datetime('now', 'subsec').
        let cutoff = cutoff.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let result = sqlx::query(
            r#"
            DELETE FROM run_events
            WHERE created_at < ?1
              AND run_id IN (
                  SELECT id FROM runs
                  WHERE status IN ('success', 'error', 'timeout', 'interrupted')
              )
            "#,
        )
        .bind(cutoff)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
