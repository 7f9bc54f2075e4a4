use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Thread not found")]
    NotFound,
}

/// Coarse mirror of "is this conversation being worked on", maintained by
/// the execution engine as runs start and finish.
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, TS)]
#[sqlx(type_name = "thread_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ThreadStatus {
    Idle,
    Busy,
    Interrupted,
    Error,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadStatus::Idle => write!(f, "idle"),
            ThreadStatus::Busy => write!(f, "busy"),
            ThreadStatus::Interrupted => write!(f, "interrupted"),
            ThreadStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Thread {
    pub id: Uuid,
    pub status: ThreadStatus,
    #[ts(type = "Record<string, unknown> | null")]
    pub metadata: Option<Json<Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, TS)]
#[ts(export)]
pub struct CreateThread {
    #[ts(type = "Record<string, unknown> | null")]
    pub metadata: Option<Value>,
}

impl Thread {
    pub async fn create(pool: &SqlitePool, data: &CreateThread) -> Result<Self, ThreadError> {
        let id = Uuid::new_v4();
        let thread = sqlx::query_as::<_, Thread>(
            r#"
            INSERT INTO threads (id, status, metadata)
            VALUES (?1, 'idle', ?2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.metadata.clone().map(Json))
        .fetch_one(pool)
        .await?;

        Ok(thread)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ThreadError> {
        let thread = sqlx::query_as::<_, Thread>("SELECT * FROM threads WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(thread)
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: ThreadStatus,
    ) -> Result<Self, ThreadError> {
        sqlx::query_as::<_, Thread>(
            r#"
            UPDATE threads
            SET status = ?2, updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(pool)
        .await?
        .ok_or(ThreadError::NotFound)
    }
}
