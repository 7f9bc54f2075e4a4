use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Run not found")]
    NotFound,
    #[error("Invalid run status transition: {0}")]
    InvalidTransition(String),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[sqlx(type_name = "run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Interrupted,
}

impl RunStatus {
    /// Terminal statuses are immutable; no further writes are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Error | RunStatus::Timeout | RunStatus::Interrupted
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Timeout => write!(f, "timeout"),
            RunStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "timeout" => Ok(RunStatus::Timeout),
            "interrupted" => Ok(RunStatus::Interrupted),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Run {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub assistant_id: Option<String>,
    pub status: RunStatus,
    #[ts(type = "unknown")]
    pub input: Json<Value>,
    #[ts(type = "unknown | null")]
    pub config: Option<Json<Value>>,
    #[ts(type = "unknown | null")]
    pub context: Option<Json<Value>>,
    #[ts(type = "unknown | null")]
    pub output: Option<Json<Value>>,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
#[ts(export)]
pub struct CreateRun {
    pub thread_id: Uuid,
    pub assistant_id: Option<String>,
    #[ts(type = "unknown")]
    pub input: Value,
    #[ts(type = "unknown | null")]
    pub config: Option<Value>,
    #[ts(type = "unknown | null")]
    pub context: Option<Value>,
    pub user_id: Option<String>,
}

impl Run {
    pub async fn create(pool: &SqlitePool, data: &CreateRun) -> Result<Self, RunError> {
        let id = Uuid::new_v4();
        let run = sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO runs (id, thread_id, assistant_id, status, input, config, context, user_id)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.thread_id)
        .bind(data.assistant_id.clone())
        .bind(Json(data.input.clone()))
        .bind(data.config.clone().map(Json))
        .bind(data.context.clone().map(Json))
        .bind(data.user_id.clone())
        .fetch_one(pool)
        .await?;

        Ok(run)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, RunError> {
        let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(run)
    }

    pub async fn find_by_thread_id(
        pool: &SqlitePool,
        thread_id: Uuid,
        status: Option<RunStatus>,
    ) -> Result<Vec<Self>, RunError> {
        let runs = match status {
            Some(status) => {
                sqlx::query_as::<_, Run>(
                    r#"
                    SELECT * FROM runs
                    WHERE thread_id = ?1 AND status = ?2
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(thread_id)
                .bind(status)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Run>(
                    "SELECT * FROM runs WHERE thread_id = ?1 ORDER BY created_at DESC",
                )
                .bind(thread_id)
                .fetch_all(pool)
                .await?
            }
        };

        Ok(runs)
    }

    /// `pending -> running`, exactly once.
    pub async fn mark_running(pool: &SqlitePool, id: Uuid) -> Result<Self, RunError> {
        let updated = sqlx::query_as::<_, Run>(
            r#"
            UPDATE runs
            SET status = 'running', updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        match updated {
            Some(run) => Ok(run),
            None => match Self::find_by_id(pool, id).await? {
                Some(run) => Err(RunError::InvalidTransition(format!(
                    "run {} is {}, expected pending",
                    id, run.status
                ))),
                None => Err(RunError::NotFound),
            },
        }
    }

    /// Write the single terminal transition. `output` and `error_message`
    /// are mutually exclusive; the guard makes terminal rows immutable.
    pub async fn finish(
        pool: &SqlitePool,
        id: Uuid,
        status: RunStatus,
        output: Option<Value>,
        error_message: Option<String>,
    ) -> Result<Self, RunError> {
        debug_assert!(status.is_terminal());
        debug_assert!(output.is_none() || error_message.is_none());

        let updated = sqlx::query_as::<_, Run>(
            r#"
            UPDATE runs
            SET status = ?2,
                output = ?3,
                error_message = ?4,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('pending', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(output.map(Json))
        .bind(error_message)
        .fetch_optional(pool)
        .await?;

        match updated {
            Some(run) => Ok(run),
            None => match Self::find_by_id(pool, id).await? {
                Some(run) => Err(RunError::InvalidTransition(format!(
                    "run {} already terminal ({})",
                    id, run.status
                ))),
                None => Err(RunError::NotFound),
            },
        }
    }
}
