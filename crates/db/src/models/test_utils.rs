use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{
    run::{CreateRun, Run},
    thread::{CreateThread, Thread},
};
use crate::DBService;

pub(crate) async fn setup_db() -> DBService {
    DBService::new_in_memory()
        .await
        .expect("failed to open in-memory db")
}

pub(crate) async fn create_test_thread(pool: &SqlitePool) -> Thread {
    Thread::create(pool, &CreateThread::default())
        .await
        .expect("failed to create test thread")
}

pub(crate) async fn create_test_run(pool: &SqlitePool, thread_id: Uuid) -> Run {
    Run::create(
        pool,
        &CreateRun {
            thread_id,
            assistant_id: None,
            input: json!({"message": "hi"}),
            config: None,
            context: None,
            user_id: None,
        },
    )
    .await
    .expect("failed to create test run")
}
