use std::sync::Arc;

use db::DBService;
use services::services::{
    config::Config, execution::ExecutionEngine, streaming::StreamingService,
};

pub mod error;
pub mod routes;

/// Shared handle threaded through every route.
#[derive(Clone)]
pub struct AppState {
    db: DBService,
    engine: ExecutionEngine,
    streaming: StreamingService,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(
        db: DBService,
        engine: ExecutionEngine,
        streaming: StreamingService,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            engine,
            streaming,
            config,
        }
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn streaming(&self) -> &StreamingService {
        &self.streaming
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
