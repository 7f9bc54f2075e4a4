//! Background retention: prune aged event rows of terminal runs and drop
//! stale finished brokers.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use db::{DBService, models::run_event::RunEvent};
use tokio::task::JoinHandle;

use super::{broker::BrokerManager, config::Config};

/// Spawn the retention loop. Runs until the process exits; each cycle is
/// independent, so a failed sweep just logs and waits for the next tick.
pub fn spawn_retention_sweep(
    db: DBService,
    brokers: Arc<BrokerManager>,
    config: Arc<Config>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.retention_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so startup stays quiet
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let cutoff = Utc::now() - ChronoDuration::seconds(config.event_ttl_secs as i64);
            match RunEvent::prune_older_than(&db.pool, cutoff).await {
                Ok(0) => {}
                Ok(pruned) => tracing::info!("retention pruned {pruned} run events"),
                Err(err) => tracing::error!("retention sweep failed: {err}"),
            }

            let dropped = brokers.sweep_finished(config.broker_max_age());
            if dropped > 0 {
                tracing::debug!("retention dropped {dropped} stale brokers");
            }
        }
    })
}
