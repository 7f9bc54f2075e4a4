//! Resumable SSE rendering of a run's event log.
//!
//! A stream is three phases: replay the persisted backlog past the client's
//! `Last-Event-ID`, hand over to the live broker subscription, then close on
//! the `end` marker. The subscription is opened *before* the replay read so
//! no event can fall between the two; duplicates are dropped by `seq`, and a
//! gap (lagged subscriber, publish raced away) is healed by re-reading the
//! log.

use std::{collections::HashSet, str::FromStr, sync::Arc};

use async_stream::stream;
use chrono::Utc;
use db::{
    DBService,
    models::{
        run::Run,
        run_event::{RunEvent, RunEventError},
    },
};
use futures::Stream;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use utils::sse::{self, SseMessage};
use uuid::Uuid;

use super::broker::BrokerManager;

/// Client-selectable notification categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    Values,
    Updates,
    Messages,
    MessagesTuple,
    Events,
    Debug,
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "values" => Ok(StreamMode::Values),
            "updates" => Ok(StreamMode::Updates),
            "messages" => Ok(StreamMode::Messages),
            "messages-tuple" => Ok(StreamMode::MessagesTuple),
            "events" => Ok(StreamMode::Events),
            "debug" => Ok(StreamMode::Debug),
            other => Err(format!("unknown stream mode '{other}'")),
        }
    }
}

/// Which stored events a particular subscriber sees, and how.
#[derive(Debug, Clone)]
pub struct StreamFilter {
    modes: HashSet<StreamMode>,
}

impl Default for StreamFilter {
    fn default() -> Self {
        Self {
            modes: HashSet::from([StreamMode::Values]),
        }
    }
}

impl StreamFilter {
    /// An empty mode set falls back to the default (`values`).
    pub fn new(modes: impl IntoIterator<Item = StreamMode>) -> Self {
        let modes: HashSet<StreamMode> = modes.into_iter().collect();
        if modes.is_empty() {
            Self::default()
        } else {
            Self { modes }
        }
    }

    /// Render a stored event for this subscriber; `None` means filtered out.
    pub fn render(&self, event: &RunEvent) -> Option<SseMessage> {
        let data = &event.data.0;
        match event.event.as_str() {
            // engine events always pass, stored in wire form
            "metadata" | "end" | "error" => Some(SseMessage::new(
                event.event.clone(),
                Some(event.id.clone()),
                data.clone(),
            )),
            tag => {
                let chunk = data.get("chunk").cloned().unwrap_or(Value::Null);
                let namespace: Option<Vec<String>> = data
                    .get("ns")
                    .and_then(|ns| serde_json::from_value(ns.clone()).ok());
                self.render_notification(tag, chunk, namespace, &event.id)
            }
        }
    }

    fn render_notification(
        &self,
        tag: &str,
        chunk: Value,
        namespace: Option<Vec<String>>,
        id: &str,
    ) -> Option<SseMessage> {
        match tag {
            "values" if self.modes.contains(&StreamMode::Values) => {
                Some(tagged(tag, namespace, id, chunk))
            }
            "updates" => {
                if self.modes.contains(&StreamMode::Updates) {
                    return Some(tagged(tag, namespace, id, chunk));
                }
                // Interrupt payloads must reach every subscriber. An update
                // the client did not ask for is dropped unless it carries a
                // non-empty `__interrupt__`, in which case it is retyped to
                // `values` (namespace preserved).
                match chunk.get("__interrupt__") {
                    Some(Value::Array(items)) if !items.is_empty() => {
                        Some(tagged("values", namespace, id, chunk))
                    }
                    _ => None,
                }
            }
            "messages"
                if self.modes.contains(&StreamMode::Messages)
                    || self.modes.contains(&StreamMode::MessagesTuple) =>
            {
                Some(tagged(tag, namespace, id, chunk))
            }
            "events" if self.modes.contains(&StreamMode::Events) => {
                Some(tagged(tag, namespace, id, chunk))
            }
            "debug" if self.modes.contains(&StreamMode::Debug) => {
                Some(tagged(tag, namespace, id, enrich_debug(chunk)))
            }
            // custom events carry application signals (human-in-the-loop
            // prompts and the like); always delivered
            "custom" => Some(tagged(tag, namespace, id, chunk)),
            _ => None,
        }
    }
}

/// Namespaced notifications render the event type as `{tag}|{ns1}|{ns2}`.
fn tagged(tag: &str, namespace: Option<Vec<String>>, id: &str, chunk: Value) -> SseMessage {
    let event = match namespace {
        Some(parts) if !parts.is_empty() => format!("{tag}|{}", parts.join("|")),
        _ => tag.to_string(),
    };
    SseMessage::new(event, Some(id.to_string()), chunk)
}

/// Lift checkpoint identifiers out of a debug payload's nested config.
///
/// `payload.config.configurable` yields `payload.checkpoint`, and
/// `payload.parent_config.configurable` yields `payload.parent_checkpoint`.
/// A null or missing parent config leaves the event without one.
fn enrich_debug(mut chunk: Value) -> Value {
    let Some(payload) = chunk.get_mut("payload").and_then(Value::as_object_mut) else {
        return chunk;
    };

    if let Some(checkpoint) = payload
        .get("config")
        .and_then(|config| config.get("configurable"))
        .map(pick_checkpoint)
    {
        payload.insert("checkpoint".to_string(), checkpoint);
    }
    let parent = payload
        .get("parent_config")
        .filter(|config| !config.is_null())
        .and_then(|config| config.get("configurable"))
        .map(pick_checkpoint);
    if let Some(parent) = parent {
        payload.insert("parent_checkpoint".to_string(), parent);
    }

    chunk
}

fn pick_checkpoint(configurable: &Value) -> Value {
    json!({
        "thread_id": configurable.get("thread_id").cloned().unwrap_or(Value::Null),
        "checkpoint_id": configurable.get("checkpoint_id").cloned().unwrap_or(Value::Null),
        "checkpoint_ns": configurable.get("checkpoint_ns").cloned().unwrap_or(Value::Null),
    })
}

#[derive(Clone)]
pub struct StreamingService {
    db: DBService,
    brokers: Arc<BrokerManager>,
}

enum LiveStep {
    Deliver(Arc<RunEvent>),
    Resync,
    ResyncThenStop,
}

impl StreamingService {
    pub fn new(db: DBService, brokers: Arc<BrokerManager>) -> Self {
        Self { db, brokers }
    }

    /// Stream a run's events from just past `last_event_id` (or the start)
    /// through its `end` marker. The returned stream terminates after `end`;
    /// for runs that ended without one reaching the log (pruned, or finished
    /// before this process started) a synthetic `end` is emitted.
    pub fn stream_run(
        &self,
        run: Run,
        last_event_id: Option<String>,
        filter: StreamFilter,
    ) -> impl Stream<Item = SseMessage> + Send + 'static {
        let pool = self.db.pool.clone();
        let brokers = self.brokers.clone();

        stream! {
            let run_id = run.id;
            let mut delivered: i64 = last_event_id
                .as_deref()
                .and_then(sse::extract_event_sequence)
                .unwrap_or(-1);
            let mut saw_end = false;

            // subscribe before reading so nothing falls between backlog
            // and live delivery
            let rx = if run.status.is_terminal() {
                None
            } else {
                Some(brokers.get_or_create(run_id).subscribe())
            };

            match read_since(&pool, run_id, delivered).await {
                Ok(backlog) => {
                    for event in backlog {
                        delivered = event.seq;
                        saw_end |= event.event == "end";
                        if let Some(msg) = filter.render(&event) {
                            yield msg;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!("replay failed for run {run_id}: {err}");
                    yield stream_error("event log unavailable");
                    return;
                }
            }
            if saw_end {
                return;
            }

            // the run may have gone terminal between the status snapshot and
            // the subscription; re-check before trusting the live channel
            let status = match Run::find_by_id(&pool, run_id).await {
                Ok(Some(current)) => current.status,
                Ok(None) | Err(_) => run.status,
            };
            if status.is_terminal() {
                if let Ok(rest) = read_since(&pool, run_id, delivered).await {
                    for event in rest {
                        delivered = event.seq;
                        saw_end |= event.event == "end";
                        if let Some(msg) = filter.render(&event) {
                            yield msg;
                        }
                    }
                }
                if !saw_end {
                    yield SseMessage::new("end", None, json!({"status": status.to_string()}));
                }
                return;
            }

            let Some(mut rx) = rx else { return };
            loop {
                let step = match rx.recv().await {
                    Ok(event) if event.seq <= delivered => continue,
                    Ok(event) if event.seq == delivered + 1 => LiveStep::Deliver(event),
                    Ok(_) => LiveStep::Resync,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("subscriber lagged {skipped} events on run {run_id}");
                        LiveStep::Resync
                    }
                    Err(RecvError::Closed) => LiveStep::ResyncThenStop,
                };

                let stop_after_resync = matches!(step, LiveStep::ResyncThenStop);
                match step {
                    LiveStep::Deliver(event) => {
                        delivered = event.seq;
                        let is_end = event.event == "end";
                        if let Some(msg) = filter.render(&event) {
                            yield msg;
                        }
                        if is_end {
                            return;
                        }
                    }
                    LiveStep::Resync | LiveStep::ResyncThenStop => {
                        match read_since(&pool, run_id, delivered).await {
                            Ok(rows) => {
                                for event in rows {
                                    delivered = event.seq;
                                    saw_end |= event.event == "end";
                                    if let Some(msg) = filter.render(&event) {
                                        yield msg;
                                    }
                                }
                            }
                            Err(err) => {
                                tracing::error!("resync failed for run {run_id}: {err}");
                                yield stream_error("event log unavailable");
                                return;
                            }
                        }
                        if saw_end || stop_after_resync {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// One retry on a failed log read before giving up on the stream.
async fn read_since(
    pool: &SqlitePool,
    run_id: Uuid,
    last_seq: i64,
) -> Result<Vec<RunEvent>, RunEventError> {
    match RunEvent::find_since(pool, run_id, last_seq).await {
        Ok(rows) => Ok(rows),
        Err(err) => {
            tracing::warn!("event read failed for run {run_id}, retrying: {err}");
            RunEvent::find_since(pool, run_id, last_seq).await
        }
    }
}

fn stream_error(message: &str) -> SseMessage {
    SseMessage::new(
        "error",
        None,
        json!({"error": message, "timestamp": Utc::now()}),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use db::models::run::RunStatus;
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::services::{
        agent::{Notification, NotificationKind},
        execution::test_support::{ScriptedAgent, create_thread_and_run, setup_engine},
    };

    async fn append_notification(
        pool: &SqlitePool,
        run_id: Uuid,
        tag: &str,
        chunk: Value,
        ns: Option<Vec<&str>>,
    ) -> RunEvent {
        RunEvent::append(pool, run_id, tag, json!({"chunk": chunk, "ns": ns}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn default_filter_delivers_values_and_engine_events() {
        let db = DBService::new_in_memory().await.unwrap();
        let (_thread, run) = create_thread_and_run(&db).await;
        let filter = StreamFilter::default();

        let meta = RunEvent::append(&db.pool, run.id, "metadata", json!({"run_id": run.id}))
            .await
            .unwrap();
        let values = append_notification(&db.pool, run.id, "values", json!({"x": 1}), None).await;
        let events =
            append_notification(&db.pool, run.id, "events", json!({"event": "on_start"}), None)
                .await;

        assert_eq!(filter.render(&meta).unwrap().event, "metadata");
        let rendered = filter.render(&values).unwrap();
        assert_eq!(rendered.event, "values");
        assert_eq!(rendered.data, json!({"x": 1}));
        assert_eq!(rendered.id, Some(values.id.clone()));
        assert!(filter.render(&events).is_none());
    }

    #[tokio::test]
    async fn unrequested_updates_drop_or_retype_on_interrupt() {
        let db = DBService::new_in_memory().await.unwrap();
        let (_thread, run) = create_thread_and_run(&db).await;
        let filter = StreamFilter::default();

        let plain =
            append_notification(&db.pool, run.id, "updates", json!({"node": {"x": 1}}), None).await;
        let empty_interrupt = append_notification(
            &db.pool,
            run.id,
            "updates",
            json!({"__interrupt__": []}),
            None,
        )
        .await;
        let interrupt = append_notification(
            &db.pool,
            run.id,
            "updates",
            json!({"__interrupt__": [{"id": "x", "value": "approve?"}]}),
            Some(vec!["child"]),
        )
        .await;

        assert!(filter.render(&plain).is_none());
        assert!(filter.render(&empty_interrupt).is_none());

        let rendered = filter.render(&interrupt).unwrap();
        assert_eq!(rendered.event, "values|child");
        assert_eq!(
            rendered.data,
            json!({"__interrupt__": [{"id": "x", "value": "approve?"}]})
        );

        // when updates are requested they pass through untouched
        let updates_filter = StreamFilter::new([StreamMode::Updates]);
        let rendered = updates_filter.render(&interrupt).unwrap();
        assert_eq!(rendered.event, "updates|child");
    }

    #[tokio::test]
    async fn debug_events_gain_checkpoint_fields() {
        let db = DBService::new_in_memory().await.unwrap();
        let (_thread, run) = create_thread_and_run(&db).await;
        let filter = StreamFilter::new([StreamMode::Debug]);

        let chunk = json!({
            "type": "checkpoint",
            "payload": {
                "config": {"configurable": {
                    "thread_id": "t1", "checkpoint_id": "c1", "checkpoint_ns": ""
                }},
                "parent_config": null
            }
        });
        let event = append_notification(&db.pool, run.id, "debug", chunk, None).await;
        let rendered = filter.render(&event).unwrap();
        let payload = &rendered.data["payload"];
        assert_eq!(
            payload["checkpoint"],
            json!({"thread_id": "t1", "checkpoint_id": "c1", "checkpoint_ns": ""})
        );
        assert!(payload.get("parent_checkpoint").is_none());

        let chunk = json!({
            "type": "checkpoint",
            "payload": {
                "config": {"configurable": {
                    "thread_id": "t1", "checkpoint_id": "c2", "checkpoint_ns": ""
                }},
                "parent_config": {"configurable": {
                    "thread_id": "t1", "checkpoint_id": "c1", "checkpoint_ns": ""
                }}
            }
        });
        let event = append_notification(&db.pool, run.id, "debug", chunk, None).await;
        let rendered = filter.render(&event).unwrap();
        assert_eq!(
            rendered.data["payload"]["parent_checkpoint"]["checkpoint_id"],
            json!("c1")
        );
    }

    #[tokio::test]
    async fn terminal_replay_resumes_without_duplicates_or_gaps() {
        let agent = Arc::new(ScriptedAgent::new(
            (0..6)
                .map(|i| Notification::new(NotificationKind::Values, json!({"step": i})))
                .collect(),
        ));
        let (engine, db) = setup_engine(agent).await;
        let (_thread, run) = create_thread_and_run(&db).await;
        engine.spawn(&run).await.unwrap();
        engine.join(run.id, Duration::from_secs(5)).await.unwrap();

        let streaming = StreamingService::new(db.clone(), engine.brokers().clone());
        let run = Run::find_by_id(&db.pool, run.id).await.unwrap().unwrap();

        // log is metadata(0), values(1..=6), end(7); resume after seq 4
        let resume_id = sse::event_id(&run.id.to_string(), 4);
        let collected: Vec<SseMessage> = streaming
            .stream_run(run.clone(), Some(resume_id), StreamFilter::default())
            .collect()
            .await;

        let seqs: Vec<i64> = collected
            .iter()
            .filter_map(|msg| msg.id.as_deref().and_then(sse::extract_event_sequence))
            .collect();
        assert_eq!(seqs, vec![5, 6, 7]);
        assert_eq!(collected.last().unwrap().event, "end");
        assert_eq!(collected.last().unwrap().data, json!({"status": "success"}));
    }

    #[tokio::test]
    async fn terminal_run_without_end_row_gets_synthetic_end() {
        let db = DBService::new_in_memory().await.unwrap();
        let (_thread, run) = create_thread_and_run(&db).await;
        db::models::run::Run::mark_running(&db.pool, run.id).await.unwrap();
        let run = db::models::run::Run::finish(
            &db.pool,
            run.id,
            RunStatus::Interrupted,
            None,
            None,
        )
        .await
        .unwrap();

        let streaming = StreamingService::new(db.clone(), Arc::new(BrokerManager::new(16)));
        let collected: Vec<SseMessage> = streaming
            .stream_run(run, None, StreamFilter::default())
            .collect()
            .await;

        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].event, "end");
        assert_eq!(collected[0].data, json!({"status": "interrupted"}));
        assert!(collected[0].id.is_none());
    }

    #[tokio::test]
    async fn live_stream_follows_a_running_run_to_its_end() {
        let mut agent = ScriptedAgent::new(
            (0..3)
                .map(|i| Notification::new(NotificationKind::Values, json!({"step": i})))
                .collect(),
        );
        agent.step_delay = Duration::from_millis(10);
        let (engine, db) = setup_engine(Arc::new(agent)).await;
        let (_thread, run) = create_thread_and_run(&db).await;

        let streaming = StreamingService::new(db.clone(), engine.brokers().clone());
        let stream = streaming.stream_run(run.clone(), None, StreamFilter::default());
        engine.spawn(&run).await.unwrap();

        let collected: Vec<SseMessage> =
            tokio::time::timeout(Duration::from_secs(5), stream.collect())
                .await
                .expect("stream should close after end");

        let tags: Vec<&str> = collected.iter().map(|msg| msg.event.as_str()).collect();
        assert_eq!(tags, vec!["metadata", "values", "values", "values", "end"]);
        let seqs: Vec<i64> = collected
            .iter()
            .filter_map(|msg| msg.id.as_deref().and_then(sse::extract_event_sequence))
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }
}
