//! Run lifecycle: at-most-one live execution per run, ordered persistence
//! of every notification, cooperative interrupt and wall-clock timeout.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use db::{
    DBService,
    models::{
        run::{Run, RunError, RunStatus},
        run_event::{RunEvent, RunEventError},
        thread::{Thread, ThreadError, ThreadStatus},
    },
};
use futures::StreamExt;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    agent::{AgentError, AgentExecutor, AgentRequest, NotificationKind, NotificationStream},
    broker::{BrokerManager, RunBroker},
    config::Config,
};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Run {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("Timed out waiting for run {0}")]
    JoinTimeout(Uuid),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
    #[error(transparent)]
    RunEvent(#[from] RunEventError),
}

/// Live handle for a run owned by this process.
struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Result of an interrupt request. `found` reports whether a live handle
/// existed in this process; without one the call is a no-op that returns
/// the persisted snapshot.
#[derive(Debug)]
pub struct InterruptOutcome {
    pub found: bool,
    pub run: Run,
}

enum RunOutcome {
    Success(Option<Value>),
    Failed(String),
    Interrupted,
    TimedOut,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    db: DBService,
    brokers: Arc<BrokerManager>,
    agent: Arc<dyn AgentExecutor>,
    registry: Arc<DashMap<Uuid, RunHandle>>,
    config: Arc<Config>,
}

impl ExecutionEngine {
    pub fn new(
        db: DBService,
        brokers: Arc<BrokerManager>,
        agent: Arc<dyn AgentExecutor>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            brokers,
            agent,
            registry: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn brokers(&self) -> &Arc<BrokerManager> {
        &self.brokers
    }

    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.registry.contains_key(&run_id)
    }

    pub fn running_count(&self) -> usize {
        self.registry.len()
    }

    /// Launch the asynchronous unit for a pending run.
    ///
    /// The registry entry is inserted before any await point, so two
    /// concurrent `spawn` calls for the same run cannot both proceed.
    pub async fn spawn(&self, run: &Run) -> Result<(), ExecutionError> {
        let run_id = run.id;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        match self.registry.entry(run_id) {
            Entry::Occupied(_) => return Err(ExecutionError::AlreadyRunning(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(RunHandle {
                    cancel: cancel.clone(),
                    done: done_rx,
                });
            }
        }

        let run = match Run::mark_running(&self.db.pool, run_id).await {
            Ok(run) => run,
            Err(err) => {
                self.registry.remove(&run_id);
                return Err(err.into());
            }
        };
        if let Err(err) = Thread::update_status(&self.db.pool, run.thread_id, ThreadStatus::Busy).await
        {
            self.registry.remove(&run_id);
            return Err(err.into());
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_to_completion(run, cancel, done_tx).await;
        });

        Ok(())
    }

    async fn run_to_completion(
        &self,
        run: Run,
        cancel: CancellationToken,
        done_tx: watch::Sender<bool>,
    ) {
        let broker = self.brokers.get_or_create(run.id);

        // metadata is persisted first so replayed and live streams share
        // the same prefix
        let outcome = match self
            .append_and_publish(
                &broker,
                run.id,
                "metadata",
                json!({"run_id": run.id, "attempt": 1}),
            )
            .await
        {
            Ok(_) => self.drive(&run, &broker, &cancel).await,
            Err(err) => RunOutcome::Failed(format!("failed to record run start: {err}")),
        };

        self.finalize(&run, &broker, outcome).await;
        let _ = done_tx.send(true);
    }

    async fn drive(&self, run: &Run, broker: &Arc<RunBroker>, cancel: &CancellationToken) -> RunOutcome {
        let request = AgentRequest {
            run_id: run.id,
            thread_id: run.thread_id,
            assistant_id: run.assistant_id.clone(),
            input: run.input.0.clone(),
            config: run.config.as_ref().map(|json| json.0.clone()),
            context: run.context.as_ref().map(|json| json.0.clone()),
        };

        let stream = match self.agent.execute(request, cancel.child_token()).await {
            Ok(stream) => stream,
            Err(err) => return RunOutcome::Failed(err.to_string()),
        };

        tokio::select! {
            _ = cancel.cancelled() => RunOutcome::Interrupted,
            _ = tokio::time::sleep(self.config.run_timeout()) => RunOutcome::TimedOut,
            outcome = self.consume(run.id, broker, stream) => outcome,
        }
    }

    async fn consume(
        &self,
        run_id: Uuid,
        broker: &Arc<RunBroker>,
        mut stream: NotificationStream,
    ) -> RunOutcome {
        let mut final_output: Option<Value> = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(notification) => {
                    if notification.kind == NotificationKind::Values {
                        final_output = Some(notification.data.clone());
                    }
                    let envelope = json!({
                        "chunk": notification.data,
                        "ns": notification.namespace,
                    });
                    if let Err(err) = self
                        .append_and_publish(broker, run_id, notification.kind.as_str(), envelope)
                        .await
                    {
                        // a dropped write would leave a gap; abort instead
                        return RunOutcome::Failed(format!("event append failed: {err}"));
                    }
                }
                Err(AgentError::UserFacing { message, .. }) => return RunOutcome::Failed(message),
                Err(err) => return RunOutcome::Failed(err.to_string()),
            }
        }

        RunOutcome::Success(final_output)
    }

    /// Single cleanup path for every way a run can end: terminal events,
    /// terminal status, thread mirror, broker shutdown, registry removal.
    async fn finalize(&self, run: &Run, broker: &Arc<RunBroker>, outcome: RunOutcome) {
        let (status, thread_status, output, error_message) = match outcome {
            RunOutcome::Success(output) => (RunStatus::Success, ThreadStatus::Idle, output, None),
            RunOutcome::Failed(message) => {
                (RunStatus::Error, ThreadStatus::Error, None, Some(message))
            }
            RunOutcome::Interrupted => {
                (RunStatus::Interrupted, ThreadStatus::Interrupted, None, None)
            }
            RunOutcome::TimedOut => (RunStatus::Timeout, ThreadStatus::Idle, None, None),
        };

        if let Some(message) = &error_message {
            tracing::warn!("run {} failed: {message}", run.id);
            if let Err(err) = self
                .append_and_publish(
                    broker,
                    run.id,
                    "error",
                    json!({"error": message, "timestamp": Utc::now()}),
                )
                .await
            {
                tracing::error!("failed to append error event for run {}: {err}", run.id);
            }
        }

        if let Err(err) = self
            .append_and_publish(broker, run.id, "end", json!({"status": status.to_string()}))
            .await
        {
            tracing::error!("failed to append end event for run {}: {err}", run.id);
        }

        match Run::finish(&self.db.pool, run.id, status, output, error_message).await {
            Ok(_) => {}
            Err(RunError::InvalidTransition(msg)) => {
                tracing::warn!("run {} already terminal: {msg}", run.id)
            }
            Err(err) => tracing::error!("failed to finalize run {}: {err}", run.id),
        }
        if let Err(err) =
            Thread::update_status(&self.db.pool, run.thread_id, thread_status).await
        {
            tracing::error!("failed to mirror thread status for run {}: {err}", run.id);
        }

        broker.mark_finished();
        self.registry.remove(&run.id);
    }

    async fn append_and_publish(
        &self,
        broker: &Arc<RunBroker>,
        run_id: Uuid,
        event: &str,
        data: Value,
    ) -> Result<Arc<RunEvent>, RunEventError> {
        let event = RunEvent::append(&self.db.pool, run_id, event, data).await?;
        let event = Arc::new(event);
        broker.publish(event.clone());
        Ok(event)
    }

    /// Signal cooperative cancellation to a live run. Cleanup (terminal
    /// status, thread mirror) runs in the owning task; we wait for it so
    /// callers observe the interrupted status.
    pub async fn interrupt(&self, run_id: Uuid) -> Result<InterruptOutcome, ExecutionError> {
        let handle = self
            .registry
            .get(&run_id)
            .map(|handle| (handle.cancel.clone(), handle.done.clone()));

        match handle {
            Some((cancel, mut done)) => {
                cancel.cancel();
                let _ = tokio::time::timeout(
                    Duration::from_secs(5),
                    done.wait_for(|finished| *finished),
                )
                .await;
                let run = Run::find_by_id(&self.db.pool, run_id)
                    .await?
                    .ok_or(RunError::NotFound)?;
                Ok(InterruptOutcome { found: true, run })
            }
            None => {
                let run = Run::find_by_id(&self.db.pool, run_id)
                    .await?
                    .ok_or(RunError::NotFound)?;
                Ok(InterruptOutcome { found: false, run })
            }
        }
    }

    /// Wait until the run reaches a terminal status, up to `timeout`.
    ///
    /// Terminal runs return immediately. A live local handle is awaited via
    /// its completion signal. Without one (run owned by another process, or
    /// lost to a restart) the persisted row is polled instead.
    pub async fn join(&self, run_id: Uuid, timeout: Duration) -> Result<Run, ExecutionError> {
        let run = Run::find_by_id(&self.db.pool, run_id)
            .await?
            .ok_or(RunError::NotFound)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let done = self.registry.get(&run_id).map(|handle| handle.done.clone());
        if let Some(mut done) = done {
            if tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
                .await
                .is_err()
            {
                return Err(ExecutionError::JoinTimeout(run_id));
            }
            return Run::find_by_id(&self.db.pool, run_id)
                .await?
                .ok_or(RunError::NotFound)
                .map_err(Into::into);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ExecutionError::JoinTimeout(run_id));
            }
            tokio::time::sleep(self.config.join_poll_interval()).await;
            let run = Run::find_by_id(&self.db.pool, run_id)
                .await?
                .ok_or(RunError::NotFound)?;
            if run.status.is_terminal() {
                return Ok(run);
            }
        }
    }
}
