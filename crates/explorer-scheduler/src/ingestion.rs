//! Ingestion scheduler.
//!
//! One actor task owns all scheduling state. Public calls, reader wake-ups,
//! backoff timers and cycle completions all arrive as [`Command`]s on one
//! channel, so no scheduling flag is ever shared between tasks.
//!
//! ## Cycle
//!
//! fetch → merge → ingest (materialize, then index) → expand the outcome →
//! report it to the reader → escalate permanently dropped events.
//!
//! ## Scheduling rules
//!
//! - At most one cycle is in flight. Triggers that arrive meanwhile wait in
//!   FIFO order and each runs its own fresh fetch afterwards.
//! - Wake-ups coalesce: while one wake-up cycle is waiting, further wake-ups
//!   are ignored. The latch resets when that cycle starts.
//! - After a full batch or any failure the next cycle starts immediately.
//!   Otherwise a timer is armed for the idle delay; a timer that fires after
//!   another cycle has started is stale and ignored.
//! - A fetch error degrades the cycle to an empty one.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use explorer_indexing::{
    expand_outcome, MessageIngester, MessageMerger, NoopMerger, QueueReader, ReaderMetrics,
    Subscription,
};
use explorer_types::IngestionOutcome;

use crate::escalation::FailureEscalation;
use crate::{IngestionConfig, SchedulerError};

/// Lifecycle state of an [`IngestionScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Constructed, never started
    Idle,
    /// Listening for wake-ups and arming timers
    Running,
    /// Listener detached; only forced executions run
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub state: SchedulerState,
}

/// Ingestion counters since the scheduler was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestMetrics {
    pub cycles: u64,
    pub fetched: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Removed after exhausting their attempts
    pub dropped: u64,
    /// Still waiting in the queue when the snapshot was taken
    pub pending: u64,
}

impl IngestMetrics {
    fn record(&mut self, cycle: &CycleSummary) {
        self.cycles += 1;
        self.fetched += cycle.fetched as u64;
        self.succeeded += cycle.succeeded as u64;
        self.failed += cycle.failed as u64;
        self.dropped += cycle.dropped as u64;
    }
}

/// Snapshot returned by [`IngestionScheduler::metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub read: ReaderMetrics,
    pub ingest: IngestMetrics,
}

#[derive(Debug, Clone, Copy, Default)]
struct CycleSummary {
    fetched: usize,
    succeeded: usize,
    failed: usize,
    dropped: usize,
    full_batch: bool,
}

impl CycleSummary {
    fn wants_follow_up(&self) -> bool {
        self.full_batch || self.failed > 0
    }
}

/// Everything a cycle needs.
pub struct IngestionPipeline {
    reader: Arc<dyn QueueReader>,
    ingester: Arc<dyn MessageIngester>,
    merger: Box<dyn MessageMerger>,
    escalation: FailureEscalation,
}

impl IngestionPipeline {
    pub fn new(reader: Arc<dyn QueueReader>, ingester: Arc<dyn MessageIngester>) -> Self {
        Self {
            reader,
            ingester,
            merger: Box::new(NoopMerger),
            escalation: FailureEscalation::new(),
        }
    }

    pub fn with_merger(mut self, merger: Box<dyn MessageMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_escalation(mut self, escalation: FailureEscalation) -> Self {
        self.escalation = escalation;
        self
    }

    async fn run_cycle(&self, config: &IngestionConfig, execution_id: u64) -> CycleSummary {
        let batch = match self
            .reader
            .fetch_batch(config.batch_size, config.max_attempt)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(execution_id, error = %e, "Fetch failed; treating cycle as empty");
                return CycleSummary::default();
            }
        };

        let mut summary = CycleSummary {
            fetched: batch.len(),
            full_batch: batch.len() >= config.batch_size,
            ..Default::default()
        };
        if batch.is_empty() {
            debug!(execution_id, "Nothing to ingest");
            return summary;
        }

        let (rejected, batch): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|e| e.rejected.is_some());
        let merged = self.merger.merge(batch);
        let outcome = if merged.to_process.is_empty() {
            IngestionOutcome::new()
        } else {
            self.ingester.ingest(merged.to_process.clone()).await
        };
        let mut outcome = expand_outcome(&merged, outcome);
        for mut event in rejected {
            let reason = event.rejected.take().unwrap_or_default();
            warn!(execution_id, resource_id = %event.resource_id, reason = %reason, "Rejected event");
            event.fail(reason, Some("unreadable".to_string()));
            outcome.failed.push(event);
        }
        summary.succeeded = outcome.succeeded.len();
        summary.failed = outcome.failed.len();

        match self
            .reader
            .report_outcome(&outcome, config.max_attempt)
            .await
        {
            Ok(report) => {
                summary.dropped = report.dropped.len();
                self.escalation.escalate(report.dropped).await;
            }
            Err(e) => {
                // Unreported events stay pending and are delivered again
                error!(execution_id, error = %e, "Reporting outcome failed");
                summary.failed = summary.fetched;
                summary.succeeded = 0;
            }
        }

        info!(
            execution_id,
            fetched = summary.fetched,
            processed = merged.to_process.len(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            dropped = summary.dropped,
            "Ingestion cycle complete"
        );
        summary
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start {
        subscription: Subscription,
        reply: Reply<Result<(), SchedulerError>>,
    },
    Stop {
        reply: Reply<Result<(), SchedulerError>>,
    },
    Execute {
        force: bool,
        reply: Reply<bool>,
    },
    Wake,
    Timer {
        execution_id: u64,
    },
    CycleDone(CycleSummary),
    State {
        reply: Reply<SchedulerState>,
    },
    Snapshot {
        reply: Reply<IngestMetrics>,
    },
}

enum Trigger {
    Execute(Reply<bool>),
    Wake,
    FollowUp,
}

struct Actor {
    pipeline: Arc<IngestionPipeline>,
    config: Arc<IngestionConfig>,
    sender: mpsc::UnboundedSender<Command>,
    state: SchedulerState,
    execution_id: u64,
    in_flight: bool,
    waiting: VecDeque<Trigger>,
    wake_latch: bool,
    current_reply: Option<Reply<bool>>,
    stop_waiters: Vec<Reply<Result<(), SchedulerError>>>,
    subscription: Option<Subscription>,
    timer: Option<JoinHandle<()>>,
    metrics: IngestMetrics,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }
        self.cancel_timer();
        debug!("Ingestion scheduler task exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                subscription,
                reply,
            } => {
                let result = if self.state == SchedulerState::Running {
                    Err(SchedulerError::AlreadyRunning)
                } else {
                    self.state = SchedulerState::Running;
                    self.subscription = Some(subscription);
                    if !self.in_flight {
                        self.arm_timer();
                    }
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                if self.state != SchedulerState::Running {
                    let _ = reply.send(Err(SchedulerError::NotRunning));
                    return;
                }
                self.state = SchedulerState::Stopped;
                self.subscription = None;
                self.cancel_timer();
                self.wake_latch = false;
                self.waiting.retain(|t| matches!(t, Trigger::Execute(_)));
                if self.in_flight {
                    self.stop_waiters.push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Execute { force, reply } => {
                if !force && self.state != SchedulerState::Running {
                    let _ = reply.send(false);
                    return;
                }
                self.enqueue(Trigger::Execute(reply));
            }
            Command::Wake => {
                if self.state != SchedulerState::Running || self.wake_latch {
                    return;
                }
                self.wake_latch = true;
                self.enqueue(Trigger::Wake);
            }
            Command::Timer { execution_id } => {
                if self.state != SchedulerState::Running
                    || self.in_flight
                    || execution_id != self.execution_id
                {
                    debug!(execution_id, current = self.execution_id, "Ignoring stale timer");
                    return;
                }
                self.timer = None;
                self.begin_cycle(None);
            }
            Command::CycleDone(summary) => self.finish_cycle(summary),
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.metrics);
            }
        }
    }

    fn enqueue(&mut self, trigger: Trigger) {
        self.waiting.push_back(trigger);
        if !self.in_flight {
            self.run_next();
        }
    }

    fn run_next(&mut self) {
        while let Some(trigger) = self.waiting.pop_front() {
            match trigger {
                Trigger::Execute(reply) => {
                    self.begin_cycle(Some(reply));
                    return;
                }
                Trigger::Wake => {
                    self.wake_latch = false;
                    if self.state == SchedulerState::Running {
                        self.begin_cycle(None);
                        return;
                    }
                }
                Trigger::FollowUp => {
                    if self.state == SchedulerState::Running {
                        self.begin_cycle(None);
                        return;
                    }
                }
            }
        }
    }

    fn begin_cycle(&mut self, reply: Option<Reply<bool>>) {
        self.cancel_timer();
        self.execution_id += 1;
        self.in_flight = true;
        self.current_reply = reply;

        let execution_id = self.execution_id;
        let pipeline = self.pipeline.clone();
        let config = self.config.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let cycle = tokio::spawn(async move { pipeline.run_cycle(&config, execution_id).await });
            let summary = match cycle.await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(execution_id, error = %e, "Ingestion cycle panicked");
                    CycleSummary::default()
                }
            };
            let _ = sender.send(Command::CycleDone(summary));
        });
    }

    fn finish_cycle(&mut self, summary: CycleSummary) {
        self.in_flight = false;
        self.metrics.record(&summary);
        if let Some(reply) = self.current_reply.take() {
            let _ = reply.send(true);
        }
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        if self.state == SchedulerState::Running
            && summary.wants_follow_up()
            && self.waiting.is_empty()
        {
            self.waiting.push_back(Trigger::FollowUp);
        }
        self.run_next();

        if !self.in_flight && self.state == SchedulerState::Running {
            self.arm_timer();
        }
    }

    fn arm_timer(&mut self) {
        self.cancel_timer();
        let sender = self.sender.clone();
        let execution_id = self.execution_id;
        let delay = self.config.max_idle_delay;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Command::Timer { execution_id });
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Handle to the ingestion actor. Dropping it shuts the actor down.
pub struct IngestionScheduler {
    commands: mpsc::UnboundedSender<Command>,
    reader: Arc<dyn QueueReader>,
    pipeline: Arc<IngestionPipeline>,
    shutdown: CancellationToken,
}

impl IngestionScheduler {
    /// Spawn the actor in the `Idle` state. Must be called inside a tokio
    /// runtime.
    pub fn new(pipeline: IngestionPipeline, config: IngestionConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pipeline = Arc::new(pipeline);
        let shutdown = CancellationToken::new();

        let actor = Actor {
            pipeline: pipeline.clone(),
            config: Arc::new(config),
            sender: sender.clone(),
            state: SchedulerState::Idle,
            execution_id: 0,
            in_flight: false,
            waiting: VecDeque::new(),
            wake_latch: false,
            current_reply: None,
            stop_waiters: Vec::new(),
            subscription: None,
            timer: None,
            metrics: IngestMetrics::default(),
        };
        tokio::spawn(actor.run(receiver, shutdown.clone()));

        Self {
            commands: sender,
            reader: pipeline.reader.clone(),
            pipeline,
            shutdown,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SchedulerError::ChannelClosed)?;
        response.await.map_err(|_| SchedulerError::ChannelClosed)
    }

    /// Subscribe to reader wake-ups and start the reader.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let sender = self.commands.clone();
        let subscription = self.reader.on_new_item(Arc::new(move || {
            let _ = sender.send(Command::Wake);
        }));
        self.request(|reply| Command::Start {
            subscription,
            reply,
        })
        .await??;

        self.reader.start().await?;
        info!(reader = self.reader.name(), "Ingestion scheduler started");
        Ok(())
    }

    /// Detach from the reader, let the in-flight cycle report, flush
    /// escalation, then stop the reader.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Stop { reply }).await??;
        self.pipeline.escalation.flush().await;
        self.reader.stop().await?;
        info!("Ingestion scheduler stopped");
        Ok(())
    }

    /// Run one cycle after every cycle already queued.
    ///
    /// Without `force` nothing runs unless the scheduler is running. Returns
    /// whether a cycle ran.
    pub async fn execute(&self, force: bool) -> Result<bool, SchedulerError> {
        self.request(|reply| Command::Execute { force, reply }).await
    }

    /// Force a cycle and return the metrics afterwards.
    pub async fn trigger(&self) -> Result<SchedulerMetrics, SchedulerError> {
        self.execute(true).await?;
        self.metrics().await
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let state = self.request(|reply| Command::State { reply }).await?;
        Ok(SchedulerStatus {
            running: state == SchedulerState::Running,
            state,
        })
    }

    pub async fn metrics(&self) -> Result<SchedulerMetrics, SchedulerError> {
        let mut ingest = self.request(|reply| Command::Snapshot { reply }).await?;
        ingest.pending = match self.reader.pending_count().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Pending count unavailable");
                0
            }
        };
        Ok(SchedulerMetrics {
            read: self.reader.metrics(),
            ingest,
        })
    }
}

impl Drop for IngestionScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::CountingHandler;
    use async_trait::async_trait;
    use chrono::Utc;
    use explorer_indexing::{
        IndexingError, ListenerSet, NewItemCallback, OutcomeReport, ReaderStatus,
    };
    use explorer_types::{IngestAction, IngestionOutcome, NewEvent, QueueToken, QueuedEvent};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory reader with injectable fetch latency and failures.
    #[derive(Default)]
    struct MemoryReader {
        queue: Mutex<Vec<QueuedEvent>>,
        listeners: Arc<ListenerSet>,
        fetch_calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        fetch_delay: Mutex<Duration>,
        fail_fetch: AtomicBool,
        dropped: Mutex<Vec<QueuedEvent>>,
    }

    impl MemoryReader {
        fn push(&self, id: &str) {
            let row = self.queue.lock().unwrap().len() as i64 + 1;
            self.queue.lock().unwrap().push(QueuedEvent::from_new(
                NewEvent::new(id, "drive", "file", IngestAction::Upsert, 1),
                QueueToken::Row(row),
                Utc::now(),
            ));
        }

        fn push_rejected(&self, id: &str, reason: &str) {
            self.push(id);
            if let Some(event) = self.queue.lock().unwrap().last_mut() {
                event.rejected = Some(reason.to_string());
            }
        }

        fn notify(&self) {
            self.listeners.notify();
        }

        fn queued(&self) -> usize {
            self.queue.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueueReader for MemoryReader {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn start(&self) -> Result<(), IndexingError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), IndexingError> {
            Ok(())
        }

        fn status(&self) -> ReaderStatus {
            ReaderStatus::Running
        }

        async fn fetch_batch(
            &self,
            max_batch_size: usize,
            max_attempt: u32,
        ) -> Result<Vec<QueuedEvent>, IndexingError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);

            let delay = *self.fetch_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(IndexingError::Task("reader offline".into()));
            }
            Ok(self
                .queue
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.attempt_count < max_attempt)
                .take(max_batch_size)
                .cloned()
                .collect())
        }

        async fn report_outcome(
            &self,
            outcome: &IngestionOutcome,
            max_attempt: u32,
        ) -> Result<OutcomeReport, IndexingError> {
            let mut queue = self.queue.lock().unwrap();
            let mut report = OutcomeReport::default();
            for event in &outcome.succeeded {
                queue.retain(|e| e.queue_token != event.queue_token);
                report.acknowledged += 1;
            }
            for event in &outcome.failed {
                let Some(position) = queue.iter().position(|e| e.queue_token == event.queue_token)
                else {
                    continue;
                };
                queue[position].attempt_count += 1;
                if queue[position].attempt_count >= max_attempt {
                    let mut removed = queue.remove(position);
                    removed.error = event.error.clone();
                    report.dropped.push(removed);
                } else {
                    report.requeued += 1;
                }
            }
            self.dropped.lock().unwrap().extend(report.dropped.clone());
            Ok(report)
        }

        fn on_new_item(&self, callback: NewItemCallback) -> Subscription {
            self.listeners.subscribe(callback)
        }

        async fn pending_count(&self) -> Result<u64, IndexingError> {
            Ok(self.queued() as u64)
        }

        fn metrics(&self) -> ReaderMetrics {
            ReaderMetrics::default()
        }
    }

    /// Succeeds for every id except those listed.
    #[derive(Default)]
    struct ScriptedIngester {
        rejected: Vec<String>,
        calls: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl MessageIngester for ScriptedIngester {
        async fn ingest(&self, events: Vec<QueuedEvent>) -> IngestionOutcome {
            let mut outcome = IngestionOutcome::new();
            for mut event in events {
                *self
                    .calls
                    .lock()
                    .unwrap()
                    .entry(event.resource_id.clone())
                    .or_insert(0) += 1;
                if self.rejected.contains(&event.resource_id) {
                    event.fail("rejected", Some("status 400".into()));
                    outcome.failed.push(event);
                } else {
                    outcome.succeeded.push(event);
                }
            }
            outcome
        }
    }

    fn scheduler(
        reader: Arc<MemoryReader>,
        ingester: Arc<ScriptedIngester>,
        escalation: FailureEscalation,
        batch_size: usize,
    ) -> IngestionScheduler {
        let pipeline = IngestionPipeline::new(reader, ingester).with_escalation(escalation);
        let config = IngestionConfig::default()
            .with_batch_size(batch_size)
            .with_max_attempt(3)
            .with_max_idle_delay(Duration::from_secs(3600));
        IngestionScheduler::new(pipeline, config)
    }

    async fn settle(scheduler: &IngestionScheduler) {
        // An execute queued behind everything returns once prior cycles finished
        scheduler.execute(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_executes_never_fetch_concurrently() {
        let reader = Arc::new(MemoryReader::default());
        *reader.fetch_delay.lock().unwrap() = Duration::from_millis(50);
        reader.push("a");
        let scheduler = scheduler(
            reader.clone(),
            Arc::new(ScriptedIngester::default()),
            FailureEscalation::new(),
            10,
        );

        let (first, second) = tokio::join!(scheduler.execute(true), scheduler.execute(true));
        assert!(first.unwrap());
        assert!(second.unwrap());
        assert_eq!(reader.fetch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(reader.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_batches_run_back_to_back() {
        let reader = Arc::new(MemoryReader::default());
        for id in ["a", "b", "c"] {
            reader.push(id);
        }
        let scheduler = scheduler(
            reader.clone(),
            Arc::new(ScriptedIngester::default()),
            FailureEscalation::new(),
            2,
        );
        scheduler.start().await.unwrap();
        reader.notify();

        for _ in 0..100 {
            if reader.queued() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let metrics = scheduler.metrics().await.unwrap();
        assert_eq!(metrics.ingest.cycles, 2);
        assert_eq!(metrics.ingest.succeeded, 3);
        assert_eq!(metrics.ingest.pending, 0);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_retry_until_escalated_once() {
        let reader = Arc::new(MemoryReader::default());
        reader.push("bad");
        let counter = Arc::new(CountingHandler::new());
        let ingester = Arc::new(ScriptedIngester {
            rejected: vec!["bad".into()],
            ..Default::default()
        });
        let scheduler = scheduler(
            reader.clone(),
            ingester.clone(),
            FailureEscalation::new().with_handler(counter.clone()),
            10,
        );
        scheduler.start().await.unwrap();
        reader.notify();

        for _ in 0..100 {
            if counter.total() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        settle(&scheduler).await;

        assert_eq!(counter.total(), 1);
        assert_eq!(ingester.calls.lock().unwrap()["bad"], 3);
        assert_eq!(reader.queued(), 0);
        assert_eq!(reader.dropped.lock().unwrap()[0].error.as_deref(), Some("rejected"));

        let metrics = scheduler.metrics().await.unwrap();
        assert_eq!(metrics.ingest.dropped, 1);
        assert_eq!(metrics.ingest.failed, 3);
    }

    #[tokio::test]
    async fn test_rejected_events_fail_without_ingesting() {
        let reader = Arc::new(MemoryReader::default());
        reader.push_rejected("garbled", "Payload is not a JSON object");
        reader.push("fine");
        let counter = Arc::new(CountingHandler::new());
        let ingester = Arc::new(ScriptedIngester::default());
        let scheduler = scheduler(
            reader.clone(),
            ingester.clone(),
            FailureEscalation::new().with_handler(counter.clone()),
            10,
        );
        scheduler.start().await.unwrap();
        reader.notify();

        for _ in 0..100 {
            if counter.total() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        settle(&scheduler).await;

        assert_eq!(counter.total(), 1);
        assert!(!ingester.calls.lock().unwrap().contains_key("garbled"));
        assert_eq!(ingester.calls.lock().unwrap()["fine"], 1);
        let dropped = reader.dropped.lock().unwrap();
        assert_eq!(dropped[0].resource_id, "garbled");
        assert_eq!(dropped[0].error.as_deref(), Some("Payload is not a JSON object"));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wake_ups_coalesce_while_cycle_runs() {
        let reader = Arc::new(MemoryReader::default());
        *reader.fetch_delay.lock().unwrap() = Duration::from_millis(50);
        reader.push("a");
        let scheduler = scheduler(
            reader.clone(),
            Arc::new(ScriptedIngester::default()),
            FailureEscalation::new(),
            10,
        );
        scheduler.start().await.unwrap();

        reader.notify();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            reader.notify();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The first wake-up plus one coalesced follow-up
        assert_eq!(reader.fetch_calls.load(Ordering::SeqCst), 2);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_error_is_an_empty_cycle() {
        let reader = Arc::new(MemoryReader::default());
        reader.fail_fetch.store(true, Ordering::SeqCst);
        reader.push("a");
        let scheduler = scheduler(
            reader.clone(),
            Arc::new(ScriptedIngester::default()),
            FailureEscalation::new(),
            10,
        );

        let metrics = scheduler.trigger().await.unwrap();
        assert_eq!(metrics.ingest.cycles, 1);
        assert_eq!(metrics.ingest.fetched, 0);
        assert_eq!(metrics.ingest.pending, 1);

        reader.fail_fetch.store(false, Ordering::SeqCst);
        let metrics = scheduler.trigger().await.unwrap();
        assert_eq!(metrics.ingest.succeeded, 1);
        assert_eq!(metrics.ingest.pending, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let reader = Arc::new(MemoryReader::default());
        let scheduler = scheduler(
            reader.clone(),
            Arc::new(ScriptedIngester::default()),
            FailureEscalation::new(),
            10,
        );

        assert_eq!(scheduler.status().await.unwrap().state, SchedulerState::Idle);
        assert!(!scheduler.execute(false).await.unwrap());
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));

        scheduler.start().await.unwrap();
        assert!(scheduler.status().await.unwrap().running);
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        let status = scheduler.status().await.unwrap();
        assert_eq!(status.state, SchedulerState::Stopped);
        assert!(!status.running);

        // Forced runs still work while stopped, wake-ups do not
        reader.push("a");
        reader.notify();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reader.fetch_calls.load(Ordering::SeqCst), 0);
        assert!(scheduler.execute(true).await.unwrap());
        assert_eq!(reader.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_polls_again() {
        let reader = Arc::new(MemoryReader::default());
        let pipeline = IngestionPipeline::new(reader.clone(), Arc::new(ScriptedIngester::default()));
        let config = IngestionConfig::default().with_max_idle_delay(Duration::from_secs(30));
        let scheduler = IngestionScheduler::new(pipeline, config);
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(reader.fetch_calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(reader.fetch_calls.load(Ordering::SeqCst), 2);
        scheduler.stop().await.unwrap();
    }
}
