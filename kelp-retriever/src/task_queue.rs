//! Single-worker priority dispatcher.
//!
//! Every engine operation, queries included, runs on exactly one
//! long-lived worker task, so index mutation needs no locking and a query
//! can never observe a partial upsert batch. Submitters enqueue typed
//! requests over a bounded channel and await a oneshot completion handle.
//!
//! Priorities (lower runs earlier): query and stats at 0, analyze batches
//! at 5, maintenance at 9; ties are FIFO by submission sequence. An idle
//! worker synthesizes a maintenance task every `idle_interval`. When HEAD
//! moved, maintenance plans an analysis pass and feeds it back to itself
//! as `AnalyzeChunk` continuations, so a query submitted mid-pass runs
//! before the next batch of files is embedded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::engine::{
    AnalysisPass, AnalyzeSummary, CancelToken, Engine, EngineStats, QueryOptions,
};
use crate::error::{Result, RetrieverError};
use crate::merge::SearchResult;

pub const PRIORITY_QUERY: u8 = 0;
pub const PRIORITY_STATS: u8 = 0;
pub const PRIORITY_ANALYZE_CHUNK: u8 = 5;
pub const PRIORITY_MAINTENANCE: u8 = 9;

/// Queue behavior knobs.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Bounded submission capacity; overflow fails with `Overloaded`.
    pub capacity: usize,
    /// Idle time before a maintenance task is synthesized.
    pub idle_interval: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            idle_interval: Duration::from_secs(10),
        }
    }
}

/// A request a client can submit.
#[derive(Debug)]
pub enum TaskRequest {
    Query { text: String, opts: QueryOptions },
    Stats,
    /// Run a full analyze pass to completion.
    Analyze,
}

/// What a completed task resolves to.
#[derive(Debug)]
pub enum TaskOutput {
    Query(SearchResult),
    Stats(StatusReport),
    Analyze(AnalyzeSummary),
}

/// Stats answer: engine counters plus queue state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub chunks_analyzed: usize,
    pub total_files: usize,
    pub last_analyzed_at: Option<i64>,
    pub queue_depth: usize,
    pub stale: bool,
}

enum TaskKind {
    Query { text: String, opts: QueryOptions },
    Stats,
    Analyze,
    Maintenance,
    AnalyzeChunk,
}

struct QueuedTask {
    priority: u8,
    seq: u64,
    kind: TaskKind,
    deadline: Option<Instant>,
    cancel: CancelToken,
    reply: Option<oneshot::Sender<Result<TaskOutput>>>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so the lowest (priority, seq)
        // pops first. Equal priorities drain FIFO.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A pending completion. Await it for the result; cancel is cooperative
/// and observed at the worker's yield points.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<TaskOutput>>,
    cancel: CancelToken,
}

impl TaskHandle {
    pub async fn wait(self) -> Result<TaskOutput> {
        match self.rx.await {
            Ok(result) => result,
            // Worker dropped the reply: it shut down before execution.
            Err(_) => Err(RetrieverError::Cancelled),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Cloneable submission side of the queue.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<QueuedTask>,
    depth: Arc<AtomicUsize>,
    seq: Arc<AtomicU64>,
}

impl QueueHandle {
    /// Enqueue a request. Fails immediately with `Overloaded` when the
    /// submission queue is at capacity.
    pub fn submit(&self, request: TaskRequest, deadline: Option<Instant>) -> Result<TaskHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = CancelToken::new();
        let (kind, priority) = match request {
            TaskRequest::Query { text, opts } => (TaskKind::Query { text, opts }, PRIORITY_QUERY),
            TaskRequest::Stats => (TaskKind::Stats, PRIORITY_STATS),
            TaskRequest::Analyze => (TaskKind::Analyze, PRIORITY_ANALYZE_CHUNK),
        };
        let task = QueuedTask {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            kind,
            deadline,
            cancel: cancel.clone(),
            reply: Some(reply_tx),
        };
        match self.tx.try_send(task) {
            Ok(()) => {
                self.depth.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(TaskHandle {
                    rx: reply_rx,
                    cancel,
                })
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(RetrieverError::Overloaded),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(RetrieverError::internal("task worker is gone"))
            }
        }
    }

    /// Tasks submitted but not yet completed.
    pub fn depth(&self) -> usize {
        self.depth.load(AtomicOrdering::SeqCst)
    }
}

/// Spawn the worker that owns the engine. The returned handle is the only
/// way to reach it; once every clone is dropped the worker drains what it
/// holds and exits.
pub fn spawn_worker(engine: Engine, config: TaskQueueConfig) -> QueueHandle {
    let (tx, rx) = mpsc::channel(config.capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    let seq = Arc::new(AtomicU64::new(0));
    let handle = QueueHandle {
        tx,
        depth: Arc::clone(&depth),
        seq: Arc::clone(&seq),
    };

    let worker = Worker {
        engine,
        heap: BinaryHeap::new(),
        pass: None,
        depth,
        seq,
        idle_interval: config.idle_interval,
    };
    tokio::spawn(worker.run(rx));
    handle
}

struct Worker {
    engine: Engine,
    heap: BinaryHeap<QueuedTask>,
    pass: Option<AnalysisPass>,
    depth: Arc<AtomicUsize>,
    seq: Arc<AtomicU64>,
    idle_interval: Duration,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<QueuedTask>) {
        // Reconcile against the current repo state before anything else.
        self.push_internal(TaskKind::Maintenance, PRIORITY_MAINTENANCE);

        loop {
            // Move everything already submitted into the priority order.
            loop {
                match rx.try_recv() {
                    Ok(task) => self.heap.push(task),
                    Err(_) => break,
                }
            }

            if self.heap.is_empty() {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(task) => self.heap.push(task),
                        // Every handle dropped and nothing pending: done.
                        None => break,
                    },
                    _ = tokio::time::sleep(self.idle_interval) => {
                        self.push_internal(TaskKind::Maintenance, PRIORITY_MAINTENANCE);
                    }
                }
                continue;
            }

            let Some(task) = self.heap.pop() else {
                continue;
            };
            self.execute(task).await;
        }
        tracing::debug!("task worker exiting");
    }

    fn push_internal(&mut self, kind: TaskKind, priority: u8) {
        self.heap.push(QueuedTask {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            kind,
            deadline: None,
            cancel: CancelToken::new(),
            reply: None,
        });
    }

    async fn execute(&mut self, task: QueuedTask) {
        let external = task.reply.is_some();
        let expired = task
            .deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false);

        let result = if expired || task.cancel.is_cancelled() {
            Err(RetrieverError::Cancelled)
        } else {
            match task.kind {
                TaskKind::Query { text, opts } => self
                    .engine
                    .query(&text, &opts)
                    .await
                    .map(TaskOutput::Query),
                TaskKind::Stats => self.status_report().await.map(TaskOutput::Stats),
                TaskKind::Analyze => {
                    // Finish any in-flight maintenance pass first so the
                    // full pass observes its results instead of redoing
                    // them.
                    self.drain_pass(&task.cancel).await;
                    self.engine
                        .analyze(&task.cancel)
                        .await
                        .map(TaskOutput::Analyze)
                }
                TaskKind::Maintenance => {
                    self.run_maintenance(&task.cancel).await;
                    Ok(TaskOutput::Analyze(AnalyzeSummary {
                        changed: false,
                        files_processed: 0,
                    }))
                }
                TaskKind::AnalyzeChunk => {
                    self.run_analyze_chunk(&task.cancel).await;
                    Ok(TaskOutput::Analyze(AnalyzeSummary {
                        changed: true,
                        files_processed: 0,
                    }))
                }
            }
        };

        if let Some(reply) = task.reply {
            // A submitter that stopped waiting is not an error.
            let _ = reply.send(result);
        } else if let Err(err) = result {
            tracing::error!("internal task failed: {err}");
        }
        if external {
            self.depth.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }

    async fn status_report(&self) -> Result<StatusReport> {
        let EngineStats {
            chunks_analyzed,
            total_files,
            last_analyzed_at,
        } = self.engine.stats();
        let stale = self.engine.is_stale().await.unwrap_or(true);
        Ok(StatusReport {
            chunks_analyzed,
            total_files,
            last_analyzed_at,
            queue_depth: self.depth.load(AtomicOrdering::SeqCst),
            stale,
        })
    }

    async fn drain_pass(&mut self, cancel: &CancelToken) {
        let Some(mut pass) = self.pass.take() else {
            return;
        };
        while !pass.is_done() {
            if let Err(err) = self.engine.run_analysis_batch(&mut pass, cancel).await {
                tracing::error!("abandoning in-flight analysis pass: {err}");
                return;
            }
        }
        if let Err(err) = self.engine.finish_analysis(pass).await {
            tracing::error!("failed to finish analysis pass: {err}");
        }
    }

    async fn run_maintenance(&mut self, cancel: &CancelToken) {
        // A pass already in flight keeps its continuations; don't stack.
        if self.pass.is_some() {
            return;
        }
        match self.engine.begin_analysis(cancel).await {
            Ok(None) => {}
            Ok(Some(pass)) => {
                tracing::debug!("maintenance: {} files to process", pass.remaining_files());
                self.pass = Some(pass);
                self.push_internal(TaskKind::AnalyzeChunk, PRIORITY_ANALYZE_CHUNK);
            }
            Err(err) => tracing::error!("maintenance failed to plan analysis: {err}"),
        }
    }

    async fn run_analyze_chunk(&mut self, cancel: &CancelToken) {
        let Some(mut pass) = self.pass.take() else {
            return;
        };
        match self.engine.run_analysis_batch(&mut pass, cancel).await {
            Ok(()) => {
                if pass.is_done() {
                    if let Err(err) = self.engine.finish_analysis(pass).await {
                        tracing::error!("failed to finish analysis pass: {err}");
                    }
                } else {
                    self.pass = Some(pass);
                    self.push_internal(TaskKind::AnalyzeChunk, PRIORITY_ANALYZE_CHUNK);
                }
            }
            Err(err) => {
                // Abandon the pass; nothing is persisted for it and the
                // next maintenance tick starts over.
                tracing::error!("analysis batch failed: {err}");
            }
        }
    }
}
