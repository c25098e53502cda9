//! Partition worker pool and the streaming engine.
//!
//! Partitions have no data dependency on each other, so the streaming engine
//! spreads them over a fixed set of tokio worker tasks. A partition is pinned
//! to one worker by hashing its group key, which keeps its rows in arrival
//! order and gives that worker exclusive ownership of the partition state.
//! Columns with different group-by keys form separate column groups; a row is
//! routed once per group and the emitter merges the column values back into
//! one output row.
//!
//! ```text
//!   RowSource ──► coordinator ──► worker 0 ─┐
//!                     │      └──► worker 1 ─┼──► results ──► OrderedEmitter ──► Sink
//!                     │      └──► worker N ─┘
//!                     └─ watermarks broadcast, retirements routed by key
//! ```
//!
//! Worker queues are bounded: with [`BackpressureStrategy::Block`] a full
//! queue suspends the coordinator and so stops pulling from the source; with
//! [`BackpressureStrategy::Error`] the run fails. Results flow back on an
//! unbounded channel, so workers never wait on the coordinator.
//!
//! # Example
//! ```ignore
//! let engine = StreamingEngine::new(plan, EngineConfig::default())?;
//! let (tx, source) = overwin_runtime::stream::channel("rows", 1024);
//! let summary = engine.run(source, &ConsoleSink::new("out")).await?;
//! ```

use crate::config::{BackpressureStrategy, EngineConfig};
use crate::driver::{resolve_all, ColumnSet};
use crate::emitter::{OrderedEmitter, ResultEmitter};
use crate::error::{EngineError, EngineResult};
use crate::event::{GroupKey, SharedEvent};
use crate::partition::{GroupPartitioner, MemoryPartitionStore, PartitionStore, RetentionPolicy};
use crate::stream::{RowSource, Sink, SourceItem};
use chrono::{DateTime, Utc};
use overwin_core::{AggError, AggregationPlan, OverWindowPlan, Value};
use rustc_hash::FxHasher;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Message sent from the coordinator to one worker
#[derive(Debug)]
enum WorkerMessage {
    /// A row resolved for one column group
    Row { group: usize, event: SharedEvent },
    Watermark(DateTime<Utc>),
    Retire(GroupKey),
}

/// Message sent from a worker back to the coordinator
#[derive(Debug)]
pub enum WorkerReport {
    /// Values of the columns of one group for one row, keyed by column index
    Output {
        sequence_id: u64,
        values: Vec<(usize, Value)>,
    },
    Failed {
        sequence_id: u64,
        error: AggError,
    },
    Expired(usize),
    Retired(bool),
}

/// Counters for one streaming run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Rows emitted to the sink
    pub rows: u64,
    pub watermarks: u64,
    pub partitions_retired: u64,
    /// Partitions dropped by the retention policy
    pub partitions_expired: u64,
    /// Rows that arrived with a timestamp behind the current watermark
    pub late_rows: u64,
}

/// Fixed set of partition workers with key affinity.
pub struct PartitionWorkerPool {
    name: String,
    backpressure: BackpressureStrategy,
    queue_size: usize,
    senders: Vec<mpsc::Sender<WorkerMessage>>,
    handles: Vec<JoinHandle<()>>,
    results: mpsc::UnboundedReceiver<WorkerReport>,
}

impl PartitionWorkerPool {
    /// Spawn workers that keep their partitions in memory.
    pub fn spawn(
        config: &EngineConfig,
        columns: ColumnSet,
        retention: Arc<dyn RetentionPolicy>,
    ) -> Self {
        Self::spawn_with_store(config, columns, retention, |_| MemoryPartitionStore::new())
    }

    /// Spawn workers, each owning one store per column group built by
    /// `make_store`, which receives the worker id.
    pub fn spawn_with_store<S, F>(
        config: &EngineConfig,
        columns: ColumnSet,
        retention: Arc<dyn RetentionPolicy>,
        make_store: F,
    ) -> Self
    where
        S: PartitionStore + 'static,
        F: Fn(usize) -> S,
    {
        let workers = config.workers.max(1);
        let (results_tx, results) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = mpsc::channel(config.queue_size.max(1));
            let stores = columns.groups().iter().map(|_| make_store(id)).collect();
            senders.push(tx);
            handles.push(tokio::spawn(worker_task(
                id,
                rx,
                results_tx.clone(),
                stores,
                columns.clone(),
                Arc::clone(&retention),
            )));
        }

        info!(
            "Worker pool '{}' started with {} workers",
            config.name, workers
        );

        Self {
            name: config.name.clone(),
            backpressure: config.backpressure,
            queue_size: config.queue_size,
            senders,
            handles,
            results,
        }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Worker that owns `key`. Stable for the life of the pool.
    pub fn worker_for(&self, key: &GroupKey) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.handles.len().max(1) as u64) as usize
    }

    /// Send an event resolved for column group `group` to the worker owning
    /// its partition.
    pub async fn submit(&self, group: usize, event: SharedEvent) -> EngineResult<()> {
        let worker = self.worker_for(&event.group_key);
        self.dispatch(worker, WorkerMessage::Row { group, event })
            .await
    }

    pub async fn broadcast_watermark(&self, watermark: DateTime<Utc>) -> EngineResult<()> {
        for worker in 0..self.senders.len() {
            self.dispatch(worker, WorkerMessage::Watermark(watermark))
                .await?;
        }
        Ok(())
    }

    /// Partitions with this key live on one worker whatever their column
    /// group, so one message retires all of them.
    pub async fn retire(&self, key: GroupKey) -> EngineResult<()> {
        let worker = self.worker_for(&key);
        self.dispatch(worker, WorkerMessage::Retire(key)).await
    }

    /// Next report from any worker; `None` once every worker has exited.
    pub async fn next_report(&mut self) -> Option<WorkerReport> {
        self.results.recv().await
    }

    /// Close the worker queues. Workers finish what is queued, then exit.
    pub fn close(&mut self) {
        self.senders.clear();
    }

    /// Wait for every worker to exit.
    pub async fn join(self) -> EngineResult<()> {
        for handle in self.handles {
            handle
                .await
                .map_err(|e| EngineError::WorkerFailed(e.to_string()))?;
        }
        info!("Worker pool '{}' shut down", self.name);
        Ok(())
    }

    async fn dispatch(&self, worker: usize, message: WorkerMessage) -> EngineResult<()> {
        let sender = self
            .senders
            .get(worker)
            .ok_or_else(|| EngineError::WorkerFailed(format!("worker {} is closed", worker)))?;

        match self.backpressure {
            BackpressureStrategy::Block => sender.send(message).await.map_err(|_| {
                warn!("Pool '{}' dispatch channel closed", self.name);
                EngineError::WorkerFailed(format!("worker {} exited", worker))
            }),
            BackpressureStrategy::Error => match sender.try_send(message) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(EngineError::Backpressure {
                    pool: self.name.clone(),
                    queue_depth: self.queue_size - sender.capacity(),
                }),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Pool '{}' dispatch channel closed", self.name);
                    Err(EngineError::WorkerFailed(format!("worker {} exited", worker)))
                }
            },
        }
    }
}

async fn worker_task<S: PartitionStore>(
    id: usize,
    mut rx: mpsc::Receiver<WorkerMessage>,
    results: mpsc::UnboundedSender<WorkerReport>,
    mut stores: Vec<S>,
    columns: ColumnSet,
    retention: Arc<dyn RetentionPolicy>,
) {
    // After a failure the queue stays open and is drained unprocessed until
    // the coordinator, which ends the run on the failure report, closes it.
    let mut failed = false;
    while let Some(message) = rx.recv().await {
        if failed {
            continue;
        }
        let report = match message {
            WorkerMessage::Row { group, event } => {
                let (Some(evaluators), Some(store)) =
                    (columns.groups().get(group), stores.get_mut(group))
                else {
                    warn!(
                        "Partition worker {} got row {} for unknown column group {}",
                        id, event.sequence_id, group
                    );
                    continue;
                };
                let (state, insertion) = GroupPartitioner::assign(&event, store);
                match evaluators.evaluate(state, &event, insertion) {
                    Ok(values) => WorkerReport::Output {
                        sequence_id: event.sequence_id,
                        values,
                    },
                    Err(error) => WorkerReport::Failed {
                        sequence_id: event.sequence_id,
                        error,
                    },
                }
            }
            WorkerMessage::Watermark(watermark) => WorkerReport::Expired(
                stores
                    .iter_mut()
                    .map(|store| store.expire(watermark, retention.as_ref()))
                    .sum(),
            ),
            WorkerMessage::Retire(key) => {
                let mut removed = false;
                for store in &mut stores {
                    removed |= store.remove(&key).is_some();
                }
                WorkerReport::Retired(removed)
            }
        };
        if let WorkerReport::Failed { sequence_id, .. } = &report {
            warn!(
                "Partition worker {} failed at sequence {}; discarding further work",
                id, sequence_id
            );
            failed = true;
        }
        if results.send(report).is_err() {
            break;
        }
    }
    debug!(
        "Partition worker {} exiting with {} partitions",
        id,
        stores.iter().map(|s| s.len()).sum::<usize>()
    );
}

// ============================================================================
// Streaming engine
// ============================================================================

/// Runs a set of columns over an unbounded row source.
pub struct StreamingEngine {
    columns: ColumnSet,
    config: EngineConfig,
    retention: Arc<dyn RetentionPolicy>,
}

impl StreamingEngine {
    /// One column named after `config.emit.output_field`.
    ///
    /// Fails for settings a streaming run cannot honour, such as event-time
    /// visibility.
    pub fn new(plan: AggregationPlan, config: EngineConfig) -> EngineResult<Self> {
        let plan = OverWindowPlan::single(config.emit.output_field.as_str(), plan);
        Self::with_columns(plan, config)
    }

    pub fn with_columns(plan: OverWindowPlan, config: EngineConfig) -> EngineResult<Self> {
        config.validate_streaming()?;
        let columns = ColumnSet::new(&plan, &config);
        let retention = columns.retention();
        Ok(Self {
            columns,
            config,
            retention,
        })
    }

    /// Replace the plan-derived retention policy.
    pub fn with_retention(mut self, retention: Arc<dyn RetentionPolicy>) -> Self {
        self.retention = retention;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    /// Consume `source` until it is exhausted, sending one output row per
    /// input row to `sink` in arrival order.
    ///
    /// The first error (source, sink, ordering or aggregation) ends the run.
    /// `RowSource::next` must be cancel safe: a pending call is dropped when a
    /// worker result arrives first.
    pub async fn run<R, S>(&self, mut source: R, sink: &S) -> EngineResult<RunSummary>
    where
        R: RowSource,
        S: Sink + ?Sized,
    {
        let mut pool = PartitionWorkerPool::spawn(
            &self.config,
            self.columns.clone(),
            Arc::clone(&self.retention),
        );
        let mut partitioners = self.columns.partitioners();
        let mut ordered = OrderedEmitter::new(
            ResultEmitter::new(self.config.emit.clone()),
            self.columns.names(),
        );
        let mut summary = RunSummary::default();
        let mut watermark: Option<DateTime<Utc>> = None;

        info!(
            "Streaming engine '{}' started: {} columns in {} groups into sink '{}'",
            self.config.name,
            self.columns.names().len(),
            self.columns.groups().len(),
            sink.name()
        );

        loop {
            tokio::select! {
                biased;

                report = pool.next_report() => match report {
                    Some(report) => {
                        handle_report(report, &mut ordered, &mut summary, sink).await?;
                    }
                    None => return Err(EngineError::WorkerFailed(
                        "all partition workers exited".to_string(),
                    )),
                },

                item = source.next() => match item? {
                    Some(SourceItem::Row(row)) => {
                        if let Some(wm) = watermark {
                            if row.timestamp < wm {
                                warn!(
                                    "Row {} at {} is behind watermark {}",
                                    row.sequence_id, row.timestamp, wm
                                );
                                summary.late_rows += 1;
                            }
                        }
                        let events = resolve_all(&mut partitioners, row)?;
                        if let Some(head) = events.first() {
                            ordered.expect(Arc::clone(head));
                        }
                        for (group, event) in events.into_iter().enumerate() {
                            pool.submit(group, event).await?;
                        }
                    }
                    Some(SourceItem::Watermark(wm)) => {
                        summary.watermarks += 1;
                        if watermark.map_or(true, |current| wm > current) {
                            watermark = Some(wm);
                            pool.broadcast_watermark(wm).await?;
                        } else {
                            debug!("Ignoring watermark {} that does not advance", wm);
                        }
                    }
                    Some(SourceItem::Retire(key)) => {
                        debug!("Retiring partition {}", key);
                        pool.retire(key).await?;
                    }
                    None => break,
                },
            }
        }

        pool.close();
        while let Some(report) = pool.next_report().await {
            handle_report(report, &mut ordered, &mut summary, sink).await?;
        }
        pool.join().await?;

        if ordered.in_flight() > 0 {
            return Err(EngineError::WorkerFailed(format!(
                "{} rows were dispatched but never completed",
                ordered.in_flight()
            )));
        }
        sink.flush().await?;

        info!(
            "Streaming engine '{}' finished: {} rows, {} watermarks, {} partitions retired, {} expired, {} late rows",
            self.config.name,
            summary.rows,
            summary.watermarks,
            summary.partitions_retired,
            summary.partitions_expired,
            summary.late_rows
        );
        Ok(summary)
    }
}

async fn handle_report<S: Sink + ?Sized>(
    report: WorkerReport,
    ordered: &mut OrderedEmitter,
    summary: &mut RunSummary,
    sink: &S,
) -> EngineResult<()> {
    match report {
        WorkerReport::Output {
            sequence_id,
            values,
        } => {
            for ready in ordered.complete(sequence_id, values) {
                sink.send(&ready).await?;
                summary.rows += 1;
            }
        }
        WorkerReport::Failed { sequence_id, error } => {
            return Err(EngineError::aggregation(sequence_id, error));
        }
        WorkerReport::Expired(dropped) => summary.partitions_expired += dropped as u64,
        WorkerReport::Retired(removed) => {
            if removed {
                summary.partitions_retired += 1;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
