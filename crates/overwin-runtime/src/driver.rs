//! Aggregation driver.
//!
//! [`WindowEvaluator`] computes one column's aggregate for a row that has
//! just been inserted into its partition, choosing between the sliding path
//! and a full recompute. A [`ColumnSet`] buckets the columns of a run by their
//! group-by keys so that columns grouped the same way share partitions.
//! [`BatchEngine`] drives a bounded input through it, one rayon task per
//! partition.
//!
//! # Path selection
//!
//! | Plan | Arrival | Path |
//! |------|---------|------|
//! | limit set | any | full recompute |
//! | no limit, `ExecutionMode::FullRecompute` | any | full recompute |
//! | no limit, `ExecutionMode::Auto` | in order | sliding |
//! | no limit, `ExecutionMode::Auto` | out of order | full recompute, sliding state reseeded on the next in-order row |

use crate::aggregation::Aggregator;
use crate::config::{EngineConfig, ExecutionMode, Visibility};
use crate::emitter::{OutputRow, ResultEmitter};
use crate::error::{EngineError, EngineResult};
use crate::event::{GroupKey, ResolvedRow, SharedEvent};
use crate::partition::{
    retention_for, GroupPartitioner, Insertion, MemoryPartitionStore, Partition, PartitionState,
    RetentionPolicy,
};
use crate::selector::WindowSelector;
use crate::sliding::SlidingState;
use overwin_core::{AggError, AggregationPlan, OverWindowPlan, Value};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-row evaluation of one column, shared by the batch and streaming engines.
#[derive(Debug, Clone)]
pub struct WindowEvaluator {
    plan: Arc<AggregationPlan>,
    selector: WindowSelector,
    incremental: bool,
}

impl WindowEvaluator {
    pub fn new(plan: Arc<AggregationPlan>, config: &EngineConfig) -> Self {
        let selector = WindowSelector::new(plan.window, config.visibility);
        let incremental =
            plan.supports_incremental() && config.execution == ExecutionMode::Auto;
        Self {
            plan,
            selector,
            incremental,
        }
    }

    pub fn plan(&self) -> &AggregationPlan {
        &self.plan
    }

    /// Whether in-order rows take the sliding path.
    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Aggregate for `event`, which has already been inserted into
    /// `partition`. `sliding` is this column's accumulator slot.
    pub fn evaluate(
        &self,
        partition: &Partition,
        sliding: &mut Option<SlidingState>,
        event: &SharedEvent,
        insertion: Insertion,
    ) -> Result<Value, AggError> {
        if !self.incremental {
            return self.recompute(partition, event);
        }

        match insertion {
            Insertion::Reordered => {
                if sliding.take().is_some() {
                    warn!(
                        "Row {} arrived out of order in partition {}; dropping {} sliding state",
                        event.sequence_id,
                        partition.key(),
                        self.plan.func
                    );
                }
                self.recompute(partition, event)
            }
            Insertion::Appended => {
                if let Some(state) = sliding.as_mut() {
                    return state.advance(event);
                }
                let candidates = self.selector.select(event, partition);
                let state = SlidingState::seed(
                    self.plan.func,
                    &self.plan.expr,
                    self.plan.window,
                    &candidates,
                )?;
                let value = state.result(candidates.current_admitted())?;
                *sliding = Some(state);
                Ok(value)
            }
        }
    }

    fn recompute(&self, partition: &Partition, event: &SharedEvent) -> Result<Value, AggError> {
        let candidates = self.selector.select(event, partition);
        Aggregator::fold(
            self.plan.func,
            &self.plan.expr,
            candidates.values(),
            candidates.current_admitted(),
        )
    }
}

// ============================================================================
// Column sets
// ============================================================================

/// Columns that group by the same keys and so share partitions.
#[derive(Debug, Clone)]
pub struct ColumnGroup {
    group_by_keys: Arc<[String]>,
    /// Output column index and evaluator; the position in this list is the
    /// column's sliding slot in [`PartitionState`]
    evaluators: Vec<(usize, WindowEvaluator)>,
}

impl ColumnGroup {
    pub fn group_by_keys(&self) -> &Arc<[String]> {
        &self.group_by_keys
    }

    /// Output column indices, in evaluation order.
    pub fn columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.evaluators.iter().map(|(column, _)| *column)
    }

    /// Evaluate every column of the group for `event`, which has already been
    /// inserted. Stops at the first column that fails.
    pub fn evaluate(
        &self,
        state: &mut PartitionState,
        event: &SharedEvent,
        insertion: Insertion,
    ) -> Result<Vec<(usize, Value)>, AggError> {
        let mut values = Vec::with_capacity(self.evaluators.len());
        for (slot, (column, evaluator)) in self.evaluators.iter().enumerate() {
            let (partition, sliding) = state.sliding_slot(slot);
            values.push((*column, evaluator.evaluate(partition, sliding, event, insertion)?));
        }
        Ok(values)
    }
}

/// Every output column of a run, bucketed into [`ColumnGroup`]s.
#[derive(Debug, Clone)]
pub struct ColumnSet {
    names: Arc<[Arc<str>]>,
    groups: Arc<[ColumnGroup]>,
}

impl ColumnSet {
    pub fn new(plan: &OverWindowPlan, config: &EngineConfig) -> Self {
        let mut groups: Vec<ColumnGroup> = Vec::new();
        for (column, col) in plan.columns().iter().enumerate() {
            let evaluator = WindowEvaluator::new(Arc::new(col.plan.clone()), config);
            match groups
                .iter_mut()
                .find(|g| g.group_by_keys == col.plan.group_by_keys)
            {
                Some(group) => group.evaluators.push((column, evaluator)),
                None => groups.push(ColumnGroup {
                    group_by_keys: Arc::clone(&col.plan.group_by_keys),
                    evaluators: vec![(column, evaluator)],
                }),
            }
        }
        Self {
            names: plan.columns().iter().map(|c| Arc::clone(&c.name)).collect(),
            groups: groups.into(),
        }
    }

    /// Output column names, in declaration order.
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    pub fn groups(&self) -> &[ColumnGroup] {
        &self.groups
    }

    /// Retention wide enough for every column.
    pub fn retention(&self) -> Arc<dyn RetentionPolicy> {
        retention_for(
            self.groups
                .iter()
                .flat_map(|g| g.evaluators.iter().map(|(_, e)| e.plan())),
        )
    }

    pub fn partitioners(&self) -> Vec<GroupPartitioner> {
        self.groups
            .iter()
            .map(|g| GroupPartitioner::new(Arc::clone(&g.group_by_keys)))
            .collect()
    }

    fn incremental_columns(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.evaluators.iter())
            .filter(|(_, e)| e.is_incremental())
            .count()
    }
}

/// Resolve one row into an event per column group, in group order.
pub(crate) fn resolve_all(
    partitioners: &mut [GroupPartitioner],
    row: ResolvedRow,
) -> EngineResult<Vec<SharedEvent>> {
    let mut events = Vec::with_capacity(partitioners.len());
    if let Some((last, rest)) = partitioners.split_last_mut() {
        for partitioner in rest {
            events.push(partitioner.resolve(row.clone())?);
        }
        events.push(last.resolve(row)?);
    }
    Ok(events)
}

// ============================================================================
// Batch execution
// ============================================================================

/// Runs a set of columns over a bounded input.
pub struct BatchEngine {
    config: EngineConfig,
    columns: ColumnSet,
    emitter: ResultEmitter,
    pool: rayon::ThreadPool,
}

/// Rows of one partition of one column group, with their input index.
struct PartitionJob {
    group: usize,
    events: Vec<(usize, SharedEvent)>,
}

impl BatchEngine {
    /// One column named after `config.emit.output_field`.
    pub fn new(plan: AggregationPlan, config: EngineConfig) -> EngineResult<Self> {
        let plan = OverWindowPlan::single(config.emit.output_field.as_str(), plan);
        Self::with_columns(plan, config)
    }

    pub fn with_columns(plan: OverWindowPlan, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("overwin-batch-{}", i))
            .build()
            .map_err(|e| EngineError::WorkerFailed(e.to_string()))?;
        let columns = ColumnSet::new(&plan, &config);
        let emitter = ResultEmitter::new(config.emit.clone());
        Ok(Self {
            config,
            columns,
            emitter,
            pool,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    /// Aggregate every row and return the output in input order, one column
    /// per plan.
    ///
    /// Rows must carry strictly increasing sequence ids. Under
    /// [`Visibility::EventTime`] each partition is replayed in
    /// `(timestamp, sequence_id)` order so that rows see late arrivals with
    /// earlier timestamps; otherwise partitions are replayed in arrival order.
    pub fn run(&self, rows: Vec<ResolvedRow>) -> EngineResult<Vec<OutputRow>> {
        let total = rows.len();
        let groups = self.columns.groups();
        let mut partitioners = self.columns.partitioners();
        let mut heads: Vec<Option<SharedEvent>> = Vec::with_capacity(total);
        let mut partitions: Vec<FxHashMap<GroupKey, Vec<(usize, SharedEvent)>>> =
            vec![FxHashMap::default(); groups.len()];
        for (idx, row) in rows.into_iter().enumerate() {
            let events = resolve_all(&mut partitioners, row)?;
            heads.push(events.first().cloned());
            for (group, event) in events.into_iter().enumerate() {
                partitions[group]
                    .entry(event.group_key.clone())
                    .or_default()
                    .push((idx, event));
            }
        }

        let jobs: Vec<PartitionJob> = partitions
            .into_iter()
            .enumerate()
            .flat_map(|(group, by_key)| {
                by_key
                    .into_values()
                    .map(move |events| PartitionJob { group, events })
            })
            .collect();

        info!(
            "Batch '{}' evaluating {} rows: {} columns in {} groups, {} partitions, {} sliding",
            self.config.name,
            total,
            self.columns.names().len(),
            groups.len(),
            jobs.len(),
            self.columns.incremental_columns()
        );

        let visibility = self.config.visibility;
        let outcomes: Vec<EngineResult<Vec<(usize, Vec<(usize, Value)>)>>> =
            self.pool.install(|| {
                jobs.into_par_iter()
                    .map(|mut job| {
                        if visibility == Visibility::EventTime {
                            job.events.sort_by_key(|(_, e)| e.position());
                        }
                        self.run_partition(&groups[job.group], job.events)
                    })
                    .collect()
            });

        let width = self.columns.names().len();
        let mut slots: Vec<Vec<Value>> = vec![vec![Value::Null; width]; total];
        let mut first_error: Option<EngineError> = None;
        for outcome in outcomes {
            match outcome {
                Ok(rows) => {
                    for (idx, values) in rows {
                        for (column, value) in values {
                            slots[idx][column] = value;
                        }
                    }
                }
                Err(err) => {
                    // Keep the failure that happened earliest in the input
                    if earlier(&err, first_error.as_ref()) {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let names = self.columns.names();
        Ok(heads
            .into_iter()
            .zip(slots)
            .filter_map(|(event, values)| {
                let event = event?;
                let columns = names.iter().map(|n| &**n).zip(values);
                Some(self.emitter.emit(&event, columns))
            })
            .collect())
    }

    fn run_partition(
        &self,
        group: &ColumnGroup,
        events: Vec<(usize, SharedEvent)>,
    ) -> EngineResult<Vec<(usize, Vec<(usize, Value)>)>> {
        let mut store = MemoryPartitionStore::new();
        let mut out = Vec::with_capacity(events.len());
        for (idx, event) in events {
            let (state, insertion) = GroupPartitioner::assign(&event, &mut store);
            let values = group
                .evaluate(state, &event, insertion)
                .map_err(|e| EngineError::aggregation(event.sequence_id, e))?;
            out.push((idx, values));
        }
        Ok(out)
    }
}

fn earlier(candidate: &EngineError, current: Option<&EngineError>) -> bool {
    let seq = |err: &EngineError| match err {
        EngineError::Aggregation { sequence_id, .. } => *sequence_id,
        _ => u64::MAX,
    };
    current.map_or(true, |current| seq(candidate) < seq(current))
}

/// Convenience wrapper for a one-shot, one-column batch run.
pub fn aggregate(
    plan: AggregationPlan,
    config: EngineConfig,
    rows: Vec<ResolvedRow>,
) -> EngineResult<Vec<OutputRow>> {
    BatchEngine::new(plan, config)?.run(rows)
}

/// Convenience wrapper for a one-shot batch run over several columns.
pub fn aggregate_columns(
    plan: OverWindowPlan,
    config: EngineConfig,
    rows: Vec<ResolvedRow>,
) -> EngineResult<Vec<OutputRow>> {
    BatchEngine::with_columns(plan, config)?.run(rows)
}

// ============================================================================
// Tests
// ============================================================================
