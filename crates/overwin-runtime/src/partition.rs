//! Group partitioning and the keyed partition store.
//!
//! A [`Partition`] holds the events of one group key in ascending
//! `(timestamp, sequence_id)` order. Partitions live in a [`PartitionStore`],
//! which is a capability handed to the driver so that hosts decide how long
//! rows are kept ([`RetentionPolicy`]).

use crate::error::{EngineError, EngineResult};
use crate::event::{Event, EventPosition, GroupKey, ResolvedRow, SharedEvent};
use crate::sliding::SlidingState;
use chrono::{DateTime, Duration, Utc};
use overwin_core::AggregationPlan;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Where an insertion landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// After every existing entry
    Appended,
    /// Before at least one existing entry (out-of-order arrival)
    Reordered,
}

/// Ordered events of one group.
#[derive(Debug, Clone)]
pub struct Partition {
    key: GroupKey,
    entries: VecDeque<SharedEvent>,
}

impl Partition {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            entries: VecDeque::new(),
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn entries(&self) -> &VecDeque<SharedEvent> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_position(&self) -> Option<EventPosition> {
        self.entries.back().map(|e| e.position())
    }

    /// Insert keeping `(timestamp, sequence_id)` order.
    pub fn insert(&mut self, event: SharedEvent) -> Insertion {
        let position = event.position();
        match self.last_position() {
            Some(last) if position < last => {
                let idx = self.entries.partition_point(|e| e.position() < position);
                self.entries.insert(idx, event);
                Insertion::Reordered
            }
            _ => {
                self.entries.push_back(event);
                Insertion::Appended
            }
        }
    }

    /// Drop entries timestamped strictly before `cutoff`. Returns how many
    /// were removed.
    pub fn expire_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let idx = self.entries.partition_point(|e| e.timestamp < cutoff);
        self.entries.drain(..idx);
        idx
    }
}

/// A partition together with the incremental accumulators of the columns
/// evaluated over it.
///
/// `sliding` holds one slot per column. A slot is `None` until the first
/// in-order row seeds it and again after an out-of-order arrival invalidates
/// it.
#[derive(Debug)]
pub struct PartitionState {
    pub partition: Partition,
    pub sliding: Vec<Option<SlidingState>>,
}

impl PartitionState {
    pub fn new(key: GroupKey) -> Self {
        Self {
            partition: Partition::new(key),
            sliding: Vec::new(),
        }
    }

    /// Sliding slot of column `slot`, allocated on first use.
    pub fn sliding_slot(&mut self, slot: usize) -> (&Partition, &mut Option<SlidingState>) {
        if self.sliding.len() <= slot {
            self.sliding.resize_with(slot + 1, || None);
        }
        (&self.partition, &mut self.sliding[slot])
    }
}

// ============================================================================
// Retention
// ============================================================================

/// Decides which rows a partition may forget once the watermark has passed.
pub trait RetentionPolicy: Send + Sync {
    /// Rows timestamped strictly before the returned instant may be dropped.
    fn cutoff(&self, watermark: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Never drop anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl RetentionPolicy for KeepAll {
    fn cutoff(&self, _watermark: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
}

/// Drop rows that no row at or after the watermark can see.
#[derive(Debug, Clone, Copy)]
pub struct WindowRetention {
    pub window_size: Duration,
}

impl RetentionPolicy for WindowRetention {
    fn cutoff(&self, watermark: DateTime<Utc>) -> Option<DateTime<Utc>> {
        watermark.checked_sub_signed(self.window_size)
    }
}

/// Default retention for the plans sharing a store: rows older than the
/// widest window behind the watermark can go; one unbounded window keeps
/// everything.
pub fn retention_for<'a, I>(plans: I) -> Arc<dyn RetentionPolicy>
where
    I: IntoIterator<Item = &'a AggregationPlan>,
{
    let mut widest: Option<Duration> = None;
    for plan in plans {
        match plan.window.window_size {
            Some(window_size) => {
                widest = Some(widest.map_or(window_size, |w| w.max(window_size)));
            }
            None => return Arc::new(KeepAll),
        }
    }
    match widest {
        Some(window_size) => Arc::new(WindowRetention { window_size }),
        None => Arc::new(KeepAll),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Keyed store of partition state.
pub trait PartitionStore: Send {
    /// Look up a partition, creating it on first use.
    fn entry(&mut self, key: &GroupKey) -> &mut PartitionState;

    fn get(&self, key: &GroupKey) -> Option<&PartitionState>;

    /// Tear down one partition, discarding its accumulator state.
    fn remove(&mut self, key: &GroupKey) -> Option<PartitionState>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Vec<GroupKey>;

    /// Apply a retention policy at a watermark. Partitions left empty are
    /// dropped. Returns the number of partitions dropped.
    fn expire(&mut self, watermark: DateTime<Utc>, policy: &dyn RetentionPolicy) -> usize;
}

/// In-memory store backed by an `FxHashMap`.
#[derive(Debug, Default)]
pub struct MemoryPartitionStore {
    partitions: FxHashMap<GroupKey, PartitionState>,
}

impl MemoryPartitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PartitionStore for MemoryPartitionStore {
    fn entry(&mut self, key: &GroupKey) -> &mut PartitionState {
        if !self.partitions.contains_key(key) {
            debug!("Creating partition {}", key);
        }
        self.partitions
            .entry(key.clone())
            .or_insert_with(|| PartitionState::new(key.clone()))
    }

    fn get(&self, key: &GroupKey) -> Option<&PartitionState> {
        self.partitions.get(key)
    }

    fn remove(&mut self, key: &GroupKey) -> Option<PartitionState> {
        let removed = self.partitions.remove(key);
        if removed.is_some() {
            debug!("Retired partition {}", key);
        }
        removed
    }

    fn len(&self) -> usize {
        self.partitions.len()
    }

    fn keys(&self) -> Vec<GroupKey> {
        let mut keys: Vec<GroupKey> = self.partitions.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn expire(&mut self, watermark: DateTime<Utc>, policy: &dyn RetentionPolicy) -> usize {
        let Some(cutoff) = policy.cutoff(watermark) else {
            return 0;
        };
        let before = self.partitions.len();
        self.partitions.retain(|key, state| {
            let removed = state.partition.expire_before(cutoff);
            if removed > 0 {
                debug!("Expired {} rows from partition {}", removed, key);
                // reseed from what is left on the next in-order row
                state.sliding.fill(None);
            }
            !state.partition.is_empty()
        });
        before - self.partitions.len()
    }
}

// ============================================================================
// Partitioner
// ============================================================================

/// Turns resolved rows into events bound to a group key.
///
/// Sequence ids must strictly increase across every row the partitioner sees,
/// regardless of group.
#[derive(Debug, Clone)]
pub struct GroupPartitioner {
    group_by_keys: Arc<[String]>,
    last_sequence: Option<u64>,
}

impl GroupPartitioner {
    pub fn new(group_by_keys: Arc<[String]>) -> Self {
        Self {
            group_by_keys,
            last_sequence: None,
        }
    }

    pub fn group_by_keys(&self) -> &Arc<[String]> {
        &self.group_by_keys
    }

    /// Resolve a row into an event without assigning it to a store.
    pub fn resolve(&mut self, row: ResolvedRow) -> EngineResult<SharedEvent> {
        if let Some(previous) = self.last_sequence {
            if row.sequence_id <= previous {
                return Err(EngineError::SequenceRegression {
                    previous,
                    got: row.sequence_id,
                });
            }
        }
        let key = GroupKey::from_fields(&row.fields, &self.group_by_keys, row.sequence_id)?;
        self.last_sequence = Some(row.sequence_id);
        Ok(Arc::new(Event::from_row(row, key)))
    }

    /// Insert a resolved event into the partition of its group key, creating
    /// the partition on first use.
    pub fn assign<'s, S: PartitionStore + ?Sized>(
        event: &SharedEvent,
        store: &'s mut S,
    ) -> (&'s mut PartitionState, Insertion) {
        let state = store.entry(&event.group_key);
        let insertion = state.partition.insert(Arc::clone(event));
        (state, insertion)
    }
}

// ============================================================================
// Tests
// ============================================================================
