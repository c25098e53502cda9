//! Overwin Runtime - point-in-time-correct window aggregation
//!
//! This crate evaluates a validated [`AggregationPlan`](overwin_core::AggregationPlan)
//! over resolved rows, producing one aggregate per row from the rows visible
//! to it: same group, not later in `(timestamp, sequence_id)` order, not
//! arrived after it, inside the time window, passing the filter, and within
//! the row-count limit.
//!
//! A run computes one or more named columns, each from its own plan
//! ([`OverWindowPlan`](overwin_core::OverWindowPlan)). Bounded inputs go
//! through [`BatchEngine`]; unbounded inputs through [`StreamingEngine`],
//! which spreads partitions over tokio workers.
//!
//! ```rust,ignore
//! use overwin_core::AggregationRequest;
//! use overwin_runtime::{aggregate, EngineConfig, ResolvedRow};
//!
//! let plan = AggregationRequest::new("cost", "SUM").group_by(["name"]).validate()?;
//! let rows: Vec<ResolvedRow> = load_rows();
//! let output = aggregate(plan, EngineConfig::default(), rows)?;
//! ```

pub mod aggregation;
pub mod config;
pub mod driver;
pub mod emitter;
pub mod error;
pub mod event;
pub mod partition;
pub mod selector;
pub mod sliding;
pub mod stream;
pub mod worker_pool;

pub use aggregation::Aggregator;
pub use config::{BackpressureStrategy, EmitConfig, EngineConfig, ExecutionMode, Visibility};
pub use driver::{
    aggregate, aggregate_columns, BatchEngine, ColumnGroup, ColumnSet, WindowEvaluator,
};
pub use emitter::{OrderedEmitter, OutputRow, ResultEmitter};
pub use error::{EngineError, EngineResult};
pub use event::{Event, EventPosition, FxIndexMap, GroupKey, KeyPart, ResolvedRow, SharedEvent};
pub use partition::{
    retention_for, GroupPartitioner, Insertion, KeepAll, MemoryPartitionStore, Partition,
    PartitionState, PartitionStore, RetentionPolicy, WindowRetention,
};
pub use selector::{CandidateWindow, WindowSelector};
pub use sliding::SlidingState;
pub use stream::{
    ChannelSink, ChannelSource, CollectingSink, ConsoleSink, IterSource, RowSource, Sink,
    SourceItem,
};
pub use worker_pool::{PartitionWorkerPool, RunSummary, StreamingEngine, WorkerReport};
