//! Engine configuration
//!
//! Every field has a default, so a host can deserialize a partial document:
//!
//! ```json
//! {
//!   "name": "cost-features",
//!   "workers": 8,
//!   "visibility": "arrival",
//!   "emit": { "output_field": "total_cost", "keep_fields": ["name", "time"] }
//! }
//! ```

use overwin_core::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name used in logs and backpressure errors
    pub name: String,

    /// Number of partition workers (streaming) or the parallelism hint (batch)
    pub workers: usize,

    /// Bounded queue size per streaming worker
    pub queue_size: usize,

    /// What to do when a worker queue is full
    pub backpressure: BackpressureStrategy,

    /// Which rows count as available to a row
    pub visibility: Visibility,

    /// Whether the incremental path may be used
    pub execution: ExecutionMode,

    /// Output row shaping
    pub emit: EmitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "overwin".to_string(),
            workers: 4,
            queue_size: 1000,
            backpressure: BackpressureStrategy::Block,
            visibility: Visibility::Arrival,
            execution: ExecutionMode::Auto,
            emit: EmitConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_output_field(mut self, output_field: impl Into<String>) -> Self {
        self.emit.output_field = output_field.into();
        self
    }

    pub fn with_keep_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emit.keep_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::invalid("queue_size", "must be at least 1"));
        }
        if self.emit.output_field.trim().is_empty() {
            return Err(ConfigError::invalid(
                "emit.output_field",
                "output field name must not be empty",
            ));
        }
        Ok(())
    }

    /// Streaming hosts cannot see rows that have not arrived yet.
    pub fn validate_streaming(&self) -> ConfigResult<()> {
        self.validate()?;
        if self.visibility == Visibility::EventTime {
            return Err(ConfigError::invalid(
                "visibility",
                "event-time visibility needs the whole input and is only available in batch mode",
            ));
        }
        Ok(())
    }
}

/// Strategy for handling a full worker queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Suspend the coordinator (and so the source) until space is available
    Block,
    /// Fail the run
    Error,
}

/// Which prior rows a row may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Rows that arrived no later than this row and are not timestamped after it
    Arrival,
    /// Every row ordered at or before this row by `(timestamp, sequence_id)`,
    /// including rows that arrived later. Bounded inputs only.
    EventTime,
}

/// Execution path selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Use the sliding accumulator whenever the plan allows it
    Auto,
    /// Always rebuild each row's window from the partition
    FullRecompute,
}

/// Output row shaping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitConfig {
    /// Name of the aggregate column in a single-plan run. Multi-column runs
    /// take their names from the `OverWindowPlan`.
    pub output_field: String,

    /// Source fields to keep; `None` keeps all of them
    pub keep_fields: Option<Vec<String>>,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            output_field: "value".to_string(),
            keep_fields: None,
        }
    }
}
