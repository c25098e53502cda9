//! Engine error types

use overwin_core::{AggError, ConfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Aggregation error at sequence {sequence_id}: {source}")]
    Aggregation {
        sequence_id: u64,
        #[source]
        source: AggError,
    },

    /// Row source or sink failure, passed through untouched.
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),

    #[error("Row {sequence_id} is missing group-by field '{field}'")]
    MissingGroupField { field: String, sequence_id: u64 },

    #[error("Sequence id {got} does not follow {previous}; ids must strictly increase")]
    SequenceRegression { previous: u64, got: u64 },

    #[error("Pool '{pool}' queue full (depth: {queue_depth})")]
    Backpressure { pool: String, queue_depth: usize },

    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

impl EngineError {
    pub fn aggregation(sequence_id: u64, source: AggError) -> Self {
        EngineError::Aggregation {
            sequence_id,
            source,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
