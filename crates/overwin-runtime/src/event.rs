//! Row model and ordering

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use overwin_core::Value;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Type alias for IndexMap with FxBuildHasher for faster hashing of row fields.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared reference to an Event. Partitions, sliding state and candidate
/// windows all point at the same immutable event.
pub type SharedEvent = Arc<Event>;

/// A row as produced by the host: expressions already evaluated, sequence
/// already assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRow {
    /// Strictly increasing in arrival order; assigned at ingestion
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    /// Result of evaluating the request's `expr` on this row
    pub value: Value,
    /// Result of evaluating `filter_expr`; true when no filter is configured
    #[serde(default = "default_passes_filter")]
    pub passes_filter: bool,
    /// Source fields carried through to the output row
    #[serde(default)]
    pub fields: FxIndexMap<String, Value>,
}

fn default_passes_filter() -> bool {
    true
}

impl ResolvedRow {
    pub fn new(sequence_id: u64, timestamp: DateTime<Utc>, value: impl Into<Value>) -> Self {
        Self {
            sequence_id,
            timestamp,
            value: value.into(),
            passes_filter: true,
            fields: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_filter(mut self, passes_filter: bool) -> Self {
        self.passes_filter = passes_filter;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Position of an event in the canonical `(timestamp, sequence_id)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventPosition {
    pub timestamp: DateTime<Utc>,
    pub sequence_id: u64,
}

/// One component of a group key.
///
/// Floats are stored by canonical bit pattern so that keys hash and compare
/// structurally (`-0.0` folds into `0.0`, every NaN is the same NaN).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Timestamp(i64),
    Map(String),
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(n) => KeyPart::Int(*n),
            Value::Float(f) => {
                let canonical = if f.is_nan() {
                    f64::NAN
                } else if *f == 0.0 {
                    0.0
                } else {
                    *f
                };
                KeyPart::Float(canonical.to_bits())
            }
            Value::Str(s) => KeyPart::Str(s.clone()),
            Value::Timestamp(ts) => KeyPart::Timestamp(*ts),
            Value::Map(_) => KeyPart::Map(value.to_string()),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "null"),
            KeyPart::Bool(b) => write!(f, "{}", b),
            KeyPart::Int(n) => write!(f, "{}", n),
            KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            KeyPart::Str(s) => write!(f, "{}", s),
            KeyPart::Timestamp(ts) => write!(f, "{}", Value::Timestamp(*ts)),
            KeyPart::Map(rendered) => write!(f, "{}", rendered),
        }
    }
}

/// Ordered tuple of group-by field values. Empty for ungrouped requests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GroupKey(SmallVec<[KeyPart; 2]>);

impl GroupKey {
    /// The single partition used when no group-by keys are configured.
    pub fn global() -> Self {
        Self::default()
    }

    pub fn from_values<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        GroupKey(values.into_iter().map(KeyPart::from).collect())
    }

    /// Derive the key for a row from its carried fields.
    ///
    /// A field that is present but null is a valid key part; a field that is
    /// absent is an error.
    pub fn from_fields(
        fields: &FxIndexMap<String, Value>,
        keys: &[String],
        sequence_id: u64,
    ) -> EngineResult<Self> {
        let mut parts = SmallVec::with_capacity(keys.len());
        for key in keys {
            let value = fields
                .get(key)
                .ok_or_else(|| EngineError::MissingGroupField {
                    field: key.clone(),
                    sequence_id,
                })?;
            parts.push(KeyPart::from(value));
        }
        Ok(GroupKey(parts))
    }

    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<global>");
        }
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

/// A resolved row bound to its partition. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub group_key: GroupKey,
    pub value: Value,
    pub passes_filter: bool,
    pub fields: FxIndexMap<String, Value>,
}

impl Event {
    pub fn from_row(row: ResolvedRow, group_key: GroupKey) -> Self {
        Self {
            sequence_id: row.sequence_id,
            timestamp: row.timestamp,
            group_key,
            value: row.value,
            passes_filter: row.passes_filter,
            fields: row.fields,
        }
    }

    pub fn position(&self) -> EventPosition {
        EventPosition {
            timestamp: self.timestamp,
            sequence_id: self.sequence_id,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}
