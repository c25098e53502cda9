//! Aggregation requests and their validated plans.
//!
//! An [`AggregationRequest`] is the declarative shape a host hands over:
//!
//! ```json
//! {
//!   "expr": "cost",
//!   "agg_func": "SUM",
//!   "group_by_keys": ["name"],
//!   "window_size_ms": 120000,
//!   "filter_expr": "action = 'pay'",
//!   "limit": 2
//! }
//! ```
//!
//! `expr` and `filter_expr` are opaque here: the host evaluates them before
//! rows reach the engine. [`AggregationRequest::validate`] performs every
//! check that can fail, so a plan never fails for configuration reasons once
//! rows start flowing.

use crate::agg::AggFunc;
use crate::error::{ConfigError, ConfigResult};
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Declarative request for one windowed aggregate column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AggregationRequest {
    /// Expression producing the aggregated value (resolved upstream)
    pub expr: String,

    /// Aggregation function name such as `SUM` or `VALUE_COUNTS`
    pub agg_func: String,

    /// Fields forming the group key; empty means one global partition
    pub group_by_keys: Vec<String>,

    /// Time bound in milliseconds; rows in `[t - window, t]` are eligible
    #[serde(deserialize_with = "deserialize_millis")]
    pub window_size_ms: Option<i64>,

    /// Predicate a row must satisfy to be aggregated (resolved upstream)
    pub filter_expr: Option<String>,

    /// Maximum number of most recent eligible rows
    pub limit: Option<i64>,
}

impl AggregationRequest {
    pub fn new(expr: impl Into<String>, agg_func: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            agg_func: agg_func.into(),
            ..Default::default()
        }
    }

    pub fn group_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sub-millisecond remainders are dropped.
    pub fn window_size(mut self, window: Duration) -> Self {
        self.window_size_ms = Some(window.num_milliseconds());
        self
    }

    pub fn filter(mut self, filter_expr: impl Into<String>) -> Self {
        self.filter_expr = Some(filter_expr.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Validate the request into an executable plan.
    pub fn validate(&self) -> ConfigResult<AggregationPlan> {
        if self.expr.trim().is_empty() {
            return Err(ConfigError::MissingField("expr"));
        }
        if self.agg_func.trim().is_empty() {
            return Err(ConfigError::MissingField("agg_func"));
        }
        let func: AggFunc = self.agg_func.parse()?;

        let mut seen = HashSet::with_capacity(self.group_by_keys.len());
        for key in &self.group_by_keys {
            if key.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "group_by_keys",
                    "group-by key names must not be empty",
                ));
            }
            if !seen.insert(key.as_str()) {
                return Err(ConfigError::DuplicateGroupKey(key.clone()));
            }
        }

        let window_size = match self.window_size_ms {
            Some(ms) if ms < 1 => return Err(ConfigError::InvalidWindowSize(ms)),
            Some(ms) => Some(Duration::milliseconds(ms)),
            None => None,
        };

        let limit = match self.limit {
            Some(n) => Some(
                usize::try_from(n)
                    .ok()
                    .and_then(NonZeroUsize::new)
                    .ok_or(ConfigError::InvalidLimit(n))?,
            ),
            None => None,
        };

        let filter_expr = self
            .filter_expr
            .as_ref()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());

        Ok(AggregationPlan {
            func,
            expr: Arc::from(self.expr.trim()),
            group_by_keys: self.group_by_keys.iter().cloned().collect(),
            window: WindowSpec {
                window_size,
                limit,
                filtered: filter_expr.is_some(),
            },
            filter_expr,
        })
    }
}

/// Accepts integral or floating-point milliseconds.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Millis>::deserialize(deserializer)? {
        None => None,
        Some(Millis::Int(ms)) => Some(ms),
        Some(Millis::Float(ms)) => Some(ms.trunc() as i64),
    })
}

/// Bounds that select the candidate window for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSpec {
    /// `None` means no time bound
    pub window_size: Option<Duration>,
    /// `None` means no row-count bound
    pub limit: Option<NonZeroUsize>,
    /// Whether rows failing the filter are excluded
    pub filtered: bool,
}

impl WindowSpec {
    /// Inclusive lower time bound for a row at `ts`.
    pub fn lower_bound(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window_size
            .map(|w| ts.checked_sub_signed(w).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }

    /// Whether a row with this filter outcome may be admitted.
    pub fn admits(&self, passes_filter: bool) -> bool {
        !self.filtered || passes_filter
    }
}

/// A validated, immutable aggregation request.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPlan {
    pub func: AggFunc,
    pub expr: Arc<str>,
    pub group_by_keys: Arc<[String]>,
    pub window: WindowSpec,
    pub filter_expr: Option<String>,
}

impl AggregationPlan {
    /// Whether the sliding (add/remove) path can serve this plan.
    ///
    /// A row-count limit makes the admitted set depend on rows that are
    /// pushed out by newer qualifying rows, so limited plans always recompute.
    pub fn supports_incremental(&self) -> bool {
        self.window.limit.is_none()
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by_keys.is_empty()
    }
}

// ============================================================================
// Multi-column requests
// ============================================================================

/// Several aggregate columns computed in one pass over the same rows.
///
/// Columns keep their declaration order in the output. Each column carries
/// its own grouping, bounds and filter:
///
/// ```json
/// {
///   "columns": {
///     "total_cost": { "expr": "cost", "agg_func": "SUM", "group_by_keys": ["name"] },
///     "avg_cost": { "expr": "cost", "agg_func": "AVG", "limit": 2 }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OverWindowRequest {
    pub columns: IndexMap<String, AggregationRequest>,
}

impl OverWindowRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column; a column of the same name is replaced in place.
    pub fn column(mut self, name: impl Into<String>, request: AggregationRequest) -> Self {
        self.columns.insert(name.into(), request);
        self
    }

    pub fn validate(&self) -> ConfigResult<OverWindowPlan> {
        if self.columns.is_empty() {
            return Err(ConfigError::MissingField("columns"));
        }
        let mut columns = Vec::with_capacity(self.columns.len());
        for (name, request) in &self.columns {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "columns",
                    "column names must not be empty",
                ));
            }
            let plan = request.validate().map_err(|e| ConfigError::Column {
                column: name.clone(),
                source: Box::new(e),
            })?;
            columns.push(ColumnPlan {
                name: Arc::from(name.as_str()),
                plan,
            });
        }
        Ok(OverWindowPlan { columns })
    }
}

/// One validated output column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPlan {
    pub name: Arc<str>,
    pub plan: AggregationPlan,
}

/// Validated columns of one run, never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct OverWindowPlan {
    columns: Vec<ColumnPlan>,
}

impl OverWindowPlan {
    /// A run producing a single column.
    pub fn single(name: impl Into<Arc<str>>, plan: AggregationPlan) -> Self {
        Self {
            columns: vec![ColumnPlan {
                name: name.into(),
                plan,
            }],
        }
    }

    pub fn columns(&self) -> &[ColumnPlan] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn plans(&self) -> impl Iterator<Item = &AggregationPlan> {
        self.columns.iter().map(|c| &c.plan)
    }
}
