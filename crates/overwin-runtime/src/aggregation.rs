//! Aggregator library.
//!
//! One [`Aggregator`] folds the values of an admitted sequence, oldest first,
//! into a single [`Value`]. The same accumulator serves both execution paths:
//!
//! - full recompute builds a fresh aggregator per row and admits the whole
//!   candidate window ([`Aggregator::fold`])
//! - the sliding path keeps one aggregator per partition, admitting the newest
//!   row and retracting rows that leave the time bound
//!
//! # Functions
//!
//! | Function | Result | Retraction |
//! |----------|--------|------------|
//! | `SUM` | `Int` when every input is an integer, otherwise `Float` | exact for integers, rebuild for floats |
//! | `AVG` | `Float` | exact for integers, rebuild for floats |
//! | `MIN` / `MAX` | widest numeric type present | exact (count multiset) |
//! | `COUNT` | number of non-null values | exact |
//! | `FIRST_VALUE` / `LAST_VALUE` | value of the oldest / newest admitted row | exact |
//! | `ROW_NUMBER` | rank of the current row, null when it is not admitted | exact |
//! | `VALUE_COUNTS` | `Map` of stringified value to count, keys sorted | exact |
//!
//! Floating-point sums are order sensitive, so retracting a float cannot be
//! undone by subtraction. Such a retraction marks the aggregator stale and the
//! owner rebuilds it from the admitted rows; results stay bit-identical to a
//! full recompute.
//!
//! An empty admitted sequence yields `Null` for every function.

use overwin_core::{AggError, AggFunc, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Accumulated state of one aggregation over an admitted sequence.
#[derive(Debug, Clone)]
pub struct Aggregator {
    func: AggFunc,
    field: Arc<str>,
    state: AccumulatorState,
    /// Admitted rows, nulls included
    admitted: usize,
    stale: bool,
}

#[derive(Debug, Clone)]
enum AccumulatorState {
    Numeric(NumericFold),
    Extremum(ExtremumFold),
    Count { non_null: usize },
    /// Oldest admitted value; the owner supplies its successor on retraction
    First(Value),
    Last(Value),
    Rows,
    Histogram(BTreeMap<String, usize>),
}

impl AccumulatorState {
    fn for_func(func: AggFunc) -> Self {
        match func {
            AggFunc::Sum | AggFunc::Avg => AccumulatorState::Numeric(NumericFold::default()),
            AggFunc::Min | AggFunc::Max => AccumulatorState::Extremum(ExtremumFold::default()),
            AggFunc::Count => AccumulatorState::Count { non_null: 0 },
            AggFunc::FirstValue => AccumulatorState::First(Value::Null),
            AggFunc::LastValue => AccumulatorState::Last(Value::Null),
            AggFunc::RowNumber => AccumulatorState::Rows,
            AggFunc::ValueCounts => AccumulatorState::Histogram(BTreeMap::new()),
        }
    }
}

impl Aggregator {
    /// `field` names the aggregated expression in error messages.
    pub fn new(func: AggFunc, field: impl Into<Arc<str>>) -> Self {
        Self {
            func,
            field: field.into(),
            state: AccumulatorState::for_func(func),
            admitted: 0,
            stale: false,
        }
    }

    /// Fold an admitted sequence from scratch.
    pub fn fold<'a, I>(
        func: AggFunc,
        field: &Arc<str>,
        values: I,
        current_admitted: bool,
    ) -> Result<Value, AggError>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut aggregator = Aggregator::new(func, Arc::clone(field));
        for value in values {
            aggregator.admit(value)?;
        }
        aggregator.result(current_admitted)
    }

    pub fn func(&self) -> AggFunc {
        self.func
    }

    pub fn admitted(&self) -> usize {
        self.admitted
    }

    /// Whether a retraction could not be applied exactly and the aggregator
    /// must be rebuilt from the admitted rows before its result is read.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn reset(&mut self) {
        self.state = AccumulatorState::for_func(self.func);
        self.admitted = 0;
        self.stale = false;
    }

    /// Add the value of the newest admitted row.
    pub fn admit(&mut self, value: &Value) -> Result<(), AggError> {
        let numeric = if self.func.requires_numeric() {
            self.check_numeric(value)?
        } else {
            None
        };
        match &mut self.state {
            AccumulatorState::Numeric(fold) => {
                if let Some(n) = numeric {
                    if fold.admit(n) {
                        self.stale = true;
                    }
                }
            }
            AccumulatorState::Extremum(fold) => {
                if let Some(n) = numeric {
                    fold.admit(n);
                }
            }
            AccumulatorState::Count { non_null } => {
                if !value.is_null() {
                    *non_null += 1;
                }
            }
            AccumulatorState::First(first) => {
                if self.admitted == 0 {
                    *first = value.clone();
                }
            }
            AccumulatorState::Last(last) => *last = value.clone(),
            AccumulatorState::Rows => {}
            AccumulatorState::Histogram(counts) => {
                if !value.is_null() {
                    *counts.entry(value.histogram_key()).or_insert(0) += 1;
                }
            }
        }
        self.admitted += 1;
        Ok(())
    }

    /// Remove the value of the oldest admitted row. `next_oldest` is the
    /// value of the row that becomes the oldest one, if any remains.
    ///
    /// Values were type-checked on admission, so retraction cannot fail.
    pub fn retract(&mut self, value: &Value, next_oldest: Option<&Value>) {
        if self.admitted == 0 {
            return;
        }
        self.admitted -= 1;
        match &mut self.state {
            AccumulatorState::Numeric(fold) => {
                if let Some(n) = Numeric::from_value(value) {
                    if !fold.retract(n) {
                        self.stale = true;
                    }
                }
            }
            AccumulatorState::Extremum(fold) => {
                if let Some(n) = Numeric::from_value(value) {
                    fold.retract(n);
                }
            }
            AccumulatorState::Count { non_null } => {
                if !value.is_null() {
                    *non_null = non_null.saturating_sub(1);
                }
            }
            AccumulatorState::First(first) => {
                *first = match next_oldest {
                    Some(next) if self.admitted > 0 => next.clone(),
                    _ => Value::Null,
                };
            }
            AccumulatorState::Last(last) => {
                if self.admitted == 0 {
                    *last = Value::Null;
                }
            }
            AccumulatorState::Rows => {}
            AccumulatorState::Histogram(counts) => {
                if !value.is_null() {
                    let key = value.histogram_key();
                    if let Some(count) = counts.get_mut(&key) {
                        *count -= 1;
                        if *count == 0 {
                            counts.remove(&key);
                        }
                    }
                }
            }
        }
    }

    /// Result for the current row. `current_admitted` says whether the row
    /// the result is attached to is itself part of the admitted sequence.
    pub fn result(&self, current_admitted: bool) -> Result<Value, AggError> {
        if self.admitted == 0 {
            return Ok(Value::Null);
        }
        let value = match &self.state {
            AccumulatorState::Numeric(fold) => match self.func {
                AggFunc::Avg => fold.mean(),
                _ => fold.sum().ok_or_else(|| self.overflow())?,
            },
            AccumulatorState::Extremum(fold) => match self.func {
                AggFunc::Min => fold.min(),
                _ => fold.max(),
            },
            AccumulatorState::Count { non_null } => Value::Int(*non_null as i64),
            AccumulatorState::First(first) => first.clone(),
            AccumulatorState::Last(last) => last.clone(),
            AccumulatorState::Rows => {
                if current_admitted {
                    Value::Int(self.admitted as i64)
                } else {
                    Value::Null
                }
            }
            AccumulatorState::Histogram(counts) => Value::Map(
                counts
                    .iter()
                    .map(|(k, n)| (k.clone(), Value::Int(*n as i64)))
                    .collect(),
            ),
        };
        Ok(value)
    }

    fn check_numeric(&self, value: &Value) -> Result<Option<Numeric>, AggError> {
        if value.is_null() {
            return Ok(None);
        }
        Numeric::from_value(value)
            .map(Some)
            .ok_or_else(|| AggError::TypeMismatch {
                func: self.func,
                field: self.field.to_string(),
                found: value.type_name(),
            })
    }

    fn overflow(&self) -> AggError {
        AggError::Overflow {
            func: self.func,
            field: self.field.to_string(),
        }
    }
}

// ============================================================================
// Numeric folds
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(n) => Some(Numeric::Int(*n)),
            Value::Float(f) => Some(Numeric::Float(*f)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(n) => n as f64,
            Numeric::Float(f) => f,
        }
    }
}

/// Running sum for SUM and AVG.
///
/// Integers are summed exactly in `i128`. The float sum is the left-to-right
/// sum of every value widened to `f64` and is only read once a float has been
/// admitted.
#[derive(Debug, Clone, Default)]
struct NumericFold {
    int_sum: i128,
    float_sum: f64,
    count: usize,
    floats: usize,
    /// `float_sum` no longer matches a left-to-right sum of the admitted values
    float_sum_dirty: bool,
}

impl NumericFold {
    /// Returns true when the fold can no longer produce an exact result.
    fn admit(&mut self, n: Numeric) -> bool {
        match n {
            Numeric::Int(v) => self.int_sum += v as i128,
            Numeric::Float(_) => self.floats += 1,
        }
        self.float_sum += n.as_f64();
        self.count += 1;
        self.floats > 0 && self.float_sum_dirty
    }

    /// Returns false when the retraction could not be applied exactly.
    fn retract(&mut self, n: Numeric) -> bool {
        self.count = self.count.saturating_sub(1);
        match n {
            Numeric::Int(v) if self.floats == 0 => {
                self.int_sum -= v as i128;
                self.float_sum_dirty = true;
                true
            }
            _ => false,
        }
    }

    /// `None` when an integer sum does not fit in `i64`.
    fn sum(&self) -> Option<Value> {
        if self.count == 0 {
            return Some(Value::Null);
        }
        if self.floats > 0 {
            return Some(Value::Float(self.float_sum));
        }
        i64::try_from(self.int_sum).ok().map(Value::Int)
    }

    fn mean(&self) -> Value {
        if self.count == 0 {
            return Value::Null;
        }
        let total = if self.floats > 0 {
            self.float_sum
        } else {
            self.int_sum as f64
        };
        Value::Float(total / self.count as f64)
    }
}

/// Float key ordered by `total_cmp` so it can live in a `BTreeMap`.
#[derive(Debug, Clone, Copy)]
struct OrderedF64(f64);

impl PartialEq for OrderedF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Count multisets for MIN and MAX; O(log n) admit, retract and lookup.
#[derive(Debug, Clone, Default)]
struct ExtremumFold {
    ints: BTreeMap<i64, usize>,
    floats: BTreeMap<OrderedF64, usize>,
}

impl ExtremumFold {
    fn admit(&mut self, n: Numeric) {
        match n {
            Numeric::Int(v) => *self.ints.entry(v).or_insert(0) += 1,
            Numeric::Float(v) => *self.floats.entry(OrderedF64(v)).or_insert(0) += 1,
        }
    }

    fn retract(&mut self, n: Numeric) {
        match n {
            Numeric::Int(v) => remove_one(&mut self.ints, v),
            Numeric::Float(v) => remove_one(&mut self.floats, OrderedF64(v)),
        }
    }

    fn min(&self) -> Value {
        let int = self.ints.first_key_value().map(|(k, _)| *k);
        let float = self.floats.first_key_value().map(|(k, _)| k.0);
        Self::pick(int, float, Ordering::Less)
    }

    fn max(&self) -> Value {
        let int = self.ints.last_key_value().map(|(k, _)| *k);
        let float = self.floats.last_key_value().map(|(k, _)| k.0);
        Self::pick(int, float, Ordering::Greater)
    }

    /// Widen to float as soon as one float is present; ties keep the float.
    fn pick(int: Option<i64>, float: Option<f64>, wanted: Ordering) -> Value {
        match (int, float) {
            (None, None) => Value::Null,
            (Some(i), None) => Value::Int(i),
            (None, Some(f)) => Value::Float(f),
            (Some(i), Some(f)) => {
                let widened = i as f64;
                if widened.total_cmp(&f) == wanted {
                    Value::Float(widened)
                } else {
                    Value::Float(f)
                }
            }
        }
    }
}

fn remove_one<K: Ord>(set: &mut BTreeMap<K, usize>, key: K) {
    if let std::collections::btree_map::Entry::Occupied(mut entry) = set.entry(key) {
        let count = entry.get_mut();
        if *count > 1 {
            *count -= 1;
        } else {
            entry.remove();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> Arc<str> {
        Arc::from("cost")
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    fn fold(func: AggFunc, values: &[Value]) -> Value {
        Aggregator::fold(func, &field(), values, true).unwrap()
    }

    // ==========================================================================
    // Folds
    // ==========================================================================

    #[test]
    fn test_sum_preserves_integer_type() {
        assert_eq!(fold(AggFunc::Sum, &ints(&[100, 300, 200])), Value::Int(600));
    }

    #[test]
    fn test_sum_widens_to_float() {
        let values = vec![Value::Int(1), Value::Float(0.5), Value::Int(2)];
        assert_eq!(fold(AggFunc::Sum, &values), Value::Float(3.5));
    }

    #[test]
    fn test_avg_is_float() {
        assert_eq!(fold(AggFunc::Avg, &ints(&[200, 300])), Value::Float(250.0));
    }

    #[test]
    fn test_min_max() {
        let values = ints(&[300, 100, 200]);
        assert_eq!(fold(AggFunc::Min, &values), Value::Int(100));
        assert_eq!(fold(AggFunc::Max, &values), Value::Int(300));

        let mixed = vec![Value::Int(3), Value::Float(2.5)];
        assert_eq!(fold(AggFunc::Min, &mixed), Value::Float(2.5));
        assert_eq!(fold(AggFunc::Max, &mixed), Value::Float(3.0));
    }

    #[test]
    fn test_nulls_skipped() {
        let values = vec![Value::Int(5), Value::Null, Value::Int(7)];
        assert_eq!(fold(AggFunc::Sum, &values), Value::Int(12));
        assert_eq!(fold(AggFunc::Avg, &values), Value::Float(6.0));
        assert_eq!(fold(AggFunc::Count, &values), Value::Int(2));
        assert_eq!(fold(AggFunc::RowNumber, &values), Value::Int(3));
    }

    #[test]
    fn test_all_null_numeric_is_null() {
        let values = vec![Value::Null, Value::Null];
        assert_eq!(fold(AggFunc::Sum, &values), Value::Null);
        assert_eq!(fold(AggFunc::Max, &values), Value::Null);
        assert_eq!(fold(AggFunc::Count, &values), Value::Int(0));
    }

    #[test]
    fn test_empty_is_null_for_every_function() {
        for func in AggFunc::ALL {
            assert_eq!(fold(func, &[]), Value::Null, "{}", func);
        }
    }

    #[test]
    fn test_first_and_last_value() {
        let values = vec![Value::from("a"), Value::from("b"), Value::from("c")];
        assert_eq!(fold(AggFunc::FirstValue, &values), Value::from("a"));
        assert_eq!(fold(AggFunc::LastValue, &values), Value::from("c"));
    }

    #[test]
    fn test_row_number_requires_current_row() {
        let values = ints(&[1, 2]);
        let ranked = Aggregator::fold(AggFunc::RowNumber, &field(), &values, true).unwrap();
        assert_eq!(ranked, Value::Int(2));
        let excluded = Aggregator::fold(AggFunc::RowNumber, &field(), &values, false).unwrap();
        assert_eq!(excluded, Value::Null);
    }

    #[test]
    fn test_value_counts_sorted_histogram() {
        let values = ints(&[600, 100, 100]);
        let result = fold(AggFunc::ValueCounts, &values);
        let map = result.as_map().unwrap();
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["100", "600"]);
        assert_eq!(map.get("100"), Some(&Value::Int(2)));
        assert_eq!(map.get("600"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_type_mismatch() {
        let values = vec![Value::Int(1), Value::from("oops")];
        let err = Aggregator::fold(AggFunc::Sum, &field(), &values, true).unwrap_err();
        assert_eq!(
            err,
            AggError::TypeMismatch {
                func: AggFunc::Sum,
                field: "cost".to_string(),
                found: "str",
            }
        );
        assert!(err.to_string().contains("SUM(cost)"));
    }

    #[test]
    fn test_non_numeric_allowed_for_positional() {
        let values = vec![Value::from("x"), Value::Bool(true)];
        assert_eq!(fold(AggFunc::LastValue, &values), Value::Bool(true));
        assert_eq!(fold(AggFunc::Count, &values), Value::Int(2));
    }

    #[test]
    fn test_sum_overflow() {
        let values = ints(&[i64::MAX, 1]);
        let err = Aggregator::fold(AggFunc::Sum, &field(), &values, true).unwrap_err();
        assert!(matches!(err, AggError::Overflow { func: AggFunc::Sum, .. }));
    }

    #[test]
    fn test_intermediate_overflow_recovers() {
        let values = ints(&[i64::MAX, 1, -5]);
        assert_eq!(fold(AggFunc::Sum, &values), Value::Int(i64::MAX - 4));
    }

    // ==========================================================================
    // Retraction
    // ==========================================================================

    #[test]
    fn test_integer_retraction_is_exact() {
        let mut agg = Aggregator::new(AggFunc::Sum, field());
        for v in ints(&[100, 300, 200]) {
            agg.admit(&v).unwrap();
        }
        agg.retract(&Value::Int(100), None);
        assert!(!agg.is_stale());
        assert_eq!(agg.result(true).unwrap(), Value::Int(500));
    }

    #[test]
    fn test_float_retraction_marks_stale() {
        let mut agg = Aggregator::new(AggFunc::Avg, field());
        agg.admit(&Value::Float(0.1)).unwrap();
        agg.admit(&Value::Float(0.2)).unwrap();
        agg.retract(&Value::Float(0.1), None);
        assert!(agg.is_stale());
        agg.reset();
        assert!(!agg.is_stale());
        assert_eq!(agg.admitted(), 0);
    }

    #[test]
    fn test_float_after_integer_retraction_marks_stale() {
        let mut agg = Aggregator::new(AggFunc::Sum, field());
        agg.admit(&Value::Int(1)).unwrap();
        agg.admit(&Value::Int(2)).unwrap();
        agg.retract(&Value::Int(1), None);
        assert!(!agg.is_stale());
        agg.admit(&Value::Float(0.5)).unwrap();
        assert!(agg.is_stale());
    }

    #[test]
    fn test_extremum_retraction() {
        let mut agg = Aggregator::new(AggFunc::Max, field());
        for v in ints(&[5, 9, 9, 2]) {
            agg.admit(&v).unwrap();
        }
        agg.retract(&Value::Int(5), None);
        agg.retract(&Value::Int(9), None);
        assert_eq!(agg.result(true).unwrap(), Value::Int(9));
        agg.retract(&Value::Int(9), None);
        assert_eq!(agg.result(true).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_positional_retraction() {
        let mut first = Aggregator::new(AggFunc::FirstValue, field());
        let mut last = Aggregator::new(AggFunc::LastValue, field());
        for v in ints(&[1, 2]) {
            first.admit(&v).unwrap();
            last.admit(&v).unwrap();
        }
        first.retract(&Value::Int(1), Some(&Value::Int(2)));
        last.retract(&Value::Int(1), Some(&Value::Int(2)));
        assert_eq!(first.result(true).unwrap(), Value::Int(2));
        assert_eq!(last.result(true).unwrap(), Value::Int(2));
        first.retract(&Value::Int(2), None);
        last.retract(&Value::Int(2), None);
        assert_eq!(first.result(false).unwrap(), Value::Null);
        assert_eq!(last.result(false).unwrap(), Value::Null);
    }

    #[test]
    fn test_first_value_keeps_only_the_front() {
        let mut first = Aggregator::new(AggFunc::FirstValue, field());
        for v in ints(&[7, 8, 9]) {
            first.admit(&v).unwrap();
        }
        assert_eq!(first.result(true).unwrap(), Value::Int(7));
        first.retract(&Value::Int(7), Some(&Value::Int(8)));
        assert_eq!(first.result(true).unwrap(), Value::Int(8));

        // admitting behind a non-empty front leaves it alone
        first.admit(&Value::Int(10)).unwrap();
        assert_eq!(first.result(true).unwrap(), Value::Int(8));
        assert_eq!(first.admitted(), 3);
    }

    #[test]
    fn test_histogram_retraction_drops_empty_keys() {
        let mut agg = Aggregator::new(AggFunc::ValueCounts, field());
        for v in ints(&[100, 400]) {
            agg.admit(&v).unwrap();
        }
        agg.retract(&Value::Int(100), None);
        let result = agg.result(true).unwrap();
        let map = result.as_map().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("400"), Some(&Value::Int(1)));
    }
}
