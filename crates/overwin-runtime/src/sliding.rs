//! Incremental sliding state for plans without a row-count limit.
//!
//! Keeps the admitted events of the latest row in a deque together with an
//! [`Aggregator`] over their values. Advancing to the next in-order row
//! retracts events that fell behind the new lower time bound and admits the
//! new row if it passes the filter, so each row costs O(1) amortized plus the
//! expiring rows.

use crate::aggregation::Aggregator;
use crate::event::SharedEvent;
use crate::selector::CandidateWindow;
use overwin_core::{AggError, AggFunc, Value, WindowSpec};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SlidingState {
    window: WindowSpec,
    admitted: VecDeque<SharedEvent>,
    aggregator: Aggregator,
}

impl SlidingState {
    /// Seed from the candidate window of the row that starts the sliding run.
    pub fn seed(
        func: AggFunc,
        field: &Arc<str>,
        window: WindowSpec,
        candidates: &CandidateWindow<'_>,
    ) -> Result<Self, AggError> {
        let mut state = Self {
            window,
            admitted: candidates.events().iter().map(|&e| Arc::clone(e)).collect(),
            aggregator: Aggregator::new(func, Arc::clone(field)),
        };
        state.rebuild()?;
        Ok(state)
    }

    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }

    /// Advance to `event`, which must be ordered after every event seen so
    /// far, and return its aggregate.
    pub fn advance(&mut self, event: &SharedEvent) -> Result<Value, AggError> {
        if let Some(bound) = self.window.lower_bound(event.timestamp) {
            while self
                .admitted
                .front()
                .is_some_and(|front| front.timestamp < bound)
            {
                if let Some(expired) = self.admitted.pop_front() {
                    let next = self.admitted.front().map(|e| &e.value);
                    self.aggregator.retract(&expired.value, next);
                }
            }
        }

        let current_admitted = self.window.admits(event.passes_filter);
        if current_admitted {
            self.aggregator.admit(&event.value)?;
            self.admitted.push_back(Arc::clone(event));
        }

        if self.aggregator.is_stale() {
            self.rebuild()?;
        }
        self.aggregator.result(current_admitted)
    }

    /// Aggregate over the current admitted set without advancing.
    pub fn result(&self, current_admitted: bool) -> Result<Value, AggError> {
        self.aggregator.result(current_admitted)
    }

    fn rebuild(&mut self) -> Result<(), AggError> {
        debug!(
            "Rebuilding {} accumulator over {} rows",
            self.aggregator.func(),
            self.admitted.len()
        );
        self.aggregator.reset();
        for event in &self.admitted {
            self.aggregator.admit(&event.value)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Visibility;
    use crate::event::{Event, GroupKey, ResolvedRow};
    use crate::partition::Partition;
    use crate::selector::WindowSelector;
    use chrono::{DateTime, Duration, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    fn event(seq: u64, secs: i64, value: impl Into<Value>) -> SharedEvent {
        let row = ResolvedRow::new(seq, ts(secs), value);
        Arc::new(Event::from_row(row, GroupKey::global()))
    }

    fn window(secs: i64) -> WindowSpec {
        WindowSpec {
            window_size: Some(Duration::seconds(secs)),
            ..Default::default()
        }
    }

    fn seeded(func: AggFunc, spec: WindowSpec, first: &SharedEvent) -> SlidingState {
        let mut partition = Partition::new(GroupKey::global());
        partition.insert(Arc::clone(first));
        let selector = WindowSelector::new(spec, Visibility::Arrival);
        let candidates = selector.select(first, &partition);
        SlidingState::seed(func, &Arc::from("cost"), spec, &candidates).unwrap()
    }

    #[test]
    fn test_sliding_sum_with_expiry() {
        let first = event(1, 0, 10i64);
        let mut state = seeded(AggFunc::Sum, window(2), &first);
        assert_eq!(state.result(true).unwrap(), Value::Int(10));

        assert_eq!(state.advance(&event(2, 1, 20i64)).unwrap(), Value::Int(30));
        assert_eq!(state.advance(&event(3, 2, 30i64)).unwrap(), Value::Int(60));
        // t=0 falls out of [1, 3]
        assert_eq!(state.advance(&event(4, 3, 40i64)).unwrap(), Value::Int(90));
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_sliding_min_after_expiry() {
        let first = event(1, 0, 10.0);
        let mut state = seeded(AggFunc::Min, window(2), &first);
        state.advance(&event(2, 1, 20.0)).unwrap();
        state.advance(&event(3, 2, 30.0)).unwrap();
        assert_eq!(
            state.advance(&event(4, 3, 40.0)).unwrap(),
            Value::Float(20.0)
        );
    }

    #[test]
    fn test_sliding_first_value_follows_evictions() {
        let first = event(1, 0, "a");
        let mut state = seeded(AggFunc::FirstValue, window(2), &first);
        assert_eq!(state.advance(&event(2, 1, "b")).unwrap(), Value::from("a"));
        assert_eq!(state.advance(&event(3, 2, "c")).unwrap(), Value::from("a"));
        // t=0 leaves [1, 3]
        assert_eq!(state.advance(&event(4, 3, "d")).unwrap(), Value::from("b"));
        // every admitted row leaves [4, 6]
        assert_eq!(state.advance(&event(5, 6, "e")).unwrap(), Value::from("e"));
        assert_eq!(state.len(), 1);
        assert_eq!(state.advance(&event(6, 7, "f")).unwrap(), Value::from("e"));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_float_retraction_matches_recompute() {
        let values = [0.1, 0.2, 0.3, 0.7, 1e16, 1.0, 3.3];
        let first = event(1, 0, values[0]);
        let mut state = seeded(AggFunc::Sum, window(2), &first);

        let mut history = vec![(0i64, values[0])];
        for (i, v) in values.iter().enumerate().skip(1) {
            let secs = i as i64;
            let got = state.advance(&event(i as u64 + 1, secs, *v)).unwrap();
            history.push((secs, *v));

            let expected: f64 = history
                .iter()
                .filter(|(t, _)| *t >= secs - 2)
                .fold(0.0, |acc, (_, x)| acc + x);
            assert_eq!(got, Value::Float(expected), "row {}", i);
        }
    }

    #[test]
    fn test_filtered_row_keeps_prior_aggregate() {
        let spec = WindowSpec {
            filtered: true,
            ..window(60)
        };
        let first = event(1, 0, 5i64);
        let mut state = seeded(AggFunc::Sum, spec, &first);

        let rejected = Arc::new(Event::from_row(
            ResolvedRow::new(2, ts(1), 100i64).with_filter(false),
            GroupKey::global(),
        ));
        assert_eq!(state.advance(&rejected).unwrap(), Value::Int(5));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_everything_expired_is_null() {
        let first = event(1, 0, 5i64);
        let spec = WindowSpec {
            filtered: true,
            ..window(1)
        };
        let mut state = seeded(AggFunc::Sum, spec, &first);
        let rejected = Arc::new(Event::from_row(
            ResolvedRow::new(2, ts(10), 1i64).with_filter(false),
            GroupKey::global(),
        ));
        assert_eq!(state.advance(&rejected).unwrap(), Value::Null);
        assert!(state.is_empty());
    }
}
