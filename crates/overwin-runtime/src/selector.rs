//! Candidate window selection.
//!
//! For a row `R` in a partition, the candidate window is the set of entries
//! that:
//!
//! 1. are ordered at or before `R` by `(timestamp, sequence_id)`
//! 2. under [`Visibility::Arrival`], arrived no later than `R`
//!    (`sequence_id <= R.sequence_id`)
//! 3. fall in `[R.timestamp - window_size, R.timestamp]` when a window is set
//! 4. pass the filter when one is configured
//! 5. are among the `limit` most recent survivors when a limit is set
//!
//! The time bound and the limit compose by intersection. Filtered-out rows
//! never count toward the limit.

use crate::config::Visibility;
use crate::event::{Event, SharedEvent};
use crate::partition::Partition;
use overwin_core::{Value, WindowSpec};

/// Admitted events for one row, oldest first.
#[derive(Debug, Clone)]
pub struct CandidateWindow<'a> {
    events: Vec<&'a SharedEvent>,
    current_admitted: bool,
}

impl<'a> CandidateWindow<'a> {
    pub fn events(&self) -> &[&'a SharedEvent] {
        &self.events
    }

    pub fn values(&self) -> impl Iterator<Item = &'a Value> + '_ {
        self.events.iter().copied().map(|e| &e.value)
    }

    /// Whether the row the window was selected for is part of it.
    pub fn current_admitted(&self) -> bool {
        self.current_admitted
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowSelector {
    window: WindowSpec,
    visibility: Visibility,
}

impl WindowSelector {
    pub fn new(window: WindowSpec, visibility: Visibility) -> Self {
        Self { window, visibility }
    }

    pub fn window(&self) -> &WindowSpec {
        &self.window
    }

    /// Select the candidate window for `event`, which must already be in
    /// `partition`.
    pub fn select<'a>(&self, event: &Event, partition: &'a Partition) -> CandidateWindow<'a> {
        let entries = partition.entries();
        let position = event.position();
        let upper = entries.partition_point(|e| e.position() <= position);
        let lower = match self.window.lower_bound(event.timestamp) {
            Some(bound) => entries.partition_point(|e| e.timestamp < bound),
            None => 0,
        };

        let mut events = Vec::new();
        let mut current_admitted = false;
        if lower < upper {
            let limit = self.window.limit.map_or(usize::MAX, |n| n.get());
            for entry in entries.range(lower..upper).rev() {
                if self.visibility == Visibility::Arrival && entry.sequence_id > event.sequence_id {
                    continue;
                }
                if !self.window.admits(entry.passes_filter) {
                    continue;
                }
                if entry.sequence_id == event.sequence_id {
                    current_admitted = true;
                }
                events.push(entry);
                if events.len() >= limit {
                    break;
                }
            }
            events.reverse();
        }

        CandidateWindow {
            events,
            current_admitted,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
