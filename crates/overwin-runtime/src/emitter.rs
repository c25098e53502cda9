//! Result emission and output ordering

use crate::config::EmitConfig;
use crate::event::{Event, FxIndexMap, SharedEvent};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use overwin_core::Value;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One input row with its aggregate attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub fields: FxIndexMap<String, Value>,
}

impl OutputRow {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Attaches aggregate columns to the fields a host chose to keep.
#[derive(Debug, Clone)]
pub struct ResultEmitter {
    config: EmitConfig,
}

impl ResultEmitter {
    pub fn new(config: EmitConfig) -> Self {
        Self { config }
    }

    /// Kept fields come first, in source order or in the configured order;
    /// aggregate columns follow in the order given, each replacing a source
    /// field of the same name.
    pub fn emit<'a, I>(&self, event: &Event, columns: I) -> OutputRow
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut fields: FxIndexMap<String, Value> = match &self.config.keep_fields {
            None => event.fields.clone(),
            Some(keep) => {
                let mut kept = IndexMap::with_capacity_and_hasher(keep.len() + 1, FxBuildHasher);
                for name in keep {
                    if let Some(v) = event.fields.get(name) {
                        kept.insert(name.clone(), v.clone());
                    }
                }
                kept
            }
        };
        for (name, value) in columns {
            fields.shift_remove(name);
            fields.insert(name.to_string(), value);
        }

        OutputRow {
            sequence_id: event.sequence_id,
            timestamp: event.timestamp,
            fields,
        }
    }
}

/// A dispatched row waiting for its columns.
#[derive(Debug)]
struct PendingRow {
    event: SharedEvent,
    values: Vec<Option<Value>>,
    missing: usize,
}

/// Collects the columns of rows completed out of order (by different
/// partition workers, possibly one per column group) and releases whole rows
/// in arrival order.
#[derive(Debug)]
pub struct OrderedEmitter {
    emitter: ResultEmitter,
    columns: Vec<Arc<str>>,
    pending: BTreeMap<u64, PendingRow>,
}

impl OrderedEmitter {
    /// `columns` names the output columns in order.
    pub fn new(emitter: ResultEmitter, columns: &[Arc<str>]) -> Self {
        Self {
            emitter,
            columns: columns.to_vec(),
            pending: BTreeMap::new(),
        }
    }

    /// Reserve a slot for a dispatched row.
    pub fn expect(&mut self, event: SharedEvent) {
        let width = self.columns.len();
        self.pending.insert(
            event.sequence_id,
            PendingRow {
                event,
                values: vec![None; width],
                missing: width,
            },
        );
    }

    /// Record column values of a row and return every row that is now
    /// complete, in arrival order. Values for unknown rows are dropped.
    pub fn complete<I>(&mut self, sequence_id: u64, values: I) -> Vec<OutputRow>
    where
        I: IntoIterator<Item = (usize, Value)>,
    {
        if let Some(row) = self.pending.get_mut(&sequence_id) {
            for (column, value) in values {
                if let Some(slot) = row.values.get_mut(column) {
                    if slot.replace(value).is_none() {
                        row.missing -= 1;
                    }
                }
            }
        }

        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.get().missing > 0 {
                break;
            }
            let row = entry.remove();
            let columns = self
                .columns
                .iter()
                .map(|name| &**name)
                .zip(row.values.into_iter().map(Option::unwrap_or_default));
            ready.push(self.emitter.emit(&row.event, columns));
        }
        ready
    }

    /// Rows dispatched but not yet emitted.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{GroupKey, ResolvedRow};

    fn event(seq: u64) -> SharedEvent {
        let row = ResolvedRow::new(seq, DateTime::<Utc>::from_timestamp(0, 0).unwrap(), 1i64)
            .with_field("name", "Alex")
            .with_field("cost", 100i64)
            .with_field("time", "2022-01-01 08:01:00");
        Arc::new(Event::from_row(row, GroupKey::global()))
    }

    fn row(seq: u64) -> OutputRow {
        ResultEmitter::new(EmitConfig::default())
            .emit(&event(seq), [("value", Value::Int(seq as i64))])
    }

    fn keys(row: &OutputRow) -> Vec<&str> {
        row.fields.keys().map(String::as_str).collect()
    }

    fn columns(names: &[&str]) -> Vec<Arc<str>> {
        names.iter().map(|n| Arc::from(*n)).collect()
    }

    // ==========================================================================
    // ResultEmitter
    // ==========================================================================

    #[test]
    fn test_emit_keeps_all_fields_by_default() {
        let out = row(1);
        assert_eq!(keys(&out), vec!["name", "cost", "time", "value"]);
        assert_eq!(out.get("value"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_emit_keep_fields_in_configured_order() {
        let emitter = ResultEmitter::new(EmitConfig {
            output_field: "total_cost".into(),
            keep_fields: Some(vec!["time".into(), "name".into(), "missing".into()]),
        });
        let out = emitter.emit(&event(1), [("total_cost", Value::Null)]);
        assert_eq!(keys(&out), vec!["time", "name", "total_cost"]);
        assert_eq!(out.get("total_cost"), Some(&Value::Null));
    }

    #[test]
    fn test_emit_replaces_same_named_field() {
        let emitter = ResultEmitter::new(EmitConfig::default());
        let out = emitter.emit(&event(1), [("cost", Value::Int(900))]);
        assert_eq!(keys(&out), vec!["name", "time", "cost"]);
        assert_eq!(out.get("cost"), Some(&Value::Int(900)));
    }

    #[test]
    fn test_emit_several_columns_in_order() {
        let emitter = ResultEmitter::new(EmitConfig {
            keep_fields: Some(vec!["name".into()]),
            ..Default::default()
        });
        let out = emitter.emit(
            &event(1),
            [
                ("total_cost", Value::Int(300)),
                ("avg_cost", Value::Float(150.0)),
                ("max_cost", Value::Int(200)),
            ],
        );
        assert_eq!(keys(&out), vec!["name", "total_cost", "avg_cost", "max_cost"]);
        assert_eq!(out.get("avg_cost"), Some(&Value::Float(150.0)));
    }

    #[test]
    fn test_output_row_json() {
        let json = serde_json::to_value(row(3)).unwrap();
        assert_eq!(json["sequence_id"], 3);
        assert_eq!(json["fields"]["value"], 3);
        assert_eq!(json["fields"]["name"], "Alex");
    }

    // ==========================================================================
    // OrderedEmitter
    // ==========================================================================

    fn ordered(names: &[&str]) -> OrderedEmitter {
        OrderedEmitter::new(ResultEmitter::new(EmitConfig::default()), &columns(names))
    }

    fn sequences(rows: &[OutputRow]) -> Vec<u64> {
        rows.iter().map(|r| r.sequence_id).collect()
    }

    #[test]
    fn test_ordered_emitter_reorders() {
        let mut emitter = ordered(&["value"]);
        for seq in 1..=3 {
            emitter.expect(event(seq));
        }
        assert!(emitter.complete(2, [(0, Value::Int(2))]).is_empty());
        assert!(emitter.complete(3, [(0, Value::Int(3))]).is_empty());
        let ready = emitter.complete(1, [(0, Value::Int(1))]);
        assert_eq!(sequences(&ready), vec![1, 2, 3]);
        assert_eq!(ready[1].get("value"), Some(&Value::Int(2)));
        assert_eq!(emitter.in_flight(), 0);
    }

    #[test]
    fn test_ordered_emitter_passes_through_in_order() {
        let mut emitter = ordered(&["value"]);
        emitter.expect(event(1));
        emitter.expect(event(2));
        assert_eq!(emitter.complete(1, [(0, Value::Int(1))]).len(), 1);
        assert_eq!(emitter.in_flight(), 1);
        assert_eq!(emitter.complete(2, [(0, Value::Int(2))]).len(), 1);
    }

    #[test]
    fn test_ordered_emitter_waits_for_every_column() {
        let mut emitter = ordered(&["by_name", "overall", "by_name_max"]);
        emitter.expect(event(1));
        emitter.expect(event(2));

        // row 2 completes before row 1 has all of its columns
        assert!(emitter
            .complete(1, [(0, Value::Int(10)), (2, Value::Int(7))])
            .is_empty());
        assert!(emitter
            .complete(2, [(1, Value::Int(2)), (0, Value::Int(3)), (2, Value::Int(3))])
            .is_empty());
        let ready = emitter.complete(1, [(1, Value::Int(1))]);

        assert_eq!(sequences(&ready), vec![1, 2]);
        let keys = keys(&ready[0]);
        assert_eq!(&keys[keys.len() - 3..], ["by_name", "overall", "by_name_max"]);
        assert_eq!(ready[0].get("overall"), Some(&Value::Int(1)));
        assert_eq!(ready[1].get("by_name"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_ordered_emitter_ignores_unknown_rows() {
        let mut emitter = ordered(&["value"]);
        emitter.expect(event(5));
        assert!(emitter.complete(4, [(0, Value::Int(1))]).is_empty());
        assert!(emitter.complete(5, [(3, Value::Int(1))]).is_empty());
        assert_eq!(emitter.in_flight(), 1);
    }
}
