//! Catalogue of supported aggregation functions.
//!
//! | Function | Family | Output |
//! |----------|--------|--------|
//! | `SUM` | distributive | int if every input is int, else float |
//! | `COUNT` | distributive | int |
//! | `MIN` / `MAX` | distributive | widest input type |
//! | `AVG` | holistic | float |
//! | `FIRST_VALUE` / `LAST_VALUE` | positional | input value |
//! | `ROW_NUMBER` | positional | int |
//! | `VALUE_COUNTS` | collection | map of stringified value to count |
//!
//! Names are resolved once, when a request is validated. Rows never carry
//! function names.

use crate::error::ConfigError;
use crate::suggest::did_you_mean;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A supported aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggFunc {
    Sum,
    Avg,
    Max,
    Min,
    FirstValue,
    LastValue,
    RowNumber,
    ValueCounts,
    Count,
}

/// How a function folds its admitted sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFamily {
    /// Order-insensitive folds that combine partial results (SUM, MIN, MAX, COUNT).
    Distributive,
    /// Needs more than one running quantity (AVG).
    Holistic,
    /// Depends on where entries sit in the admitted sequence.
    Positional,
    /// Builds a collection rather than a scalar.
    Collection,
}

impl AggFunc {
    pub const ALL: [AggFunc; 9] = [
        AggFunc::Sum,
        AggFunc::Avg,
        AggFunc::Max,
        AggFunc::Min,
        AggFunc::FirstValue,
        AggFunc::LastValue,
        AggFunc::RowNumber,
        AggFunc::ValueCounts,
        AggFunc::Count,
    ];

    /// Canonical upper-case name.
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Max => "MAX",
            AggFunc::Min => "MIN",
            AggFunc::FirstValue => "FIRST_VALUE",
            AggFunc::LastValue => "LAST_VALUE",
            AggFunc::RowNumber => "ROW_NUMBER",
            AggFunc::ValueCounts => "VALUE_COUNTS",
            AggFunc::Count => "COUNT",
        }
    }

    pub fn family(&self) -> AggFamily {
        match self {
            AggFunc::Sum | AggFunc::Max | AggFunc::Min | AggFunc::Count => AggFamily::Distributive,
            AggFunc::Avg => AggFamily::Holistic,
            AggFunc::FirstValue | AggFunc::LastValue | AggFunc::RowNumber => AggFamily::Positional,
            AggFunc::ValueCounts => AggFamily::Collection,
        }
    }

    /// Whether admitted values must be numeric.
    pub fn requires_numeric(&self) -> bool {
        matches!(
            self,
            AggFunc::Sum | AggFunc::Avg | AggFunc::Max | AggFunc::Min
        )
    }

    fn names() -> [&'static str; 9] {
        Self::ALL.map(|f| f.name())
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggFunc {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        AggFunc::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnsupportedAggFunc {
                name: s.to_string(),
                hint: did_you_mean(wanted, &AggFunc::names()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("SUM".parse::<AggFunc>().unwrap(), AggFunc::Sum);
        assert_eq!("sum".parse::<AggFunc>().unwrap(), AggFunc::Sum);
        assert_eq!(" value_counts ".parse::<AggFunc>().unwrap(), AggFunc::ValueCounts);
        assert_eq!("First_Value".parse::<AggFunc>().unwrap(), AggFunc::FirstValue);
    }

    #[test]
    fn test_parse_round_trips_every_name() {
        for func in AggFunc::ALL {
            assert_eq!(func.name().parse::<AggFunc>().unwrap(), func);
        }
    }

    #[test]
    fn test_unsupported_name_is_rejected() {
        let err = "unsupported_agg".parse::<AggFunc>().unwrap_err();
        match err {
            ConfigError::UnsupportedAggFunc { name, hint } => {
                assert_eq!(name, "unsupported_agg");
                assert!(hint.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_name_suggests_close_match() {
        let err = "AVERAGE".parse::<AggFunc>().unwrap_err();
        assert!(err.to_string().contains("AVERAGE"));

        let err = "LAST_VALU".parse::<AggFunc>().unwrap_err();
        assert!(err.to_string().contains("did you mean 'LAST_VALUE'?"));
    }

    #[test]
    fn test_families() {
        assert_eq!(AggFunc::Sum.family(), AggFamily::Distributive);
        assert_eq!(AggFunc::Avg.family(), AggFamily::Holistic);
        assert_eq!(AggFunc::RowNumber.family(), AggFamily::Positional);
        assert_eq!(AggFunc::ValueCounts.family(), AggFamily::Collection);
    }

    #[test]
    fn test_requires_numeric() {
        assert!(AggFunc::Sum.requires_numeric());
        assert!(AggFunc::Min.requires_numeric());
        assert!(!AggFunc::Count.requires_numeric());
        assert!(!AggFunc::FirstValue.requires_numeric());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&AggFunc::FirstValue).unwrap();
        assert_eq!(json, "\"FIRST_VALUE\"");
    }
}
