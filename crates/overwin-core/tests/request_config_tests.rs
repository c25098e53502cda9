//! Requests loaded from JSON configuration and validated into plans.

use chrono::Duration;
use overwin_core::{AggFamily, AggFunc, AggregationRequest, ConfigError};

fn load(json: &str) -> AggregationRequest {
    serde_json::from_str(json).expect("request JSON should parse")
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn test_full_request_from_json() {
    let request = load(
        r#"{
            "expr": "cost",
            "agg_func": "sum",
            "group_by_keys": ["name"],
            "window_size_ms": 172800000,
            "filter_expr": "action = 'pay'",
            "limit": 2
        }"#,
    );
    let plan = request.validate().unwrap();
    assert_eq!(plan.func, AggFunc::Sum);
    assert_eq!(&*plan.expr, "cost");
    assert_eq!(&plan.group_by_keys[..], ["name".to_string()]);
    assert_eq!(plan.window.window_size, Some(Duration::days(2)));
    assert_eq!(plan.window.limit.map(|n| n.get()), Some(2));
    assert!(plan.window.filtered);
    assert!(!plan.supports_incremental());
}

#[test]
fn test_minimal_request_defaults() {
    let plan = load(r#"{"expr": "cost", "agg_func": "COUNT"}"#)
        .validate()
        .unwrap();
    assert!(!plan.is_grouped());
    assert_eq!(plan.window.window_size, None);
    assert_eq!(plan.window.limit, None);
    assert!(!plan.window.filtered);
    assert!(plan.supports_incremental());
}

#[test]
fn test_fractional_window_is_truncated_to_millis() {
    let request = load(r#"{"expr": "cost", "agg_func": "MAX", "window_size_ms": 1500.9}"#);
    assert_eq!(request.window_size_ms, Some(1500));
}

#[test]
fn test_blank_filter_means_no_filter() {
    let plan = load(r#"{"expr": "cost", "agg_func": "MIN", "filter_expr": "   "}"#)
        .validate()
        .unwrap();
    assert_eq!(plan.filter_expr, None);
    assert!(plan.window.admits(false));
}

// =============================================================================
// Rejection
// =============================================================================

#[test]
fn test_each_invalid_setting_is_reported() {
    let cases = [
        (r#"{"agg_func": "SUM"}"#, "Missing required field 'expr'"),
        (r#"{"expr": "cost"}"#, "Missing required field 'agg_func'"),
        (
            r#"{"expr": "cost", "agg_func": "SUM", "limit": 0}"#,
            "Invalid limit 0: limit must be a positive integer",
        ),
        (
            r#"{"expr": "cost", "agg_func": "SUM", "limit": -3}"#,
            "Invalid limit -3: limit must be a positive integer",
        ),
        (
            r#"{"expr": "cost", "agg_func": "SUM", "window_size_ms": 0}"#,
            "Invalid window size 0ms: window size must be at least 1ms",
        ),
        (
            r#"{"expr": "cost", "agg_func": "SUM", "group_by_keys": ["a", "a"]}"#,
            "Group-by key 'a' is listed more than once",
        ),
    ];
    for (json, message) in cases {
        let err = load(json).validate().unwrap_err();
        assert_eq!(err.to_string(), message, "for {}", json);
    }
}

#[test]
fn test_misspelled_function_gets_a_hint() {
    let err = load(r#"{"expr": "cost", "agg_func": "VALUE_COUNT"}"#)
        .validate()
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnsupportedAggFunc { .. }));
    assert_eq!(
        err.to_string(),
        "Unsupported aggregation function 'VALUE_COUNT'; did you mean 'VALUE_COUNTS'?"
    );
}

#[test]
fn test_unknown_function_without_close_match() {
    let err = AggregationRequest::new("cost", "percentile")
        .validate()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unsupported aggregation function 'percentile'"
    );
}

// =============================================================================
// Catalogue
// =============================================================================

#[test]
fn test_every_function_is_reachable_from_config() {
    for func in AggFunc::ALL {
        let json = format!(r#"{{"expr": "cost", "agg_func": "{}"}}"#, func.name().to_lowercase());
        let plan = load(&json).validate().unwrap();
        assert_eq!(plan.func, func);
    }
}

#[test]
fn test_numeric_functions() {
    let numeric: Vec<AggFunc> = AggFunc::ALL
        .into_iter()
        .filter(|f| f.requires_numeric())
        .collect();
    assert_eq!(
        numeric,
        vec![AggFunc::Sum, AggFunc::Avg, AggFunc::Max, AggFunc::Min]
    );
    assert_eq!(AggFunc::Avg.family(), AggFamily::Holistic);
    assert_eq!(AggFunc::ValueCounts.family(), AggFamily::Collection);
}
