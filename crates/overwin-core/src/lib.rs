//! # Overwin Core
//!
//! Foundational types for the overwin window aggregation engine.
//!
//! This crate holds everything that can be decided before a single row is
//! seen:
//!
//! - **Values**: the typed scalars rows carry and aggregations produce
//! - **Aggregation catalogue**: the supported functions and their families
//! - **Requests**: the declarative configuration surface and its validation,
//!   one aggregate column at a time or several at once
//! - **Errors**: construction-time and fold-time error types
//!
//! ## Quick Start
//!
//! ```rust
//! use overwin_core::{AggFunc, AggregationRequest};
//! use chrono::Duration;
//!
//! let plan = AggregationRequest::new("cost", "sum")
//!     .group_by(["name"])
//!     .window_size(Duration::days(2))
//!     .limit(2)
//!     .validate()
//!     .expect("valid request");
//!
//! assert_eq!(plan.func, AggFunc::Sum);
//! assert!(!plan.supports_incremental());
//! ```
//!
//! ## See Also
//!
//! - [`overwin_runtime`](../overwin_runtime): partitioning, window selection and execution

pub mod agg;
pub mod error;
pub mod request;
pub mod suggest;
pub mod value;

pub use agg::{AggFamily, AggFunc};
pub use error::{AggError, ConfigError, ConfigResult};
pub use request::{
    AggregationPlan, AggregationRequest, ColumnPlan, OverWindowPlan, OverWindowRequest, WindowSpec,
};
pub use value::{NumericKind, Value};
