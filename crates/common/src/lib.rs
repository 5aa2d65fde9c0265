//! Shared types for the Warden certificate controller.
//!
//! This crate carries the vocabulary every other Warden crate speaks:
//!
//! - [`ids`]: object identity ([`ObjectKey`]), issuer references and pass IDs
//! - [`conditions`]: status conditions with stable transition times
//! - [`backoff`]: exponential retry schedules
//! - [`errors`]: the error classes that decide how a failure is surfaced

pub mod backoff;
pub mod conditions;
pub mod errors;
pub mod ids;

pub use backoff::Backoff;
pub use conditions::{
    find_condition, is_condition_true, remove_condition, set_condition, Condition, ConditionStatus,
};
pub use errors::{Classify, ErrorClass};
pub use ids::{IssuerRef, ObjectKey, PassId, DEFAULT_ISSUER_GROUP, DEFAULT_ISSUER_KIND};
