//! Error classes.
//!
//! Every Warden error type maps onto one of four classes, and the class
//! alone decides what a controller does with it:
//!
//! | class           | surfaced as                           | retried |
//! |-----------------|---------------------------------------|---------|
//! | `Transient`     | Warning event, condition stays Pending | yes, with backoff |
//! | `Configuration` | `Failed` condition                    | no      |
//! | `Terminal`      | `Failed` condition, upstream detail verbatim | no |
//! | `BestEffort`    | log line only                         | no      |

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network failures, 5xx, rate limits, store conflicts
    Transient,
    /// Unresolvable issuer, unsupported key algorithm, malformed CSR
    Configuration,
    /// The upstream authority said no (invalid order, CA denial)
    Terminal,
    /// Cleanup failures
    BestEffort,
}

impl ErrorClass {
    /// Whether a pass failing with this class should be retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    /// Whether this class ends the object's lifecycle with `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorClass::Configuration | ErrorClass::Terminal)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Terminal => "terminal",
            ErrorClass::BestEffort => "best-effort",
        };
        f.write_str(name)
    }
}

/// Errors that know their class and a stable reason code for events.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Stable, CamelCase reason recorded on Warning events.
    fn reason(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Configuration.is_retryable());
        assert!(!ErrorClass::Terminal.is_retryable());
        assert!(!ErrorClass::BestEffort.is_retryable());
    }

    #[test]
    fn test_terminal_classes() {
        assert!(ErrorClass::Configuration.is_terminal());
        assert!(ErrorClass::Terminal.is_terminal());
        assert!(!ErrorClass::Transient.is_terminal());
        assert!(!ErrorClass::BestEffort.is_terminal());
        assert_eq!(ErrorClass::BestEffort.to_string(), "best-effort");
    }
}
