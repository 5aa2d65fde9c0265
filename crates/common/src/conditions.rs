//! Status conditions.
//!
//! A condition is a typed observation (`Ready`, `Issuing`, ...) with a
//! tri-state status, a machine-readable reason and a human message. The
//! transition time only moves when the status or the reason changes, so
//! repeated passes that observe the same thing never produce a new status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<u64>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }
}

/// Set a condition on `conditions`.
///
/// Returns `true` when the list changed. An existing condition with the
/// same status and reason is left untouched, message included.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status && existing.reason == reason {
            return false;
        }
        *existing = Condition::new(type_, status, reason, message);
        return true;
    }

    conditions.push(Condition::new(type_, status, reason, message));
    true
}

/// Remove a condition by type. Returns `true` if one was removed.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    before != conditions.len()
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        assert!(set_condition(&mut conditions, "Ready", ConditionStatus::False, "Pending", "waiting"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "Pending");
    }

    #[test]
    fn test_same_status_and_reason_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", ConditionStatus::False, "Pending", "first");
        let original = conditions[0].clone();

        let changed = set_condition(&mut conditions, "Ready", ConditionStatus::False, "Pending", "second");

        assert!(!changed);
        assert_eq!(conditions[0], original);
        assert_eq!(conditions[0].message, "first");
    }

    #[test]
    fn test_reason_change_rewrites_condition() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", ConditionStatus::False, "Pending", "waiting");
        let first = conditions[0].last_transition_time;

        assert!(set_condition(&mut conditions, "Ready", ConditionStatus::False, "Failed", "order invalid"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "Failed");
        assert!(conditions[0].last_transition_time >= first);
    }

    #[test]
    fn test_is_condition_true() {
        let mut conditions = Vec::new();
        assert!(!is_condition_true(&conditions, "Ready"));
        set_condition(&mut conditions, "Ready", ConditionStatus::True, "Issued", "");
        assert!(is_condition_true(&conditions, "Ready"));
        assert!(remove_condition(&mut conditions, "Ready"));
        assert!(find_condition(&conditions, "Ready").is_none());
    }
}
