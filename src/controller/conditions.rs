//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus};

/// Overall readiness, mirrors the aggregated state
pub const CONDITION_TYPE_READY: &str = "Ready";
/// Rolled up from the per-module states
pub const CONDITION_TYPE_MODULES: &str = "Modules";
/// Set by the cross-cluster bridge
pub const CONDITION_TYPE_REMOTE_WEBHOOK: &str = "RemoteWebhook";
/// Present only while the spec fails validation
pub const CONDITION_TYPE_SPEC_VALID: &str = "SpecValid";

/// Condition types derived by the aggregator itself
pub const DERIVED_CONDITION_TYPES: &[&str] = &[CONDITION_TYPE_READY, CONDITION_TYPE_MODULES];

/// Update or add a condition to the conditions list
///
/// At most one condition exists per type. The transition time only moves
/// when the status value changes; re-evaluating to the same status just
/// refreshes reason and message.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Utc::now().to_rfc3339();
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Stamp every condition with the generation it was computed for
pub fn set_observed_generation(conditions: &mut [Condition], generation: Option<i64>) {
    for condition in conditions {
        condition.observed_generation = generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            ConditionStatus::True,
            "Ready",
            "All modules are ready",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_set_condition_updates_existing() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_MODULES.to_string(),
            status: ConditionStatus::False,
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "Processing".to_string(),
            message: "keda is processing".to_string(),
            observed_generation: None,
        }];

        set_condition(
            &mut conditions,
            CONDITION_TYPE_MODULES,
            ConditionStatus::True,
            "Ready",
            "All modules are ready",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_same_status_keeps_transition_time() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_MODULES.to_string(),
            status: ConditionStatus::False,
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "Processing".to_string(),
            message: "keda is processing".to_string(),
            observed_generation: None,
        }];

        set_condition(
            &mut conditions,
            CONDITION_TYPE_MODULES,
            ConditionStatus::False,
            "Warning",
            "keda is converging",
        );

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, "Warning");
    }

    #[test]
    fn test_find_and_remove() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_TYPE_READY, ConditionStatus::True, "Ready", "");
        set_condition(
            &mut conditions,
            CONDITION_TYPE_REMOTE_WEBHOOK,
            ConditionStatus::Unknown,
            "Retrying",
            "",
        );

        assert_eq!(
            find_condition(&conditions, CONDITION_TYPE_REMOTE_WEBHOOK).map(|c| c.status),
            Some(ConditionStatus::Unknown)
        );
        assert!(find_condition(&conditions, CONDITION_TYPE_MODULES).is_none());

        remove_condition(&mut conditions, CONDITION_TYPE_REMOTE_WEBHOOK);
        assert_eq!(conditions.len(), 1);
    }
}
