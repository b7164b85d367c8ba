//! Composable predicates over Kyma status
//!
//! Small functions that can be combined with [`all_of`] and [`not`], used by
//! tests and by callers that wait for a status to settle.

use crate::crd::{ConditionStatus, KymaStatus, State};

use super::conditions::find_condition;

/// Boxed predicate over a status snapshot
pub type StatusPredicate = Box<dyn Fn(&KymaStatus) -> bool + Send + Sync>;

/// Aggregated state equals `state`
pub fn in_state(state: State) -> StatusPredicate {
    Box::new(move |status| status.state == Some(state))
}

/// Condition `type_` is present with `expected` status
pub fn has_condition(type_: &'static str, expected: ConditionStatus) -> StatusPredicate {
    Box::new(move |status| {
        find_condition(&status.conditions, type_).is_some_and(|c| c.status == expected)
    })
}

/// Module `name` has a status entry in `state`
pub fn module_in_state(name: impl Into<String>, state: State) -> StatusPredicate {
    let name = name.into();
    Box::new(move |status| status.module(&name).is_some_and(|m| m.state == state))
}

/// Module `name` tracks exactly `count` synced resources
pub fn module_tracks(name: impl Into<String>, count: usize) -> StatusPredicate {
    let name = name.into();
    Box::new(move |status| status.module(&name).is_some_and(|m| m.synced.len() == count))
}

/// No condition reports `False`
pub fn no_failed_conditions() -> StatusPredicate {
    Box::new(|status| {
        status
            .conditions
            .iter()
            .all(|c| c.status != ConditionStatus::False)
    })
}

/// Every predicate holds
pub fn all_of(predicates: Vec<StatusPredicate>) -> StatusPredicate {
    Box::new(move |status| predicates.iter().all(|p| p(status)))
}

pub fn not(predicate: StatusPredicate) -> StatusPredicate {
    Box::new(move |status| !predicate(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::conditions::{set_condition, CONDITION_TYPE_READY};
    use crate::crd::ModuleStatus;

    #[test]
    fn test_predicates_compose() {
        let mut status = KymaStatus {
            state: Some(State::Ready),
            ..Default::default()
        };
        let mut module = ModuleStatus::new("keda", "fast");
        module.state = State::Ready;
        status.modules.push(module);
        set_condition(
            &mut status.conditions,
            CONDITION_TYPE_READY,
            ConditionStatus::True,
            "Ready",
            "",
        );

        let ready = all_of(vec![
            in_state(State::Ready),
            has_condition(CONDITION_TYPE_READY, ConditionStatus::True),
            module_in_state("keda", State::Ready),
            module_tracks("keda", 0),
            no_failed_conditions(),
        ]);
        assert!(ready(&status));
        assert!(!not(in_state(State::Ready))(&status));
        assert!(!module_in_state("serverless", State::Ready)(&status));
    }
}
