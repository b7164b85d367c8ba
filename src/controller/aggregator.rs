//! Status aggregation
//!
//! Rolls per-module states and externally set conditions into the Kyma's
//! single [`State`] and its derived conditions. The aggregated state is never
//! set anywhere else.

use crate::crd::{Condition, ConditionStatus, ModuleStatus, State};

use super::conditions::{
    set_condition, CONDITION_TYPE_MODULES, CONDITION_TYPE_READY, DERIVED_CONDITION_TYPES,
};

/// Everything the aggregator looks at
#[derive(Clone, Copy, Debug)]
pub struct AggregateInput<'a> {
    /// Names of the modules currently desired, in spec order
    pub desired: &'a [String],
    pub modules: &'a [ModuleStatus],
    /// Conditions as last written, including ones owned by other components
    pub conditions: &'a [Condition],
    pub deletion_requested: bool,
    /// Every tracked reference has been confirmed absent
    pub all_absent: bool,
}

/// Derive the aggregated state and the updated condition set
///
/// First match wins:
/// 1. deletion requested and something is still present: `Deleting`
/// 2. any module in `Error`, or any non-derived condition `False`: `Error`
/// 3. any module `Warning`/`Processing`/`Deleting`, or any non-derived
///    condition `Unknown`: `Warning`
/// 4. every desired module has a status and all are `Ready`: `Ready`
/// 5. otherwise `Processing`
pub fn aggregate(input: AggregateInput<'_>) -> (State, Vec<Condition>) {
    let state = derive_state(&input);

    let mut conditions = input.conditions.to_vec();
    let (status, reason, message) = modules_condition(&input);
    set_condition(&mut conditions, CONDITION_TYPE_MODULES, status, reason, &message);

    let ready = match state {
        State::Ready => ConditionStatus::True,
        State::Error => ConditionStatus::False,
        _ => ConditionStatus::Unknown,
    };
    let message = match state {
        State::Ready => "All modules are ready".to_string(),
        State::Deleting => "Waiting for synced resources to be removed".to_string(),
        other => format!("Kyma is in state {other}"),
    };
    set_condition(
        &mut conditions,
        CONDITION_TYPE_READY,
        ready,
        &state.to_string(),
        &message,
    );

    (state, conditions)
}

fn derive_state(input: &AggregateInput<'_>) -> State {
    if input.deletion_requested && !input.all_absent {
        return State::Deleting;
    }

    let external: Vec<&Condition> = input
        .conditions
        .iter()
        .filter(|c| !DERIVED_CONDITION_TYPES.contains(&c.type_.as_str()))
        .collect();

    if input.modules.iter().any(|m| m.state == State::Error)
        || external.iter().any(|c| c.status == ConditionStatus::False)
    {
        return State::Error;
    }

    if input.modules.iter().any(|m| {
        matches!(
            m.state,
            State::Warning | State::Processing | State::Deleting
        )
    }) || external.iter().any(|c| c.status == ConditionStatus::Unknown)
    {
        return State::Warning;
    }

    let all_reported = input
        .desired
        .iter()
        .all(|name| input.modules.iter().any(|m| &m.name == name));
    if all_reported && input.modules.iter().all(|m| m.state == State::Ready) {
        return State::Ready;
    }

    State::Processing
}

fn modules_condition(input: &AggregateInput<'_>) -> (ConditionStatus, &'static str, String) {
    let failed: Vec<&str> = input
        .modules
        .iter()
        .filter(|m| m.state == State::Error)
        .map(|m| m.name.as_str())
        .collect();
    if !failed.is_empty() {
        return (
            ConditionStatus::False,
            "ModuleError",
            format!("modules in error: {}", failed.join(", ")),
        );
    }

    let pending: Vec<&str> = input
        .desired
        .iter()
        .map(String::as_str)
        .filter(|name| {
            input
                .modules
                .iter()
                .find(|m| m.name == *name)
                .map_or(true, |m| m.state != State::Ready)
        })
        .chain(
            input
                .modules
                .iter()
                .filter(|m| m.state == State::Deleting)
                .map(|m| m.name.as_str()),
        )
        .collect();
    if pending.is_empty() {
        (
            ConditionStatus::True,
            "Ready",
            "All modules are ready".to_string(),
        )
    } else {
        (
            ConditionStatus::Unknown,
            "Processing",
            format!("modules not ready: {}", pending.join(", ")),
        )
    }
}
