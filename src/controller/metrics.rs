//! Prometheus metrics for the lifecycle operator
//!
//! # Exported metrics
//! The `/metrics` endpoint exports the following metrics:
//! - `kyma_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `kyma_reconcile_errors_total` (counter): reconcile errors labeled by controller and reason.
//! - `kyma_module_state` (gauge): 1 for the current state of a module and 0 for the others,
//!   labeled by namespace/kyma/module/state.
//! - `kyma_module_synced_resources` (gauge): tracked references labeled by namespace/kyma/module.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::{ModuleStatus, State};

/// Controller label for the Kyma reconciler
pub const KYMA_CONTROLLER: &str = "kyma";

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Machine-readable reason, e.g. "SyncFailed", "RemoteClusterUnavailable"
    pub reason: String,
}

/// Labels identifying one module of one Kyma
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModuleLabels {
    pub namespace: String,
    pub kyma: String,
    pub module: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModuleStateLabels {
    pub namespace: String,
    pub kyma: String,
    pub module: String,
    pub state: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~5.5min across 16 buckets.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge set to 1 for the state a module is in
pub static MODULE_STATE: Lazy<Family<ModuleStateLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking synced resource references per module
pub static MODULE_SYNCED_RESOURCES: Lazy<Family<ModuleLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "kyma_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "kyma_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "kyma_module_state",
        "Current state of each module, 1 for the active state",
        MODULE_STATE.clone(),
    );
    registry.register(
        "kyma_module_synced_resources",
        "Number of resources tracked as synced per module",
        MODULE_SYNCED_RESOURCES.clone(),
    );
    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, reason: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        reason: reason.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

fn module_labels(namespace: &str, kyma: &str, module: &str) -> ModuleLabels {
    ModuleLabels {
        namespace: namespace.to_string(),
        kyma: kyma.to_string(),
        module: module.to_string(),
    }
}

fn state_labels(namespace: &str, kyma: &str, module: &str, state: State) -> ModuleStateLabels {
    ModuleStateLabels {
        namespace: namespace.to_string(),
        kyma: kyma.to_string(),
        module: module.to_string(),
        state: state.to_string(),
    }
}

/// Publish the module states of a Kyma
///
/// Series of modules present in `previous` but gone from `current` are
/// removed.
pub fn record_module_states(
    namespace: &str,
    kyma: &str,
    previous: &[ModuleStatus],
    current: &[ModuleStatus],
) {
    for module in current {
        for state in State::ALL {
            MODULE_STATE
                .get_or_create(&state_labels(namespace, kyma, &module.name, state))
                .set(i64::from(module.state == state));
        }
        MODULE_SYNCED_RESOURCES
            .get_or_create(&module_labels(namespace, kyma, &module.name))
            .set(module.synced.len() as i64);
    }

    for gone in previous
        .iter()
        .filter(|p| !current.iter().any(|c| c.name == p.name))
    {
        remove_module(namespace, kyma, &gone.name);
    }
}

/// Drop every module series of a Kyma
pub fn forget_kyma(namespace: &str, kyma: &str, modules: &[ModuleStatus]) {
    for module in modules {
        remove_module(namespace, kyma, &module.name);
    }
}

fn remove_module(namespace: &str, kyma: &str, module: &str) {
    for state in State::ALL {
        MODULE_STATE.remove(&state_labels(namespace, kyma, module, state));
    }
    MODULE_SYNCED_RESOURCES.remove(&module_labels(namespace, kyma, module));
}

/// Render the registry in the Prometheus text format
pub fn encode_registry() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, state: State) -> ModuleStatus {
        let mut status = ModuleStatus::new(name, "regular");
        status.state = state;
        status
    }

    #[test]
    fn test_module_state_gauge_marks_one_state() {
        let modules = vec![module("keda", State::Warning)];
        record_module_states("kcp-system", "gauge-test", &[], &modules);

        let active = MODULE_STATE
            .get_or_create(&state_labels("kcp-system", "gauge-test", "keda", State::Warning))
            .get();
        let inactive = MODULE_STATE
            .get_or_create(&state_labels("kcp-system", "gauge-test", "keda", State::Ready))
            .get();
        assert_eq!(active, 1);
        assert_eq!(inactive, 0);
    }

    #[test]
    fn test_removed_modules_drop_their_series() {
        let both = vec![module("keda", State::Ready), module("serverless", State::Ready)];
        record_module_states("kcp-system", "removal-test", &[], &both);
        let only_keda = vec![module("keda", State::Ready)];
        record_module_states("kcp-system", "removal-test", &both, &only_keda);

        let text = encode_registry().unwrap();
        assert!(text.contains("kyma=\"removal-test\",module=\"keda\""));
        assert!(!text.contains("kyma=\"removal-test\",module=\"serverless\""));

        forget_kyma("kcp-system", "removal-test", &only_keda);
        let text = encode_registry().unwrap();
        assert!(!text.contains("kyma=\"removal-test\""));
    }

    #[test]
    fn test_reconcile_metrics_are_registered() {
        observe_reconcile_duration_seconds(KYMA_CONTROLLER, 0.25);
        inc_reconcile_error(KYMA_CONTROLLER, "SyncFailed");

        let text = encode_registry().unwrap();
        assert!(text.contains("kyma_reconcile_duration_seconds"));
        assert!(text.contains("kyma_reconcile_errors_total"));
        assert!(text.contains("reason=\"SyncFailed\""));
    }
}
