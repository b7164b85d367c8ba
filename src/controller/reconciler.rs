//! Main reconciler for Kyma resources
//!
//! Implements the controller pattern using kube-rs runtime. Each reconcile
//! runs one engine cycle under a deadline, folds the result into the Kyma
//! status and writes it back only when something changed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{Api, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::aggregator::{aggregate, AggregateInput};
use super::applier::{KubeTargetClient, TargetClient, TargetClientCache};
use super::conditions::{
    find_condition, remove_condition, set_condition, set_observed_generation,
    CONDITION_TYPE_REMOTE_WEBHOOK, CONDITION_TYPE_SPEC_VALID,
};
use super::engine::{EngineSettings, ModuleSyncEngine, SyncOutcome};
use super::finalizers::KYMA_FINALIZER;
use super::metrics;
use super::remote::RemoteClientCache;
use super::resolver::{DescriptorResolver, ModuleTemplateResolver};
use super::retry::{calculate_backoff, retry_on_conflict, ConflictRetry};
use crate::bridge::{CrossClusterBridge, WebhookEndpoint};
use crate::crd::{
    Condition, ConditionStatus, Kyma, KymaStatus, LastOperation, ModuleStatus, State,
    SyncStrategy,
};
use crate::error::{Error, Result};

/// Extra time granted after cancellation for in-flight calls to return
const CANCEL_GRACE: Duration = Duration::from_secs(5);

const BACKOFF_BASE_SECS: u64 = 15;
const BACKOFF_MAX_SECS: u64 = 300;

/// Controller tunables
#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    /// Namespace holding ModuleTemplates and webhook secrets
    pub namespace: String,
    pub field_manager: String,
    pub reconcile_timeout: Duration,
    pub requeue_ready: Duration,
    pub requeue_busy: Duration,
    pub engine: EngineSettings,
    pub conflict_retry: ConflictRetry,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            namespace: "kcp-system".to_string(),
            field_manager: "lifecycle-operator".to_string(),
            reconcile_timeout: Duration::from_secs(60),
            requeue_ready: Duration::from_secs(300),
            requeue_busy: Duration::from_secs(10),
            engine: EngineSettings::default(),
            conflict_retry: ConflictRetry::default(),
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub settings: ReconcilerSettings,
    resolver: Arc<dyn DescriptorResolver>,
    bridge: Option<CrossClusterBridge>,
    remote_clients: RemoteClientCache,
    targets: TargetClientCache,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        settings: ReconcilerSettings,
        bridge: Option<CrossClusterBridge>,
    ) -> Self {
        let resolver = Arc::new(ModuleTemplateResolver::new(
            client.clone(),
            &settings.namespace,
        ));
        Self {
            client,
            settings,
            resolver,
            bridge,
            remote_clients: RemoteClientCache::new(),
            targets: TargetClientCache::new(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Client for the cluster a Kyma synchronizes to
    ///
    /// Clients are reused across reconciles until the strategy, the default
    /// namespace or the runtime kubeconfig changes.
    async fn target_for(&self, kyma: &Kyma) -> Result<Arc<dyn TargetClient>> {
        let namespace = kyma.namespace().unwrap_or_else(|| "default".to_string());
        let default_namespace = kyma
            .spec
            .sync
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.clone());
        let (client, fingerprint) = match kyma.spec.sync.strategy {
            SyncStrategy::Local => (self.client.clone(), format!("local/{default_namespace}")),
            SyncStrategy::Secret => {
                let runtime = self
                    .remote_clients
                    .client_for(&self.client, &namespace, &kyma.name_any())
                    .await?;
                let fingerprint =
                    format!("secret/{default_namespace}/{}", runtime.kubeconfig_digest);
                (runtime.client, fingerprint)
            }
        };
        let field_manager = &self.settings.field_manager;
        let target = self
            .targets
            .get_or_build(&object_key(kyma), &fingerprint, || -> Arc<dyn TargetClient> {
                Arc::new(KubeTargetClient::new(client, field_manager, default_namespace))
            })
            .await;
        Ok(target)
    }

    fn engine(&self, target: Arc<dyn TargetClient>, cancel: CancellationToken) -> ModuleSyncEngine {
        ModuleSyncEngine::new(
            target,
            self.resolver.clone(),
            self.settings.engine.clone(),
            cancel,
        )
    }

    fn next_attempt(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        let attempt = attempts.entry(key.to_string()).or_insert(0);
        let current = *attempt;
        *attempt = attempt.saturating_add(1);
        current
    }

    fn reset_attempts(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        attempts.remove(key);
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let kymas: Api<Kyma> = Api::all(state.client.clone());

    info!("Starting Kyma controller");

    // Verify CRD exists
    match kymas.list(&Default::default()).await {
        Ok(_) => info!("Kyma CRD is available"),
        Err(e) => {
            error!("Kyma CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Kyma CRD not installed".to_string()));
        }
    }

    Controller::new(kymas, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {}", obj),
                Err(e) => warn!("Reconcile failed: {}", e),
            }
        })
        .await;

    Ok(())
}

fn object_key(kyma: &Kyma) -> String {
    format!(
        "{}/{}",
        kyma.namespace().unwrap_or_else(|| "default".to_string()),
        kyma.name_any()
    )
}

/// The main reconciliation function
///
/// Called whenever a Kyma is created, updated or deleted, and when the
/// requeue timer expires.
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Kyma>, ctx: Arc<ControllerState>) -> Result<Action> {
    let start = Instant::now();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Kyma> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, KYMA_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(kyma) => apply_kyma(&ctx, &kyma).await,
            FinalizerEvent::Cleanup(kyma) => cleanup_kyma(&ctx, &kyma).await,
        }
    })
    .await
    .map_err(Error::from);

    metrics::observe_reconcile_duration_seconds(
        metrics::KYMA_CONTROLLER,
        start.elapsed().as_secs_f64(),
    );
    result
}

/// Run one sync cycle and persist the resulting status
async fn apply_kyma(ctx: &ControllerState, kyma: &Kyma) -> Result<Action> {
    let name = kyma.name_any();
    let previous = kyma.current_status();
    let mut conditions = previous.conditions.clone();

    if let Err(e) = kyma.spec.validate() {
        let err = Error::ValidationError(e.to_string());
        warn!("Kyma {} is invalid: {}", name, err);
        set_condition(
            &mut conditions,
            CONDITION_TYPE_SPEC_VALID,
            ConditionStatus::False,
            err.reason(),
            &e.to_string(),
        );
        let status = compose_status(
            &previous,
            StatusUpdate {
                generation: kyma.metadata.generation,
                desired: &[],
                modules: previous.modules.clone(),
                conditions,
                deletion_requested: false,
                operation: format!("invalid spec: {e}"),
            },
        );
        write_status(ctx, kyma, status).await?;
        return Ok(Action::await_change());
    }
    remove_condition(&mut conditions, CONDITION_TYPE_SPEC_VALID);

    let outcome = match sync_modules(ctx, kyma, &previous).await {
        Ok(outcome) => outcome,
        Err(e) => {
            record_failure(ctx, kyma, &previous, &e).await;
            return Err(e);
        }
    };

    match (&ctx.bridge, bridge_action(kyma.spec.sync.strategy, &previous.conditions)) {
        (Some(bridge), BridgeAction::Provision) => {
            let result = bridge.provision(&name).await;
            if let Err(e) = &result {
                warn!("Webhook bridge for Kyma {} failed: {}", name, e);
            }
            record_bridge_result(&mut conditions, &result);
        }
        (Some(bridge), BridgeAction::Retire) => {
            let result = bridge.teardown(&name).await;
            record_bridge_retirement(&mut conditions, &result);
        }
        _ => remove_condition(&mut conditions, CONDITION_TYPE_REMOTE_WEBHOOK),
    }

    let desired: Vec<String> = kyma.spec.modules.iter().map(|m| m.name.clone()).collect();
    let operation = describe_outcome(&outcome);
    let status = compose_status(
        &previous,
        StatusUpdate {
            generation: kyma.metadata.generation,
            desired: &desired,
            modules: outcome.modules,
            conditions,
            deletion_requested: false,
            operation,
        },
    );
    let state = status.state.unwrap_or_default();
    let namespace = kyma.namespace().unwrap_or_else(|| "default".to_string());
    metrics::record_module_states(&namespace, &name, &previous.modules, &status.modules);
    write_status(ctx, kyma, status).await?;
    ctx.reset_attempts(&object_key(kyma));

    let requeue = requeue_after(&ctx.settings, state, outcome.cancelled);
    info!(
        phase = %outcome.phase,
        state = %state,
        "Kyma {} reconciled, next check in {:?}",
        name,
        requeue
    );
    Ok(Action::requeue(requeue))
}

/// Prune every synced resource, then release the Kyma
async fn cleanup_kyma(ctx: &ControllerState, kyma: &Kyma) -> Result<Action> {
    let name = kyma.name_any();
    let namespace = kyma.namespace().unwrap_or_else(|| "default".to_string());
    let previous = kyma.current_status();
    info!("Cleaning up Kyma {}/{}", namespace, name);

    if previous.modules.iter().any(|m| !m.synced.is_empty()) {
        let target = ctx.target_for(kyma).await?;
        let cancel = CancellationToken::new();
        let engine = ctx.engine(target, cancel.clone());
        let outcome = with_deadline(
            ctx.settings.reconcile_timeout,
            &cancel,
            engine.teardown(&previous),
        )
        .await?;

        let remaining = outcome
            .modules
            .iter()
            .flat_map(|m| m.synced.iter())
            .next()
            .cloned();
        if let Some(resource) = remaining {
            let count: usize = outcome.modules.iter().map(|m| m.synced.len()).sum();
            let status = compose_status(
                &previous,
                StatusUpdate {
                    generation: kyma.metadata.generation,
                    desired: &[],
                    modules: outcome.modules,
                    conditions: previous.conditions.clone(),
                    deletion_requested: true,
                    operation: format!("{}: {count} synced resource(s) remaining", outcome.phase),
                },
            );
            write_status(ctx, kyma, status).await?;
            return Err(Error::StillPresent(resource));
        }
        debug!(phase = %outcome.phase, "Teardown complete");
    }

    if let (Some(bridge), BridgeAction::Provision | BridgeAction::Retire) = (
        &ctx.bridge,
        bridge_action(kyma.spec.sync.strategy, &previous.conditions),
    ) {
        bridge.teardown(&name).await?;
    }
    ctx.remote_clients.invalidate(&namespace, &name).await;
    ctx.targets.invalidate(&object_key(kyma)).await;
    metrics::forget_kyma(&namespace, &name, &previous.modules);
    ctx.reset_attempts(&object_key(kyma));

    info!("Kyma {}/{} cleaned up", namespace, name);
    Ok(Action::await_change())
}

async fn sync_modules(
    ctx: &ControllerState,
    kyma: &Kyma,
    previous: &KymaStatus,
) -> Result<SyncOutcome> {
    let target = ctx.target_for(kyma).await?;
    let cancel = CancellationToken::new();
    let engine = ctx.engine(target, cancel.clone());
    with_deadline(
        ctx.settings.reconcile_timeout,
        &cancel,
        engine.sync(&kyma.name_any(), &kyma.spec, previous),
    )
    .await?
}

/// Cancel `cancel` after `timeout` and give up on `fut` shortly after
async fn with_deadline<F: Future>(
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output> {
    let deadline = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        }
    });
    let result = tokio::time::timeout(timeout + CANCEL_GRACE, fut).await;
    deadline.abort();
    result.map_err(|_| Error::Timeout(timeout))
}

/// Surface a failed cycle through `lastOperation` without touching state
async fn record_failure(ctx: &ControllerState, kyma: &Kyma, previous: &KymaStatus, err: &Error) {
    let desired: Vec<String> = kyma.spec.modules.iter().map(|m| m.name.clone()).collect();
    let status = compose_status(
        previous,
        StatusUpdate {
            generation: previous.observed_generation,
            desired: &desired,
            modules: previous.modules.clone(),
            conditions: previous.conditions.clone(),
            deletion_requested: false,
            operation: format!("{}: {}", err.reason(), err),
        },
    );
    if let Err(e) = write_status(ctx, kyma, status).await {
        warn!("Failed to record reconcile failure: {}", e);
    }
}

/// Replace the status subresource, retrying on conflicts
async fn write_status(ctx: &ControllerState, kyma: &Kyma, status: KymaStatus) -> Result<()> {
    if kyma.status.as_ref() == Some(&status) {
        debug!("Status of Kyma {} unchanged", kyma.name_any());
        return Ok(());
    }

    let namespace = kyma.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Kyma> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = kyma.name_any();

    retry_on_conflict(&ctx.settings.conflict_retry, "kyma-status", || {
        let api = api.clone();
        let name = name.clone();
        let status = status.clone();
        async move {
            let mut latest = api.get_status(&name).await?;
            latest.status = Some(status);
            let data = serde_json::to_vec(&latest)?;
            api.replace_status(&name, &PostParams::default(), data)
                .await?;
            Ok::<(), Error>(())
        }
    })
    .await
}

/// Inputs for a new status beyond what was last written
pub struct StatusUpdate<'a> {
    pub generation: Option<i64>,
    /// Names of the desired modules
    pub desired: &'a [String],
    pub modules: Vec<ModuleStatus>,
    /// Conditions including externally owned ones, before aggregation
    pub conditions: Vec<Condition>,
    pub deletion_requested: bool,
    /// Human readable summary stored in `lastOperation`
    pub operation: String,
}

/// Build the status to persist
///
/// State and derived conditions come from the aggregator. `lastOperation`
/// keeps its timestamp while the summary is unchanged, so an unchanged
/// cycle yields an identical status.
pub fn compose_status(previous: &KymaStatus, update: StatusUpdate<'_>) -> KymaStatus {
    let (state, mut conditions) = aggregate(AggregateInput {
        desired: update.desired,
        modules: &update.modules,
        conditions: &update.conditions,
        deletion_requested: update.deletion_requested,
        all_absent: false,
    });
    set_observed_generation(&mut conditions, update.generation);

    let last_operation = match &previous.last_operation {
        Some(op) if op.operation == update.operation => op.clone(),
        _ => LastOperation {
            operation: update.operation,
            last_update_time: Utc::now().to_rfc3339(),
        },
    };

    KymaStatus {
        state: Some(state),
        conditions,
        modules: update.modules,
        observed_generation: update.generation,
        last_operation: Some(last_operation),
    }
}

/// One-line summary of a sync cycle
pub(crate) fn describe_outcome(outcome: &SyncOutcome) -> String {
    let ready = outcome
        .modules
        .iter()
        .filter(|m| m.state == State::Ready)
        .count();
    let mut summary = format!(
        "{}: {}/{} modules ready",
        outcome.phase,
        ready,
        outcome.modules.len()
    );
    if outcome.cancelled {
        summary.push_str(" (cycle timed out)");
    }
    summary
}

/// Fold the bridge result into the `RemoteWebhook` condition
pub(crate) fn record_bridge_result(
    conditions: &mut Vec<Condition>,
    result: &Result<WebhookEndpoint>,
) {
    match result {
        Ok(endpoint) => set_condition(
            conditions,
            CONDITION_TYPE_REMOTE_WEBHOOK,
            ConditionStatus::True,
            "Provisioned",
            &format!("webhook identity {} bound to {}", endpoint.secret_name, endpoint.address),
        ),
        Err(e) if e.is_configuration() => set_condition(
            conditions,
            CONDITION_TYPE_REMOTE_WEBHOOK,
            ConditionStatus::False,
            e.reason(),
            &e.to_string(),
        ),
        Err(e) => set_condition(
            conditions,
            CONDITION_TYPE_REMOTE_WEBHOOK,
            ConditionStatus::Unknown,
            e.reason(),
            &e.to_string(),
        ),
    }
}

/// What the webhook bridge should do for a Kyma this cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BridgeAction {
    Provision,
    /// The Kyma stopped using the bridge; remove what was provisioned
    Retire,
    Skip,
}

/// Decide the bridge action from the strategy and the last written conditions
pub(crate) fn bridge_action(strategy: SyncStrategy, previous: &[Condition]) -> BridgeAction {
    match strategy {
        SyncStrategy::Secret => BridgeAction::Provision,
        _ if find_condition(previous, CONDITION_TYPE_REMOTE_WEBHOOK).is_some() => {
            BridgeAction::Retire
        }
        _ => BridgeAction::Skip,
    }
}

/// Drop the `RemoteWebhook` condition once the bridge is retired
///
/// A failed retirement keeps the condition, as Unknown, so the next cycle
/// tries again.
pub(crate) fn record_bridge_retirement(conditions: &mut Vec<Condition>, result: &Result<()>) {
    match result {
        Ok(()) => remove_condition(conditions, CONDITION_TYPE_REMOTE_WEBHOOK),
        Err(e) => {
            warn!("Retiring webhook bridge failed: {}", e);
            set_condition(
                conditions,
                CONDITION_TYPE_REMOTE_WEBHOOK,
                ConditionStatus::Unknown,
                e.reason(),
                &format!("failed to remove webhook identity: {e}"),
            );
        }
    }
}

/// Delay before the next periodic check
pub(crate) fn requeue_after(settings: &ReconcilerSettings, state: State, cancelled: bool) -> Duration {
    match state {
        _ if cancelled => settings.requeue_busy,
        State::Ready | State::Error => settings.requeue_ready,
        _ => settings.requeue_busy,
    }
}

/// Delay before retrying after a failed reconcile
pub(crate) fn retry_delay(error: &Error, attempt: u32) -> Duration {
    if error.is_retriable() {
        calculate_backoff(attempt, Some(BACKOFF_BASE_SECS), Some(BACKOFF_MAX_SECS))
    } else {
        Duration::from_secs(BACKOFF_MAX_SECS)
    }
}

/// Error policy for the controller
fn error_policy(kyma: Arc<Kyma>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    metrics::inc_reconcile_error(metrics::KYMA_CONTROLLER, error.reason());
    let attempt = ctx.next_attempt(&object_key(&kyma));
    let delay = retry_delay(error, attempt);
    if error.is_retriable() {
        warn!(
            attempt,
            "Reconcile of Kyma {} failed, retrying in {:?}: {}",
            kyma.name_any(),
            delay,
            error
        );
    } else {
        error!(
            "Reconcile of Kyma {} failed permanently: {}",
            kyma.name_any(),
            error
        );
    }
    Action::requeue(delay)
}
