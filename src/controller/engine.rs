//! Module synchronization engine
//!
//! Drives one reconciliation cycle for a Kyma: resolve every desired module,
//! decode its manifest, apply and prune through the batch runner, record
//! confirmed outcomes in the tracker and verify what is tracked. The engine
//! never writes status itself; it returns the module statuses for the
//! reconciler to aggregate and persist.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::applier::{prune_object, TargetClient};
use super::batch::{self, BatchError, DEFAULT_CONCURRENCY};
use super::manifest::{decode_manifest, DEFAULT_BUFFER_SIZE};
use super::object::{ManifestObject, ObjectHealth, ObjectIdentity};
use super::resolver::DescriptorResolver;
use super::tracker::SyncedResourceTracker;
use crate::crd::{KymaSpec, KymaStatus, ManifestRef, Module, ModuleStatus, State, SyncedResource};
use crate::error::{Error, Result};

/// Phases of one reconciliation cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Initializing,
    Resolving,
    Applying,
    Verifying,
    Ready,
    Warning,
    Error,
    Deleting,
    Deleted,
}

impl Phase {
    /// Whether the state machine may move from `self` to `next`
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        if next == Deleting {
            return *self != Deleted;
        }
        matches!(
            (self, next),
            (Initializing, Resolving)
                | (Resolving, Applying)
                | (Resolving, Error)
                | (Applying, Verifying)
                | (Verifying, Ready)
                | (Verifying, Warning)
                | (Verifying, Error)
                | (Ready, Resolving)
                | (Warning, Resolving)
                | (Error, Resolving)
                | (Deleting, Deleted)
        )
    }

    /// Phases a cycle ends in
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Ready | Phase::Warning | Phase::Error | Phase::Deleting | Phase::Deleted
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tunables for the engine
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Upper bound on concurrent per-object operations
    pub concurrency: usize,
    /// Read buffer for the manifest decoder
    pub manifest_buffer_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            manifest_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Result of a sync cycle
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    pub phase: Phase,
    /// Desired modules in spec order, then removed modules still being pruned
    pub modules: Vec<ModuleStatus>,
    /// The cycle was cancelled before all operations finished
    pub cancelled: bool,
}

/// Result of a teardown cycle
#[derive(Clone, Debug)]
pub struct TeardownOutcome {
    /// `Deleted` once every tracked reference is confirmed absent
    pub phase: Phase,
    /// Modules that still track references
    pub modules: Vec<ModuleStatus>,
}

/// sha256 of the rendered manifest, hex encoded
pub fn manifest_digest(manifest: &str) -> String {
    hex::encode(Sha256::digest(manifest.as_bytes()))
}

#[derive(Debug)]
struct Cycle {
    phase: Phase,
}

impl Cycle {
    fn new() -> Self {
        Self {
            phase: Phase::Initializing,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid phase transition {} -> {}",
            self.phase,
            next
        );
        debug!(from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
    }

    /// Move into the phase the cycle ends in
    fn finish(&mut self, last: Phase) -> Phase {
        debug_assert!(last.is_terminal(), "{last} does not end a cycle");
        self.advance(last);
        self.phase
    }
}

/// Worst state observed for a module along with its cause
#[derive(Clone, Debug)]
struct Verdict {
    state: State,
    reason: Option<String>,
    message: Option<String>,
}

impl Verdict {
    fn ready() -> Self {
        Self {
            state: State::Ready,
            reason: None,
            message: None,
        }
    }

    fn raise(&mut self, state: State, reason: impl Into<String>, message: impl Into<String>) {
        if state.severity() > self.state.severity() {
            self.state = state;
            self.reason = Some(reason.into());
            self.message = Some(message.into());
        }
    }

    fn raise_error(&mut self, err: &Error) {
        let state = if err.is_retriable() {
            State::Warning
        } else {
            State::Error
        };
        self.raise(state, err.reason(), err.to_string());
    }

    fn apply_to(self, status: &mut ModuleStatus) {
        status.state = self.state;
        status.reason = self.reason;
        status.message = self.message;
    }
}

/// A module after resolution and decoding
struct ModulePlan {
    status: ModuleStatus,
    verdict: Verdict,
    /// `None` when resolution or decoding already failed
    objects: Option<Vec<ManifestObject>>,
}

/// What verification observed for one tracked reference
#[derive(Debug)]
enum Observation {
    Health(ObjectHealth),
    Missing,
}

/// Synchronizes the modules of one Kyma onto one target cluster
pub struct ModuleSyncEngine {
    target: Arc<dyn TargetClient>,
    resolver: Arc<dyn DescriptorResolver>,
    settings: EngineSettings,
    cancel: CancellationToken,
}

impl ModuleSyncEngine {
    pub fn new(
        target: Arc<dyn TargetClient>,
        resolver: Arc<dyn DescriptorResolver>,
        settings: EngineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            resolver,
            settings,
            cancel,
        }
    }

    /// Run one sync cycle
    ///
    /// Configuration errors for a single module are reported in that module's
    /// status; a transient resolution error aborts the cycle before anything
    /// is applied.
    #[instrument(skip_all, fields(kyma = %owner, modules = spec.modules.len()))]
    pub async fn sync(
        &self,
        owner: &str,
        spec: &KymaSpec,
        previous: &KymaStatus,
    ) -> Result<SyncOutcome> {
        let mut cycle = Cycle::new();
        let mut tracker = SyncedResourceTracker::from_module_statuses(&previous.modules);

        cycle.advance(Phase::Resolving);
        let mut plans = Vec::with_capacity(spec.modules.len());
        for module in &spec.modules {
            let plan = self
                .plan_module(owner, module, &spec.channel, previous.module(&module.name), &tracker)
                .await?;
            plans.push(plan);
        }

        cycle.advance(Phase::Applying);
        let mut applied = Vec::with_capacity(plans.len());
        for plan in plans {
            let ModulePlan {
                mut status,
                mut verdict,
                objects,
            } = plan;
            let verify = match objects {
                Some(objects) if spec.sync.enabled => {
                    self.apply_module(&mut status, &mut verdict, objects, &mut tracker)
                        .await;
                    true
                }
                Some(_) => {
                    verdict.reason = Some("SyncDisabled".to_string());
                    verdict.message = Some("synchronization is disabled for this Kyma".to_string());
                    false
                }
                None => false,
            };
            applied.push((status, verdict, verify));
        }

        let desired: BTreeSet<&str> = spec.modules.iter().map(|m| m.name.as_str()).collect();
        let removed = if spec.sync.enabled {
            self.prune_removed_modules(&desired, previous, &mut tracker)
                .await
        } else {
            previous
                .modules
                .iter()
                .filter(|m| !desired.contains(m.name.as_str()))
                .map(|m| deleting_status(m, m.synced.clone(), None))
                .collect()
        };

        cycle.advance(Phase::Verifying);
        let mut modules = Vec::with_capacity(applied.len() + removed.len());
        for (mut status, mut verdict, verify) in applied {
            if verify {
                self.verify_module(&status.name, &mut verdict, &tracker)
                    .await;
            }
            status.synced = tracker.synced(&status.name);
            verdict.apply_to(&mut status);
            modules.push(status);
        }
        modules.extend(removed);

        let worst = modules
            .iter()
            .map(|m| m.state)
            .max_by_key(State::severity)
            .unwrap_or(State::Ready);
        let phase = cycle.finish(match worst {
            State::Ready => Phase::Ready,
            State::Error => Phase::Error,
            _ => Phase::Warning,
        });

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!("Sync cycle was cancelled before completion");
        }
        info!(phase = %phase, "Sync cycle finished");

        Ok(SyncOutcome {
            phase,
            modules,
            cancelled,
        })
    }

    /// Prune every tracked reference of every module
    #[instrument(skip_all, fields(modules = previous.modules.len()))]
    pub async fn teardown(&self, previous: &KymaStatus) -> TeardownOutcome {
        let mut cycle = Cycle::new();
        cycle.advance(Phase::Deleting);

        let mut tracker = SyncedResourceTracker::from_module_statuses(&previous.modules);
        let mut modules = Vec::new();
        for status in &previous.modules {
            let failure = self.prune_module(&status.name, &mut tracker).await;
            if !tracker.forget_module(&status.name) {
                modules.push(deleting_status(
                    status,
                    tracker.synced(&status.name),
                    failure.as_ref(),
                ));
            }
        }

        let phase = if tracker.is_empty() {
            info!("All synced resources removed");
            cycle.finish(Phase::Deleted)
        } else {
            info!(remaining = tracker.len(), "Synced resources still present");
            cycle.phase
        };

        TeardownOutcome {
            phase,
            modules,
        }
    }

    async fn plan_module(
        &self,
        owner: &str,
        module: &Module,
        kyma_channel: &str,
        previous: Option<&ModuleStatus>,
        tracker: &SyncedResourceTracker,
    ) -> Result<ModulePlan> {
        let channel = module.effective_channel(kyma_channel);
        let mut status = ModuleStatus::new(&module.name, channel);
        status.synced = tracker.synced(&module.name);
        status.last_applied_version = previous.and_then(|p| p.last_applied_version.clone());
        let mut verdict = Verdict::ready();

        let resolved = match self.resolver.resolve(&module.name, channel).await {
            Ok(resolved) => resolved,
            Err(e) if e.is_configuration() => {
                warn!(module = %module.name, channel, "Module resolution failed: {}", e);
                verdict.raise(State::Error, e.reason(), e.to_string());
                return Ok(ModulePlan {
                    status,
                    verdict,
                    objects: None,
                });
            }
            Err(e) => return Err(e),
        };

        let digest = manifest_digest(&resolved.manifest);
        status.version = Some(resolved.version);
        status.manifest = Some(ManifestRef {
            name: format!("{owner}-{}", module.name),
            digest: digest.clone(),
        });

        let poisoned = previous.filter(|p| p.failed_digest.as_deref() == Some(digest.as_str()));
        if let Some(prev) = poisoned {
            debug!(module = %module.name, "Manifest unchanged since last decode failure");
            verdict.raise(
                State::Error,
                "ManifestDecodeFailed",
                prev.message
                    .clone()
                    .unwrap_or_else(|| "manifest could not be decoded".to_string()),
            );
            status.failed_digest = Some(digest);
            return Ok(ModulePlan {
                status,
                verdict,
                objects: None,
            });
        }

        match decode_manifest(&resolved.manifest, self.settings.manifest_buffer_size) {
            Ok(objects) => {
                debug!(module = %module.name, objects = objects.len(), "Decoded manifest");
                Ok(ModulePlan {
                    status,
                    verdict,
                    objects: Some(objects),
                })
            }
            Err(e) => {
                warn!(module = %module.name, "Manifest decode failed: {}", e);
                verdict.raise(State::Error, e.reason(), e.to_string());
                status.failed_digest = Some(digest);
                Ok(ModulePlan {
                    status,
                    verdict,
                    objects: None,
                })
            }
        }
    }

    /// Align every object with the scope its kind has on the target cluster
    ///
    /// Objects whose kind cannot be looked up keep the identity they were
    /// written with; their apply reports the lookup failure.
    async fn normalize_objects(&self, objects: Vec<ManifestObject>) -> Vec<ManifestObject> {
        let mut normalized = Vec::with_capacity(objects.len());
        for mut object in objects {
            match self.target.normalize(&object.identity()).await {
                Ok(identity) => object.scope_to(identity.namespace.as_deref()),
                Err(e) => debug!(object = %object.identity(), "Cannot normalize: {}", e),
            }
            normalized.push(object);
        }
        normalized
    }

    /// Apply the rendered objects, prune stale references, record outcomes
    async fn apply_module(
        &self,
        status: &mut ModuleStatus,
        verdict: &mut Verdict,
        objects: Vec<ManifestObject>,
        tracker: &mut SyncedResourceTracker,
    ) {
        let objects = self.normalize_objects(objects).await;
        let target = self.target.as_ref();
        let applied = batch::run_all(&objects, &self.cancel, self.settings.concurrency, |o| {
            target.apply(o)
        })
        .await;

        let desired: Vec<SyncedResource> = objects.iter().map(ObjectIdentity::identity).collect();
        let stale = tracker.stale(&status.name, &desired);
        let pruned = batch::run_all(&stale, &self.cancel, self.settings.concurrency, |r| {
            prune_object(target, r)
        })
        .await;

        let (ok, failed) = batch::partition(&desired, &applied);
        let (_, prune_failed) = batch::partition(&stale, &pruned);
        tracker.record_sync(&status.name, ok, failed, prune_failed);

        // A failed object keeps the tracking it had before, so the tracker
        // still matches the cluster whatever the rejection was.
        match applied {
            Ok(()) => status.last_applied_version = status.version.clone(),
            Err(batch) => {
                warn!(module = %status.name, "{}", batch);
                let err = Error::Batch(batch);
                verdict.raise(State::Warning, err.reason(), err.to_string());
            }
        }
        if let Err(batch) = pruned {
            warn!(module = %status.name, "{}", batch);
            verdict.raise(State::Warning, "PruneFailed", batch.to_string());
        }
    }

    /// Read back every tracked reference and classify its health
    async fn verify_module(
        &self,
        module: &str,
        verdict: &mut Verdict,
        tracker: &SyncedResourceTracker,
    ) {
        let tracked = tracker.synced(module);
        let observations: Mutex<Vec<(SyncedResource, Observation)>> = Mutex::new(Vec::new());
        let target = self.target.as_ref();
        let sink = &observations;

        let read = batch::run_all(&tracked, &self.cancel, self.settings.concurrency, |r| async move {
            let observation = match target.get(r).await? {
                Some(obj) => Observation::Health(obj.health()),
                None => Observation::Missing,
            };
            if let Ok(mut seen) = sink.lock() {
                seen.push((r.clone(), observation));
            }
            Ok::<(), Error>(())
        })
        .await;

        let mut observations = observations
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observations.sort_by(|a, b| a.0.cmp(&b.0));

        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for (resource, observation) in observations {
            match observation {
                Observation::Health(ObjectHealth::Healthy) => {}
                Observation::Health(ObjectHealth::Failed(msg)) => failed.push(msg),
                Observation::Health(ObjectHealth::Converging(msg)) => pending.push(msg),
                Observation::Missing => pending.push(format!("{resource} is missing")),
            }
        }

        if !failed.is_empty() {
            verdict.raise(State::Error, "ResourceFailed", failed.join("; "));
        }
        if !pending.is_empty() {
            verdict.raise(State::Warning, "ResourcesNotReady", pending.join("; "));
        }
        if let Err(batch) = read {
            verdict.raise_error(&Error::Batch(batch));
        }
    }

    /// Prune modules that are no longer desired; returns those still pending
    async fn prune_removed_modules(
        &self,
        desired: &BTreeSet<&str>,
        previous: &KymaStatus,
        tracker: &mut SyncedResourceTracker,
    ) -> Vec<ModuleStatus> {
        let mut pending = Vec::new();
        for status in previous
            .modules
            .iter()
            .filter(|m| !desired.contains(m.name.as_str()))
        {
            let failure = self.prune_module(&status.name, tracker).await;
            if tracker.forget_module(&status.name) {
                info!(module = %status.name, "Removed module fully pruned");
            } else {
                pending.push(deleting_status(
                    status,
                    tracker.synced(&status.name),
                    failure.as_ref(),
                ));
            }
        }
        pending
    }

    async fn prune_module(
        &self,
        module: &str,
        tracker: &mut SyncedResourceTracker,
    ) -> Option<BatchError> {
        let tracked = tracker.synced(module);
        let target = self.target.as_ref();
        let outcome = batch::run_all(&tracked, &self.cancel, self.settings.concurrency, |r| {
            prune_object(target, r)
        })
        .await;

        let (pruned, _) = batch::partition(&tracked, &outcome);
        tracker.record_pruned(module, pruned);
        outcome.err()
    }
}

fn deleting_status(
    previous: &ModuleStatus,
    remaining: Vec<SyncedResource>,
    failure: Option<&BatchError>,
) -> ModuleStatus {
    let mut status = previous.clone();
    status.state = State::Deleting;
    status.synced = remaining;
    status.reason = Some("Deleting".to_string());
    status.message = Some(match failure {
        Some(batch) => batch.to_string(),
        None => format!("waiting for {} synced resource(s) to be removed", status.synced.len()),
    });
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Initializing.can_transition_to(Phase::Resolving));
        assert!(Phase::Resolving.can_transition_to(Phase::Applying));
        assert!(Phase::Applying.can_transition_to(Phase::Verifying));
        assert!(Phase::Verifying.can_transition_to(Phase::Warning));
        assert!(Phase::Ready.can_transition_to(Phase::Deleting));
        assert!(Phase::Deleting.can_transition_to(Phase::Deleted));

        assert!(!Phase::Applying.can_transition_to(Phase::Ready));
        assert!(!Phase::Initializing.can_transition_to(Phase::Deleted));
        assert!(!Phase::Deleted.can_transition_to(Phase::Deleting));
        assert!(!Phase::Deleted.can_transition_to(Phase::Resolving));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Warning.is_terminal());
        assert!(Phase::Deleted.is_terminal());
        assert!(!Phase::Verifying.is_terminal());
    }

    #[test]
    fn test_manifest_digest_is_stable() {
        let a = manifest_digest("kind: ConfigMap\n");
        assert_eq!(a.len(), 64);
        assert_eq!(a, manifest_digest("kind: ConfigMap\n"));
        assert_ne!(a, manifest_digest("kind: Secret\n"));
    }

    #[test]
    fn test_verdict_keeps_most_severe() {
        let mut verdict = Verdict::ready();
        verdict.raise(State::Warning, "ResourcesNotReady", "pending");
        verdict.raise(State::Error, "ResourceFailed", "failed");
        verdict.raise(State::Warning, "PruneFailed", "later");
        assert_eq!(verdict.state, State::Error);
        assert_eq!(verdict.reason.as_deref(), Some("ResourceFailed"));
    }
}
