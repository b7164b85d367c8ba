//! Controller module for Kyma reconciliation
//! This module contains the main controller loop, the module sync engine
//! and the pieces it is assembled from.

pub mod aggregator;
pub mod applier;
pub mod batch;
pub mod conditions;
pub mod engine;
mod finalizers;
pub mod manifest;
pub mod metrics;
pub mod object;
pub mod predicates;
mod reconciler;
pub mod remote;
pub mod resolver;
pub mod retry;
pub mod tracker;

pub use aggregator::{aggregate, AggregateInput};
pub use applier::{DeleteOutcome, KubeTargetClient, TargetClient};
pub use engine::{
    manifest_digest, EngineSettings, ModuleSyncEngine, Phase, SyncOutcome, TeardownOutcome,
};
pub use finalizers::KYMA_FINALIZER;
pub use manifest::{decode_manifest, ManifestDecoder};
pub use object::{ManifestObject, ObjectHealth, ObjectIdentity};
pub use reconciler::{
    compose_status, run_controller, ControllerState, ReconcilerSettings, StatusUpdate,
};
pub use resolver::{DescriptorResolver, ModuleTemplateResolver, ResolvedModule};
pub use retry::{calculate_backoff, ConflictRetry};
pub use tracker::SyncedResourceTracker;
