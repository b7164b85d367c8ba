//! Finalizer handling for Kyma cleanup
//!
//! The finalizer keeps a Kyma around after deletion is requested until:
//! 1. Every synced resource of every module is confirmed absent
//! 2. The webhook TLS identity for the Kyma is deleted

/// Finalizer name used to protect Kyma resources
///
/// Added by the kube-rs `finalizer` helper on the first reconcile and removed
/// once cleanup completes.
pub const KYMA_FINALIZER: &str = "operator.kyma-project.io/lifecycle-manager";
