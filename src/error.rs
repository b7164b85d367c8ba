//! Error types for the Kyma lifecycle operator

use std::fmt;

use thiserror::Error;

use crate::controller::batch::BatchError;
use crate::crd::SyncedResource;

/// Operation performed against a single object on a target cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectOperation {
    Apply,
    Delete,
    Get,
}

impl fmt::Display for ObjectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectOperation::Apply => f.write_str("apply"),
            ObjectOperation::Delete => f.write_str("delete"),
            ObjectOperation::Get => f.write_str("get"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    /// Operator or resource misconfiguration; never retried on its own
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A module reference could not be resolved to a descriptor
    #[error("cannot resolve module {module} on channel {channel}: {reason}")]
    ChannelResolution {
        module: String,
        channel: String,
        reason: String,
    },

    #[error("gateway {namespace}/{name} should have configured exactly one server and one host (found {servers} server(s), {hosts} host(s) on the first)")]
    GatewayMisconfigured {
        name: String,
        namespace: String,
        servers: usize,
        hosts: usize,
    },

    /// A manifest document could not be decoded; `index` is zero-based
    #[error("failed to decode manifest document {index}: {message}")]
    ManifestDecode { index: usize, message: String },

    /// A client call against one object failed
    #[error("{operation} {object} failed: {source}")]
    ObjectOperation {
        operation: ObjectOperation,
        object: SyncedResource,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Batch(#[from] BatchError),

    /// A deleted object is still visible, typically held by finalizers
    #[error("{0} is still present on the target cluster")]
    StillPresent(SyncedResource),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Remote cluster error: {0}")]
    RemoteCluster(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

impl Error {
    /// Wrap an error with the object and operation it happened on
    pub fn on_object(self, operation: ObjectOperation, object: &SyncedResource) -> Self {
        Error::ObjectOperation {
            operation,
            object: object.clone(),
            source: Box::new(self),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            // 404 covers objects whose namespace is created in the same batch
            Error::KubeError(kube::Error::Api(resp)) => {
                matches!(resp.code, 404 | 409 | 429) || resp.code >= 500
            }
            Error::KubeError(_) => true,
            Error::FinalizerError(inner) => match inner.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.is_retriable(),
                _ => true,
            },
            Error::ObjectOperation { source, .. } => source.is_retriable(),
            Error::Batch(batch) => batch.failures().iter().all(|f| f.error.is_retriable()),
            Error::RemoteCluster(_)
            | Error::StillPresent(_)
            | Error::Timeout(_)
            | Error::Cancelled => true,
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::ChannelResolution { .. }
            | Error::GatewayMisconfigured { .. }
            | Error::ManifestDecode { .. }
            | Error::Certificate(_)
            | Error::SerializationError(_) => false,
        }
    }

    /// Whether the error stems from configuration rather than a transient fault
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::ChannelResolution { .. }
            | Error::GatewayMisconfigured { .. } => true,
            Error::ObjectOperation { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// Whether this is an HTTP 409 from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Short machine-readable reason used in conditions and module status
    pub fn reason(&self) -> &'static str {
        match self {
            Error::ChannelResolution { .. } => "ChannelResolutionFailed",
            Error::GatewayMisconfigured { .. } => "GatewayMisconfigured",
            Error::ManifestDecode { .. } => "ManifestDecodeFailed",
            Error::ConfigError(_) => "ConfigurationError",
            Error::ValidationError(_) => "ValidationFailed",
            Error::Certificate(_) => "CertificateError",
            Error::RemoteCluster(_) => "RemoteClusterUnavailable",
            Error::StillPresent(_) => "Deleting",
            Error::Timeout(_) | Error::Cancelled => "Timeout",
            Error::Batch(_) | Error::ObjectOperation { .. } => "SyncFailed",
            _ => "ReconcileError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    fn config_map(name: &str) -> SyncedResource {
        SyncedResource {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: Some("default".to_string()),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_api_errors_classified_by_code() {
        assert!(api_error(409).is_retriable());
        assert!(api_error(409).is_conflict());
        assert!(api_error(503).is_retriable());
        assert!(!api_error(422).is_retriable());
        assert!(!api_error(403).is_retriable());
        assert!(api_error(404).is_retriable());
        assert!(!api_error(404).is_conflict());
    }

    #[test]
    fn test_configuration_errors_are_not_retriable() {
        let err = Error::GatewayMisconfigured {
            name: "kyma-gateway".to_string(),
            namespace: "istio-system".to_string(),
            servers: 2,
            hosts: 1,
        };
        assert!(err.is_configuration());
        assert!(!err.is_retriable());
        assert_eq!(err.reason(), "GatewayMisconfigured");

        let invalid = Error::ValidationError("module keda is listed twice".to_string());
        assert!(invalid.is_configuration());
        assert!(!invalid.is_retriable());
        assert_eq!(invalid.reason(), "ValidationFailed");
    }

    #[test]
    fn test_object_operation_keeps_identity_and_cause() {
        let err = api_error(500).on_object(ObjectOperation::Apply, &config_map("settings"));
        let msg = err.to_string();
        assert!(msg.contains("apply"));
        assert!(msg.contains("v1/ConfigMap default/settings"));
        assert!(err.is_retriable());
    }
}
