//! Typed envelope for arbitrary manifest objects
//!
//! Every rendered object is kept as `{gvk, namespace, name, payload}`. The
//! engine only inspects a few well-known status fields, through the accessors
//! below, rather than indexing the payload ad hoc.

use kube::api::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use serde_json::Value;

use crate::crd::SyncedResource;
use crate::error::{Error, Result};

/// Anything that can name the object it operates on
pub trait ObjectIdentity {
    fn identity(&self) -> SyncedResource;
}

impl ObjectIdentity for SyncedResource {
    fn identity(&self) -> SyncedResource {
        self.clone()
    }
}

/// A single decoded manifest object
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestObject {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
    payload: Value,
}

/// Health of an object as observed on the target cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectHealth {
    Healthy,
    Converging(String),
    Failed(String),
}

impl ManifestObject {
    /// Build an envelope from a decoded document
    ///
    /// The document must be a mapping carrying `apiVersion`, `kind` and
    /// `metadata.name`.
    pub fn from_value(payload: Value) -> std::result::Result<Self, String> {
        let obj = payload
            .as_object()
            .ok_or_else(|| "document is not a mapping".to_string())?;

        let api_version = obj
            .get("apiVersion")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing apiVersion".to_string())?;
        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing kind".to_string())?;
        let metadata = obj.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{kind} is missing metadata.name"))?
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        };

        Ok(Self {
            gvk: GroupVersionKind::gvk(&group, &version, kind),
            namespace,
            name,
            payload,
        })
    }

    /// Build an envelope from an object read back from a cluster
    pub fn from_dynamic(obj: &DynamicObject, gvk: &GroupVersionKind) -> Result<Self> {
        let mut payload = serde_json::to_value(obj)?;
        if let Some(map) = payload.as_object_mut() {
            map.insert("apiVersion".to_string(), Value::String(gvk.api_version()));
            map.insert("kind".to_string(), Value::String(gvk.kind.clone()));
        }
        Self::from_value(payload).map_err(Error::ConfigError)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Give namespaced-or-unknown objects a namespace when they lack one
    fn default_namespace(&mut self, namespace: &str) {
        if self.namespace.is_some() {
            return;
        }
        self.namespace = Some(namespace.to_string());
        if let Some(meta) = self
            .payload
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            meta.insert(
                "namespace".to_string(),
                Value::String(namespace.to_string()),
            );
        }
    }

    /// Place the object in `namespace`, or make it cluster-scoped on `None`
    pub fn scope_to(&mut self, namespace: Option<&str>) {
        match namespace {
            Some(ns) if self.namespace.as_deref() != Some(ns) => {
                self.namespace = None;
                self.default_namespace(ns);
            }
            Some(_) => {}
            None => self.clear_namespace(),
        }
    }

    /// Drop the namespace, used for cluster-scoped kinds
    fn clear_namespace(&mut self) {
        self.namespace = None;
        if let Some(meta) = self
            .payload
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            meta.remove("namespace");
        }
    }

    /// Convert into a `DynamicObject` suitable for server-side apply
    pub fn to_dynamic(&self, resource: &ApiResource) -> Result<DynamicObject> {
        let mut obj: DynamicObject = serde_json::from_value(self.payload.clone())?;
        obj.types = Some(kube::api::TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        Ok(obj)
    }

    /// `status.state` if the object reports one (module CRs do)
    pub fn status_state(&self) -> Option<&str> {
        self.payload
            .get("status")
            .and_then(|s| s.get("state"))
            .and_then(Value::as_str)
    }

    /// `status.conditions` as `(type, status, reason)` triples
    pub fn status_conditions(&self) -> Vec<(String, String, String)> {
        self.payload
            .get("status")
            .and_then(|s| s.get("conditions"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| {
                        let type_ = c.get("type")?.as_str()?.to_string();
                        let status = c.get("status")?.as_str()?.to_string();
                        let reason = c
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        Some((type_, status, reason))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Classify the object's health from its reported status
    pub fn health(&self) -> ObjectHealth {
        if let Some(state) = self.status_state() {
            return match state {
                "Ready" => ObjectHealth::Healthy,
                "Error" => ObjectHealth::Failed(format!("{} reports state Error", self.name)),
                other => ObjectHealth::Converging(format!("{} reports state {other}", self.name)),
            };
        }

        let conditions = self.status_conditions();
        for (type_, status, reason) in &conditions {
            let failed = (type_ == "ReplicaFailure" && status == "True")
                || (type_ == "Progressing"
                    && status == "False"
                    && reason == "ProgressDeadlineExceeded");
            if failed {
                return ObjectHealth::Failed(format!(
                    "{} condition {type_}={status} ({reason})",
                    self.name
                ));
            }
        }
        if let Some((type_, status, _)) = conditions
            .iter()
            .find(|(t, _, _)| t == "Ready" || t == "Available")
        {
            return if status == "True" {
                ObjectHealth::Healthy
            } else {
                ObjectHealth::Converging(format!("{} condition {type_}={status}", self.name))
            };
        }

        ObjectHealth::Healthy
    }
}

impl ObjectIdentity for ManifestObject {
    fn identity(&self) -> SyncedResource {
        SyncedResource {
            group: self.gvk.group.clone(),
            version: self.gvk.version.clone(),
            kind: self.gvk.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// Group/version/kind of a tracked reference
pub fn gvk_of(resource: &SyncedResource) -> GroupVersionKind {
    GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_splits_api_version() {
        let obj = ManifestObject::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "keda-operator", "namespace": "kyma-system"}
        }))
        .unwrap();
        assert_eq!(obj.gvk.group, "apps");
        assert_eq!(obj.gvk.version, "v1");
        assert_eq!(obj.namespace.as_deref(), Some("kyma-system"));

        let core = ManifestObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "kyma-system"}
        }))
        .unwrap();
        assert_eq!(core.gvk.group, "");
        assert_eq!(core.identity().api_version(), "v1");
    }

    #[test]
    fn test_from_value_requires_name() {
        let err = ManifestObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {}
        }))
        .unwrap_err();
        assert!(err.contains("metadata.name"));
    }

    #[test]
    fn test_default_namespace_updates_payload() {
        let mut obj = ManifestObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings"}
        }))
        .unwrap();
        obj.default_namespace("kyma-system");
        assert_eq!(obj.payload()["metadata"]["namespace"], "kyma-system");

        obj.default_namespace("other");
        assert_eq!(obj.namespace.as_deref(), Some("kyma-system"));
    }

    #[test]
    fn test_scope_to_sets_or_clears_namespace() {
        let mut obj = ManifestObject::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": "keda-reader", "namespace": "default"}
        }))
        .unwrap();
        obj.scope_to(None);
        assert_eq!(obj.identity().namespace, None);
        assert!(obj.payload()["metadata"].get("namespace").is_none());

        obj.scope_to(Some("kyma-system"));
        assert_eq!(obj.identity().namespace.as_deref(), Some("kyma-system"));
        assert_eq!(obj.payload()["metadata"]["namespace"], "kyma-system");
    }

    #[test]
    fn test_health_from_state_field() {
        let obj = ManifestObject::from_value(json!({
            "apiVersion": "operator.kyma-project.io/v1alpha1",
            "kind": "Keda",
            "metadata": {"name": "default"},
            "status": {"state": "Processing"}
        }))
        .unwrap();
        assert!(matches!(obj.health(), ObjectHealth::Converging(_)));
    }

    #[test]
    fn test_health_from_deployment_conditions() {
        let obj = ManifestObject::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "status": {"conditions": [
                {"type": "Available", "status": "True"},
                {"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}
            ]}
        }))
        .unwrap();
        assert!(matches!(obj.health(), ObjectHealth::Failed(_)));
    }

    #[test]
    fn test_health_without_status_is_healthy() {
        let obj = ManifestObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings"}
        }))
        .unwrap();
        assert_eq!(obj.health(), ObjectHealth::Healthy);
    }
}
