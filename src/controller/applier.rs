//! Resource applier and pruner
//!
//! [`TargetClient`] is the seam between the engine and a target cluster. The
//! kube-backed implementation resolves each kind through API discovery and
//! uses server-side apply, so applying the same object twice is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::object::{gvk_of, ManifestObject, ObjectIdentity};
use crate::crd::SyncedResource;
use crate::error::{Error, ObjectOperation, Result};

/// Result of deleting one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Deletion was accepted; the object may linger while finalizers run
    Deleted,
    /// The object did not exist
    Absent,
}

/// Operations the engine needs on a target cluster
///
/// Implementations must be safe to share across concurrent batch operations
/// and must distinguish "not found" (`Ok(None)` / [`DeleteOutcome::Absent`])
/// from other errors.
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// Identity the cluster stores `resource` under
    ///
    /// Namespaced kinds without a namespace get the client's default one and
    /// cluster-scoped kinds lose any namespace, so identities taken from
    /// differently written manifests compare equal.
    async fn normalize(&self, resource: &SyncedResource) -> Result<SyncedResource>;

    /// Create or update the object
    async fn apply(&self, object: &ManifestObject) -> Result<()>;

    /// Read the object back, `None` if it does not exist
    async fn get(&self, resource: &SyncedResource) -> Result<Option<ManifestObject>>;

    /// Request deletion of the object
    async fn delete(&self, resource: &SyncedResource) -> Result<DeleteOutcome>;
}

/// [`TargetClient`] backed by a kube [`Client`]
pub struct KubeTargetClient {
    client: Client,
    field_manager: String,
    default_namespace: String,
    resources: RwLock<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl KubeTargetClient {
    pub fn new(
        client: Client,
        field_manager: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            default_namespace: default_namespace.into(),
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Discover (and cache) the API resource serving a kind
    async fn resolve(&self, resource: &SyncedResource) -> Result<(ApiResource, ApiCapabilities)> {
        let key = format!("{}/{}", resource.api_version(), resource.kind);
        if let Some(found) = self.resources.read().await.get(&key) {
            return Ok(found.clone());
        }

        let gvk = gvk_of(resource);
        let found = discovery::pinned_kind(&self.client, &gvk).await?;
        self.resources.write().await.insert(key, found.clone());
        Ok(found)
    }

    fn api_for(
        &self,
        ar: &ApiResource,
        caps: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), ar),
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or(&self.default_namespace),
                ar,
            ),
        }
    }
}

impl KubeTargetClient {
    fn scoped(&self, caps: &ApiCapabilities, namespace: Option<&str>) -> Option<String> {
        match caps.scope {
            Scope::Cluster => None,
            Scope::Namespaced => Some(namespace.unwrap_or(&self.default_namespace).to_string()),
        }
    }

    async fn apply_inner(&self, object: &ManifestObject) -> Result<()> {
        let (ar, caps) = self.resolve(&object.identity()).await?;
        let mut object = object.clone();
        object.scope_to(self.scoped(&caps, object.namespace.as_deref()).as_deref());
        let api = self.api_for(&ar, &caps, object.namespace.as_deref());
        let dynamic = object.to_dynamic(&ar)?;
        api.patch(
            &object.name,
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(&dynamic),
        )
        .await?;
        Ok(())
    }

    async fn get_inner(&self, resource: &SyncedResource) -> Result<Option<ManifestObject>> {
        let (ar, caps) = self.resolve(resource).await?;
        let api = self.api_for(&ar, &caps, resource.namespace.as_deref());
        match api.get_opt(&resource.name).await? {
            Some(obj) => Ok(Some(ManifestObject::from_dynamic(&obj, &gvk_of(resource))?)),
            None => Ok(None),
        }
    }

    async fn delete_inner(&self, resource: &SyncedResource) -> Result<DeleteOutcome> {
        let (ar, caps) = self.resolve(resource).await?;
        let api = self.api_for(&ar, &caps, resource.namespace.as_deref());
        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(DeleteOutcome::Absent),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TargetClient for KubeTargetClient {
    async fn normalize(&self, resource: &SyncedResource) -> Result<SyncedResource> {
        let (_, caps) = self.resolve(resource).await?;
        Ok(SyncedResource {
            namespace: self.scoped(&caps, resource.namespace.as_deref()),
            ..resource.clone()
        })
    }

    #[instrument(skip(self, object), fields(object = %object.identity()))]
    async fn apply(&self, object: &ManifestObject) -> Result<()> {
        let identity = object.identity();
        self.apply_inner(object)
            .await
            .map_err(|e| e.on_object(ObjectOperation::Apply, &identity))?;
        debug!("Applied {}", identity);
        Ok(())
    }

    async fn get(&self, resource: &SyncedResource) -> Result<Option<ManifestObject>> {
        self.get_inner(resource)
            .await
            .map_err(|e| e.on_object(ObjectOperation::Get, resource))
    }

    #[instrument(skip(self), fields(object = %resource))]
    async fn delete(&self, resource: &SyncedResource) -> Result<DeleteOutcome> {
        self.delete_inner(resource)
            .await
            .map_err(|e| e.on_object(ObjectOperation::Delete, resource))
    }
}

struct CachedTarget {
    fingerprint: String,
    target: Arc<dyn TargetClient>,
}

/// Target clients kept across reconciles, keyed by owner
///
/// An entry is rebuilt when its fingerprint changes, e.g. after the runtime
/// kubeconfig was rotated, so discovery results survive between cycles.
#[derive(Default)]
pub struct TargetClientCache {
    entries: RwLock<HashMap<String, CachedTarget>>,
}

impl TargetClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_build<F>(&self, key: &str, fingerprint: &str, build: F) -> Arc<dyn TargetClient>
    where
        F: FnOnce() -> Arc<dyn TargetClient>,
    {
        if let Some(cached) = self.entries.read().await.get(key) {
            if cached.fingerprint == fingerprint {
                return cached.target.clone();
            }
        }

        let target = build();
        debug!(key, fingerprint, "Built target client");
        self.entries.write().await.insert(
            key.to_string(),
            CachedTarget {
                fingerprint: fingerprint.to_string(),
                target: target.clone(),
            },
        );
        target
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

/// Delete one object and confirm it is gone
///
/// Deletion is only confirmed once a read reports the object absent, so an
/// object held by finalizers is reported as still present.
pub async fn prune_object(client: &dyn TargetClient, resource: &SyncedResource) -> Result<()> {
    if client.delete(resource).await? == DeleteOutcome::Absent {
        return Ok(());
    }
    match client.get(resource).await? {
        None => Ok(()),
        Some(_) => Err(Error::StillPresent(resource.clone())),
    }
}
