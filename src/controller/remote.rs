//! Runtime cluster clients
//!
//! A Kyma with `sync.strategy: Secret` targets a runtime cluster whose
//! kubeconfig lives in `<kyma>-kubeconfig` (key `config`) next to the Kyma.
//! Clients are cached per Kyma and rebuilt when the kubeconfig changes.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Key holding the kubeconfig inside the secret
pub const KUBECONFIG_KEY: &str = "config";

/// Name of the secret holding a Kyma's runtime kubeconfig
pub fn kubeconfig_secret_name(kyma_name: &str) -> String {
    format!("{kyma_name}-kubeconfig")
}

/// Client for a runtime cluster and the digest of the kubeconfig it came from
#[derive(Clone)]
pub struct RuntimeClient {
    pub client: Client,
    pub kubeconfig_digest: String,
}

/// Cache of runtime cluster clients keyed by `namespace/kyma`
#[derive(Default)]
pub struct RemoteClientCache {
    entries: RwLock<HashMap<String, RuntimeClient>>,
}

impl RemoteClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for the runtime cluster of one Kyma
    ///
    /// A missing secret or an unusable kubeconfig is reported as
    /// [`Error::RemoteCluster`], which is retried.
    pub async fn client_for(
        &self,
        control_plane: &Client,
        namespace: &str,
        kyma_name: &str,
    ) -> Result<RuntimeClient> {
        let secret_name = kubeconfig_secret_name(kyma_name);
        let secrets: Api<Secret> = Api::namespaced(control_plane.clone(), namespace);
        let secret = secrets.get_opt(&secret_name).await?.ok_or_else(|| {
            Error::RemoteCluster(format!(
                "kubeconfig secret {namespace}/{secret_name} not found"
            ))
        })?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_KEY))
            .map(|b| b.0.clone())
            .ok_or_else(|| {
                Error::RemoteCluster(format!(
                    "secret {namespace}/{secret_name} has no {KUBECONFIG_KEY} key"
                ))
            })?;

        let key = format!("{namespace}/{kyma_name}");
        let digest = hex::encode(Sha256::digest(&raw));
        if let Some(cached) = self.entries.read().await.get(&key) {
            if cached.kubeconfig_digest == digest {
                return Ok(cached.clone());
            }
        }

        let runtime = RuntimeClient {
            client: build_client(&raw).await?,
            kubeconfig_digest: digest,
        };
        info!("Connected runtime cluster client for Kyma {}", key);
        self.entries.write().await.insert(key, runtime.clone());
        Ok(runtime)
    }

    /// Drop the cached client of a Kyma
    pub async fn invalidate(&self, namespace: &str, kyma_name: &str) {
        let key = format!("{namespace}/{kyma_name}");
        if self.entries.write().await.remove(&key).is_some() {
            debug!("Dropped runtime cluster client for Kyma {}", key);
        }
    }
}

async fn build_client(raw: &[u8]) -> Result<Client> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::RemoteCluster(format!("kubeconfig is not UTF-8: {e}")))?;
    let kubeconfig = Kubeconfig::from_yaml(text)
        .map_err(|e| Error::RemoteCluster(format!("failed to parse kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::RemoteCluster(format!("failed to load kubeconfig: {e}")))?;
    Client::try_from(config)
        .map_err(|e| Error::RemoteCluster(format!("failed to create client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubeconfig_secret_name() {
        assert_eq!(kubeconfig_secret_name("kyma-sample"), "kyma-sample-kubeconfig");
    }

    #[tokio::test]
    async fn test_invalid_kubeconfig_is_remote_error() {
        let err = build_client(b"not: [valid").await.err().unwrap();
        assert!(matches!(err, Error::RemoteCluster(_)));
        assert!(err.is_retriable());
    }
}
