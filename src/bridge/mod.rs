//! Cross-cluster bridge
//!
//! Resolves the control-plane address reachable from runtime clusters and
//! provisions the TLS identity the remote webhook uses to call back. Installing
//! the webhook configuration itself is left to a [`WebhookInstaller`].

pub mod gateway;
pub mod identity;

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tracing::{info, instrument};

use crate::error::Result;

pub use gateway::{resolve_gateway_address, GatewayConfig, GatewaySpec};
pub use identity::{webhook_tls_secret_name, IdentityProvisioner, IdentitySettings};

/// Everything a webhook installer needs to configure a runtime cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookEndpoint {
    /// `host:port` of the control-plane gateway
    pub address: String,
    /// Secret holding `tls.crt`, `tls.key` and `ca.crt`
    pub secret_name: String,
    /// PEM CA bundle the runtime side should trust
    pub ca_bundle: String,
}

/// Applies webhook configuration onto a runtime cluster
#[async_trait]
pub trait WebhookInstaller: Send + Sync {
    async fn install(&self, kyma: &str, endpoint: &WebhookEndpoint) -> Result<()>;
    async fn uninstall(&self, kyma: &str) -> Result<()>;
}

/// Gateway resolution plus identity provisioning for one control plane
pub struct CrossClusterBridge {
    client: Client,
    gateway: GatewayConfig,
    identities: IdentityProvisioner,
    installer: Option<Arc<dyn WebhookInstaller>>,
}

impl CrossClusterBridge {
    pub fn new(
        client: Client,
        gateway: GatewayConfig,
        identity: IdentitySettings,
        installer: Option<Arc<dyn WebhookInstaller>>,
    ) -> Self {
        Self {
            identities: IdentityProvisioner::new(client.clone(), identity),
            client,
            gateway,
            installer,
        }
    }

    /// Resolve the address, ensure the identity and hand both to the installer
    #[instrument(skip(self))]
    pub async fn provision(&self, kyma: &str) -> Result<WebhookEndpoint> {
        let address = gateway::resolve_address(&self.client, &self.gateway).await?;
        let identity = self.identities.ensure(kyma, &address).await?;
        let endpoint = WebhookEndpoint {
            address,
            secret_name: identity.secret_name,
            ca_bundle: identity.ca_bundle,
        };
        if let Some(installer) = &self.installer {
            installer.install(kyma, &endpoint).await?;
        }
        Ok(endpoint)
    }

    /// Remove the webhook and its identity
    #[instrument(skip(self))]
    pub async fn teardown(&self, kyma: &str) -> Result<()> {
        if let Some(installer) = &self.installer {
            installer.uninstall(kyma).await?;
        }
        self.identities.delete(kyma).await?;
        info!("Removed webhook bridge for Kyma {}", kyma);
        Ok(())
    }
}
