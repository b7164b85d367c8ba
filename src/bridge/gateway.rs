//! Gateway address resolution
//!
//! The control plane is reachable from runtime clusters through an Istio
//! `Gateway`. Its single server and single host define the address handed to
//! the remote webhook.

use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// The parts of `networking.istio.io/v1beta1` `Gateway.spec` that are read
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GatewaySpec {
    #[serde(default)]
    pub servers: Vec<GatewayServer>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GatewayServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<GatewayPort>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GatewayPort {
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Which gateway to read and how to override its port
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub name: String,
    pub namespace: String,
    /// Replaces the discovered port, used for local topologies
    pub local_port_override: Option<String>,
}

/// Join host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Compute `host:port` from a gateway spec
///
/// The gateway must declare exactly one server with exactly one host; any
/// other shape is a configuration error and no partial address is returned.
pub fn resolve_gateway_address(config: &GatewayConfig, spec: &GatewaySpec) -> Result<String> {
    let misconfigured = || Error::GatewayMisconfigured {
        name: config.name.clone(),
        namespace: config.namespace.clone(),
        servers: spec.servers.len(),
        hosts: spec.servers.first().map_or(0, |s| s.hosts.len()),
    };

    let [server] = spec.servers.as_slice() else {
        return Err(misconfigured());
    };
    let [host] = server.hosts.as_slice() else {
        return Err(misconfigured());
    };

    if let Some(port) = config
        .local_port_override
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        return Ok(join_host_port(host, port));
    }

    let port = server.port.as_ref().ok_or_else(|| {
        Error::ConfigError(format!(
            "gateway {}/{} server has no port",
            config.namespace, config.name
        ))
    })?;
    Ok(join_host_port(host, &port.number.to_string()))
}

fn gateway_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("networking.istio.io", "v1beta1", "Gateway");
    ApiResource::from_gvk_with_plural(&gvk, "gateways")
}

/// Read the configured gateway from the control-plane cluster
pub async fn fetch_gateway(client: &Client, config: &GatewayConfig) -> Result<GatewaySpec> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &config.namespace, &gateway_resource());
    let gateway = api.get(&config.name).await?;
    let spec = gateway.data.get("spec").cloned().unwrap_or_default();
    if spec.is_null() {
        return Ok(GatewaySpec::default());
    }
    Ok(serde_json::from_value(spec)?)
}

/// Fetch the gateway and resolve its externally reachable address
#[instrument(skip(client), fields(gateway = %config.name, namespace = %config.namespace))]
pub async fn resolve_address(client: &Client, config: &GatewayConfig) -> Result<String> {
    let spec = fetch_gateway(client, config).await?;
    let address = resolve_gateway_address(config, &spec)?;
    debug!("Resolved gateway address {}", address);
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(port_override: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            name: "kyma-gateway".to_string(),
            namespace: "istio-system".to_string(),
            local_port_override: port_override.map(String::from),
        }
    }

    fn spec(value: serde_json::Value) -> GatewaySpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_single_server_single_host() {
        let gw = spec(json!({"servers": [
            {"port": {"number": 443, "name": "https", "protocol": "HTTPS"}, "hosts": ["listener.kcp.example.com"]}
        ]}));
        assert_eq!(
            resolve_gateway_address(&config(None), &gw).unwrap(),
            "listener.kcp.example.com:443"
        );
    }

    #[test]
    fn test_local_port_override_wins() {
        let gw = spec(json!({"servers": [
            {"port": {"number": 443}, "hosts": ["localhost"]}
        ]}));
        assert_eq!(
            resolve_gateway_address(&config(Some("9443")), &gw).unwrap(),
            "localhost:9443"
        );
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        assert_eq!(join_host_port("::1", "443"), "[::1]:443");
        assert_eq!(join_host_port("10.0.0.1", "443"), "10.0.0.1:443");
    }

    #[test]
    fn test_wrong_shapes_are_configuration_errors() {
        let shapes = [
            json!({"servers": []}),
            json!({"servers": [
                {"port": {"number": 443}, "hosts": ["a.example.com"]},
                {"port": {"number": 80}, "hosts": ["b.example.com"]}
            ]}),
            json!({"servers": [{"port": {"number": 443}, "hosts": []}]}),
            json!({"servers": [{"port": {"number": 443}, "hosts": ["a.example.com", "b.example.com"]}]}),
        ];
        for shape in shapes {
            let err = resolve_gateway_address(&config(None), &spec(shape)).unwrap_err();
            assert!(matches!(err, Error::GatewayMisconfigured { .. }));
            assert!(!err.is_retriable());
        }
    }
}
