//! Operator configuration
//!
//! Flags for the `run` subcommand, each with an environment fallback, and the
//! conversions into the settings structs the controller and bridge consume.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::bridge::{GatewayConfig, IdentitySettings};
use crate::controller::{ConflictRetry, EngineSettings, ReconcilerSettings};
use crate::error::{Error, Result};
use crate::telemetry::TelemetryConfig;

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Namespace holding ModuleTemplates and webhook secrets
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kcp-system")]
    pub namespace: String,

    /// Deadline for one sync cycle, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    pub reconcile_timeout_secs: u64,

    /// Requeue interval once a Kyma is Ready
    #[arg(long, env = "REQUEUE_READY_SECS", default_value_t = 300)]
    pub requeue_ready_secs: u64,

    /// Requeue interval while modules are still converging
    #[arg(long, env = "REQUEUE_BUSY_SECS", default_value_t = 10)]
    pub requeue_busy_secs: u64,

    /// Upper bound on concurrent object operations per cycle
    #[arg(long, env = "MAX_CONCURRENT_APPLIES", default_value_t = 16)]
    pub max_concurrent_applies: usize,

    /// Read buffer for manifest decoding, in bytes
    #[arg(long, env = "MANIFEST_BUFFER_SIZE", default_value_t = 65536)]
    pub manifest_buffer_size: usize,

    /// Field manager used for server-side apply
    #[arg(long, env = "FIELD_MANAGER", default_value = "lifecycle-operator")]
    pub field_manager: String,

    /// Provision webhook identities for runtime clusters
    #[arg(long, env = "ENABLE_WEBHOOK_BRIDGE")]
    pub enable_webhook_bridge: bool,

    #[arg(long, env = "ISTIO_GATEWAY_NAME", default_value = "klm-watcher")]
    pub istio_gateway_name: String,

    #[arg(long, env = "ISTIO_GATEWAY_NAMESPACE", default_value = "istio-system")]
    pub istio_gateway_namespace: String,

    /// Port used instead of the gateway's own (local setups)
    #[arg(long, env = "LOCAL_GATEWAY_PORT_OVERRIDE")]
    pub local_gateway_port_override: Option<String>,

    /// Rotate webhook certificates with fewer days left than this
    #[arg(long, env = "CERT_ROTATION_THRESHOLD_DAYS", default_value_t = 30)]
    pub cert_rotation_threshold_days: i64,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// Address serving `/healthz` and `/metrics`
    #[arg(long, env = "HTTP_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub http_bind_address: SocketAddr,

    /// Do not start the HTTP server
    #[arg(long, env = "DISABLE_HTTP_SERVER")]
    pub disable_http_server: bool,
}

impl RunArgs {
    /// Reject values the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "--reconcile-timeout-secs must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_applies == 0 {
            return Err(Error::ConfigError(
                "--max-concurrent-applies must be greater than 0".to_string(),
            ));
        }
        if self.manifest_buffer_size < 4096 {
            return Err(Error::ConfigError(
                "--manifest-buffer-size must be at least 4096 bytes".to_string(),
            ));
        }
        if self.cert_rotation_threshold_days < 0 {
            return Err(Error::ConfigError(
                "--cert-rotation-threshold-days must not be negative".to_string(),
            ));
        }
        if let Some(port) = &self.local_gateway_port_override {
            if port.parse::<u16>().is_err() {
                return Err(Error::ConfigError(format!(
                    "--local-gateway-port-override {port} is not a valid port"
                )));
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            concurrency: self.max_concurrent_applies,
            manifest_buffer_size: self.manifest_buffer_size,
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            namespace: self.namespace.clone(),
            field_manager: self.field_manager.clone(),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            requeue_ready: Duration::from_secs(self.requeue_ready_secs),
            requeue_busy: Duration::from_secs(self.requeue_busy_secs),
            engine: self.engine_settings(),
            conflict_retry: ConflictRetry::default(),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            name: self.istio_gateway_name.clone(),
            namespace: self.istio_gateway_namespace.clone(),
            local_port_override: self.local_gateway_port_override.clone(),
        }
    }

    pub fn identity_settings(&self) -> IdentitySettings {
        IdentitySettings {
            namespace: self.namespace.clone(),
            field_manager: self.field_manager.clone(),
            rotation_threshold_days: self.cert_rotation_threshold_days,
            ..IdentitySettings::default()
        }
    }

    /// Where to serve health and metrics, `None` when disabled
    pub fn http_address(&self) -> Option<SocketAddr> {
        (!self.disable_http_server).then_some(self.http_bind_address)
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            json: self.log_json,
            ..TelemetryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunArgs {
        let argv = std::iter::once("run").chain(args.iter().copied());
        RunArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.reconcile_timeout_secs, 60);
        assert_eq!(args.max_concurrent_applies, 16);
        assert_eq!(args.manifest_buffer_size, 65536);
        assert!(!args.enable_webhook_bridge);
        assert_eq!(
            args.http_address(),
            Some("0.0.0.0:8080".parse::<SocketAddr>().unwrap())
        );
        assert!(args.validate().is_ok());

        let settings = args.reconciler_settings();
        assert_eq!(settings.requeue_ready, Duration::from_secs(300));
        assert_eq!(settings.requeue_busy, Duration::from_secs(10));
        assert_eq!(settings.engine.concurrency, 16);
    }

    #[test]
    fn test_gateway_and_identity_settings() {
        let args = parse(&[
            "--istio-gateway-name",
            "kcp-gateway",
            "--local-gateway-port-override",
            "9443",
            "--cert-rotation-threshold-days",
            "14",
        ]);
        assert!(args.validate().is_ok());

        let gateway = args.gateway_config();
        assert_eq!(gateway.name, "kcp-gateway");
        assert_eq!(gateway.namespace, "istio-system");
        assert_eq!(gateway.local_port_override.as_deref(), Some("9443"));

        let identity = args.identity_settings();
        assert_eq!(identity.rotation_threshold_days, 14);
        assert_eq!(identity.leaf_validity_days, 90);
    }

    #[test]
    fn test_http_server_can_be_moved_or_disabled() {
        let args = parse(&["--http-bind-address", "127.0.0.1:9090"]);
        assert_eq!(args.http_address().map(|a| a.port()), Some(9090));

        let args = parse(&["--disable-http-server"]);
        assert_eq!(args.http_address(), None);
        assert!(RunArgs::try_parse_from(["run", "--http-bind-address", "nowhere"]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--max-concurrent-applies", "0"]).validate().is_err());
        assert!(parse(&["--reconcile-timeout-secs", "0"]).validate().is_err());
        assert!(parse(&["--manifest-buffer-size", "10"]).validate().is_err());
        assert!(parse(&["--local-gateway-port-override", "https"])
            .validate()
            .is_err());
    }
}
