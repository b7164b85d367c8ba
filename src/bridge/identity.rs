//! Webhook TLS identity provisioning
//!
//! Handles the control-plane CA and the per-Kyma leaf certificate that the
//! remote webhook uses to reach the control plane. The leaf secret is named
//! `<kyma>-webhook-tls` and records the address it was issued for.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

/// Annotation recording the address a leaf certificate is bound to
pub const WEBHOOK_ADDRESS_ANNOTATION: &str = "operator.kyma-project.io/webhook-address";

const CA_VALIDITY_DAYS: i64 = 3650;

/// Name of the leaf secret for an owner
pub fn webhook_tls_secret_name(owner: &str) -> String {
    format!("{owner}-webhook-tls")
}

/// Name of the CA secret for a given prefix
pub fn ca_secret_name(prefix: &str) -> String {
    format!("{prefix}-webhook-ca")
}

/// Why a leaf certificate has to be (re)issued
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueReason {
    Missing,
    AddressChanged { previous: Option<String> },
    /// The leaf was signed by a CA other than the current one
    CaChanged,
    Unparsable(String),
    ExpiringSoon { remaining_secs: i64 },
}

/// Outcome of inspecting an existing leaf secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueDecision {
    Keep,
    Issue(IssueReason),
}

/// Decide whether the leaf secret for `address` can be kept
///
/// `ca_pem` is the current CA certificate; a leaf whose stored `ca.crt`
/// differs is reissued. `now` and `threshold` are unix seconds; a
/// certificate expiring within `threshold` of `now` is rotated.
pub fn issue_decision(
    existing: Option<&Secret>,
    address: &str,
    ca_pem: &str,
    now: i64,
    threshold: i64,
) -> IssueDecision {
    let Some(secret) = existing else {
        return IssueDecision::Issue(IssueReason::Missing);
    };

    let bound = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(WEBHOOK_ADDRESS_ANNOTATION));
    if bound.map(String::as_str) != Some(address) {
        return IssueDecision::Issue(IssueReason::AddressChanged {
            previous: bound.cloned(),
        });
    }

    if secret_value(secret, CA_CERT_KEY).as_deref() != Some(ca_pem.as_bytes()) {
        return IssueDecision::Issue(IssueReason::CaChanged);
    }

    let pem = match secret_value(secret, TLS_CERT_KEY) {
        Some(pem) => pem,
        None => return IssueDecision::Issue(IssueReason::Unparsable("no tls.crt".to_string())),
    };
    match not_after(&pem) {
        Ok(expiry) if expiry - now > threshold => IssueDecision::Keep,
        Ok(expiry) => IssueDecision::Issue(IssueReason::ExpiringSoon {
            remaining_secs: expiry - now,
        }),
        Err(e) => IssueDecision::Issue(IssueReason::Unparsable(e)),
    }
}

/// Expiry of a PEM certificate as unix seconds
pub fn not_after(pem: &[u8]) -> std::result::Result<i64, String> {
    let (_, pem) =
        x509_parser::pem::parse_x509_pem(pem).map_err(|e| format!("invalid PEM: {e}"))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| format!("invalid certificate: {e}"))?;
    Ok(cert.validity().not_after.timestamp())
}

fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.clone())
}

/// CA stored in a secret, `None` when the key pair is incomplete
fn stored_ca(secret: &Secret) -> Result<Option<CertificateAuthority>> {
    let (Some(cert), Some(key)) = (
        secret_value(secret, TLS_CERT_KEY),
        secret_value(secret, TLS_KEY_KEY),
    ) else {
        return Ok(None);
    };
    let cert =
        String::from_utf8(cert).map_err(|e| Error::Certificate(format!("CA certificate: {e}")))?;
    let key = String::from_utf8(key).map_err(|e| Error::Certificate(format!("CA key: {e}")))?;
    CertificateAuthority::from_pem(&cert, &key).map(Some)
}

fn ca_data(ca: &CertificateAuthority) -> BTreeMap<String, Vec<u8>> {
    BTreeMap::from([
        (TLS_CERT_KEY.to_string(), ca.cert_pem().as_bytes().to_vec()),
        (TLS_KEY_KEY.to_string(), ca.key_pem().into_bytes()),
    ])
}

fn cert_error(context: &str) -> impl Fn(rcgen::Error) -> Error + '_ {
    move |e| Error::Certificate(format!("{context}: {e}"))
}

/// Key material of an issued leaf certificate
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

/// Signing CA held in memory
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let key = KeyPair::generate().map_err(cert_error("failed to generate CA key"))?;
        let cert = params
            .self_signed(&key)
            .map_err(cert_error("failed to create CA certificate"))?;
        let pem = cert.pem();
        Ok(Self { cert, key, pem })
    }

    /// Load a CA previously stored as PEM
    ///
    /// The returned PEM is the stored one, so trust bundles stay stable.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem).map_err(cert_error("failed to parse CA key"))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(cert_error("failed to parse CA certificate"))?;
        let cert = params
            .self_signed(&key)
            .map_err(cert_error("failed to rebuild CA certificate"))?;
        Ok(Self {
            cert,
            key,
            pem: cert_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.pem
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Issue a server certificate for the host part of `address`
    pub fn issue(&self, address: &str, validity_days: i64) -> Result<IssuedCertificate> {
        let host = host_of(address);
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san_for(host)?];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(validity_days);

        let key = KeyPair::generate().map_err(cert_error("failed to generate key"))?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(cert_error("failed to sign certificate"))?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca_pem: self.pem.clone(),
        })
    }
}

/// Host part of `host:port`, without IPv6 brackets
pub fn host_of(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => address,
    }
}

fn san_for(host: &str) -> Result<SanType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name: Ia5String = host
        .try_into()
        .map_err(|e: rcgen::Error| Error::Certificate(format!("invalid DNS name {host}: {e}")))?;
    Ok(SanType::DnsName(name))
}

/// Identity handed to the webhook installer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookIdentity {
    pub secret_name: String,
    pub ca_bundle: String,
}

/// Where and how identities are stored
#[derive(Clone, Debug)]
pub struct IdentitySettings {
    /// Namespace holding the CA and leaf secrets
    pub namespace: String,
    pub ca_prefix: String,
    pub field_manager: String,
    /// Rotate leaf certificates with less remaining validity than this
    pub rotation_threshold_days: i64,
    pub leaf_validity_days: i64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            namespace: "kcp-system".to_string(),
            ca_prefix: "lifecycle-operator".to_string(),
            field_manager: "lifecycle-operator".to_string(),
            rotation_threshold_days: 30,
            leaf_validity_days: 90,
        }
    }
}

/// Issues, rotates and deletes webhook identities
pub struct IdentityProvisioner {
    client: Client,
    settings: IdentitySettings,
}

impl IdentityProvisioner {
    pub fn new(client: Client, settings: IdentitySettings) -> Self {
        Self { client, settings }
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn tls_secret(
        &self,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.settings.namespace.clone()),
                annotations,
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        }
    }

    async fn write_secret(
        &self,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        let secret = self.tls_secret(name, data, annotations);
        self.secrets()
            .patch(
                name,
                &PatchParams::apply(&self.settings.field_manager).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        Ok(())
    }

    /// Load the CA, creating it on first use
    ///
    /// The CA secret is created rather than applied, so concurrent first
    /// provisions agree on a single CA: the loser of the create reads back
    /// the winner's secret.
    pub async fn ensure_ca(&self) -> Result<CertificateAuthority> {
        let name = ca_secret_name(&self.settings.ca_prefix);
        let existing = self.secrets().get_opt(&name).await?;
        if let Some(secret) = existing {
            if let Some(ca) = stored_ca(&secret)? {
                return Ok(ca);
            }
            warn!("CA secret {} holds no key pair, replacing it", name);
            let ca = self.generate_ca()?;
            self.write_secret(&name, ca_data(&ca), None).await?;
            return Ok(ca);
        }

        let ca = self.generate_ca()?;
        let secret = self.tls_secret(&name, ca_data(&ca), None);
        match self.secrets().create(&PostParams::default(), &secret).await {
            Ok(_) => {
                info!("Created webhook CA secret {}", name);
                Ok(ca)
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!("CA secret {} was created concurrently, loading it", name);
                let secret = self.secrets().get(&name).await?;
                stored_ca(&secret)?.ok_or_else(|| {
                    Error::Certificate(format!("CA secret {name} holds no key pair"))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn generate_ca(&self) -> Result<CertificateAuthority> {
        CertificateAuthority::generate(&ca_secret_name(&self.settings.ca_prefix))
    }

    /// Make sure `owner` has a valid identity bound to `address`
    ///
    /// Calling this again with an unchanged address is a no-op.
    #[instrument(skip(self))]
    pub async fn ensure(&self, owner: &str, address: &str) -> Result<WebhookIdentity> {
        let secret_name = webhook_tls_secret_name(owner);
        let ca = self.ensure_ca().await?;
        let existing = self.secrets().get_opt(&secret_name).await?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let threshold = self.settings.rotation_threshold_days * 24 * 3600;

        match issue_decision(existing.as_ref(), address, ca.cert_pem(), now, threshold) {
            IssueDecision::Keep => {
                debug!("Webhook identity {} is current", secret_name);
                Ok(WebhookIdentity {
                    secret_name,
                    ca_bundle: ca.cert_pem().to_string(),
                })
            }
            IssueDecision::Issue(reason) => {
                info!("Issuing webhook identity {} ({:?})", secret_name, reason);
                let issued = ca.issue(address, self.settings.leaf_validity_days)?;

                let mut data = BTreeMap::new();
                data.insert(TLS_CERT_KEY.to_string(), issued.cert_pem.into_bytes());
                data.insert(TLS_KEY_KEY.to_string(), issued.key_pem.into_bytes());
                data.insert(CA_CERT_KEY.to_string(), issued.ca_pem.clone().into_bytes());
                let annotations = BTreeMap::from([(
                    WEBHOOK_ADDRESS_ANNOTATION.to_string(),
                    address.to_string(),
                )]);
                self.write_secret(&secret_name, data, Some(annotations))
                    .await?;

                Ok(WebhookIdentity {
                    secret_name,
                    ca_bundle: issued.ca_pem,
                })
            }
        }
    }

    /// Remove the identity of `owner`; absent secrets are fine
    pub async fn delete(&self, owner: &str) -> Result<()> {
        let secret_name = webhook_tls_secret_name(owner);
        match self
            .secrets()
            .delete(&secret_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Deleted webhook identity {}", secret_name);
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_secret(address: &str, cert_pem: &str, ca_pem: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(webhook_tls_secret_name("kyma-sample")),
                annotations: Some(BTreeMap::from([(
                    WEBHOOK_ADDRESS_ANNOTATION.to_string(),
                    address.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (
                    TLS_CERT_KEY.to_string(),
                    ByteString(cert_pem.as_bytes().to_vec()),
                ),
                (CA_CERT_KEY.to_string(), ByteString(ca_pem.as_bytes().to_vec())),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn test_secret_names_are_deterministic() {
        assert_eq!(webhook_tls_secret_name("kyma-sample"), "kyma-sample-webhook-tls");
        assert_eq!(ca_secret_name("lifecycle-operator"), "lifecycle-operator-webhook-ca");
    }

    #[test]
    fn test_host_of_address() {
        assert_eq!(host_of("listener.example.com:443"), "listener.example.com");
        assert_eq!(host_of("[::1]:9443"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[test]
    fn test_issue_decision_lifecycle() {
        let address = "listener.example.com:443";
        let ca = CertificateAuthority::generate("test-ca").unwrap();
        let issued = ca.issue(address, 90).unwrap();
        let ca_pem = ca.cert_pem();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let thirty_days = 30 * 24 * 3600;

        assert_eq!(
            issue_decision(None, address, ca_pem, now, thirty_days),
            IssueDecision::Issue(IssueReason::Missing)
        );

        let secret = leaf_secret(address, &issued.cert_pem, &issued.ca_pem);
        assert_eq!(
            issue_decision(Some(&secret), address, ca_pem, now, thirty_days),
            IssueDecision::Keep
        );

        assert!(matches!(
            issue_decision(Some(&secret), "other.example.com:443", ca_pem, now, thirty_days),
            IssueDecision::Issue(IssueReason::AddressChanged { .. })
        ));

        let later = now + 70 * 24 * 3600;
        assert!(matches!(
            issue_decision(Some(&secret), address, ca_pem, later, thirty_days),
            IssueDecision::Issue(IssueReason::ExpiringSoon { .. })
        ));

        let garbage = leaf_secret(address, "not a certificate", ca_pem);
        assert!(matches!(
            issue_decision(Some(&garbage), address, ca_pem, now, thirty_days),
            IssueDecision::Issue(IssueReason::Unparsable(_))
        ));
    }

    #[test]
    fn test_leaf_from_replaced_ca_is_reissued() {
        let address = "listener.example.com:443";
        let losing = CertificateAuthority::generate("test-ca").unwrap();
        let current = CertificateAuthority::generate("test-ca").unwrap();
        let issued = losing.issue(address, 90).unwrap();
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let secret = leaf_secret(address, &issued.cert_pem, &issued.ca_pem);
        assert_eq!(
            issue_decision(Some(&secret), address, current.cert_pem(), now, 0),
            IssueDecision::Issue(IssueReason::CaChanged)
        );
        assert_eq!(
            issue_decision(Some(&secret), address, losing.cert_pem(), now, 0),
            IssueDecision::Keep
        );

        let no_bundle = leaf_secret(address, &issued.cert_pem, "");
        assert_eq!(
            issue_decision(Some(&no_bundle), address, losing.cert_pem(), now, 0),
            IssueDecision::Issue(IssueReason::CaChanged)
        );
    }

    #[test]
    fn test_stored_ca_requires_key_pair() {
        let ca = CertificateAuthority::generate("test-ca").unwrap();
        let mut secret = Secret {
            data: Some(
                ca_data(&ca)
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        };
        let loaded = stored_ca(&secret).unwrap().unwrap();
        assert_eq!(loaded.cert_pem(), ca.cert_pem());

        secret.data.as_mut().unwrap().remove(TLS_KEY_KEY);
        assert!(stored_ca(&secret).unwrap().is_none());
    }

    #[test]
    fn test_ca_reload_keeps_pem_and_signs() {
        let ca = CertificateAuthority::generate("test-ca").unwrap();
        let reloaded = CertificateAuthority::from_pem(ca.cert_pem(), &ca.key_pem()).unwrap();
        assert_eq!(reloaded.cert_pem(), ca.cert_pem());

        let issued = reloaded.issue("[::1]:9443", 90).unwrap();
        assert_eq!(issued.ca_pem, ca.cert_pem());
        assert!(not_after(issued.cert_pem.as_bytes()).is_ok());
    }
}
