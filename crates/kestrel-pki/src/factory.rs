//! Cluster certificate generation
//!
//! A cluster needs one CA and, signed by it, an API server certificate, an
//! admin client certificate, a kubeconfig certificate, etcd server and client
//! certificates, and one etcd peer certificate per master. Every role is
//! generated on its own blocking task; the first failure fails the whole set.

use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::try_join_all;
use rand::RngCore;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyUsagePurpose, SanType, SerialNumber,
};
use tracing::debug;

use kestrel_common::api::CertificateProfile;

use crate::error::{PkiError, Result};
use crate::keys::{create_ssh_key_pair, generate_rsa_key, key_from_pem, key_to_pkcs1_pem, KeySize, SshKeyPair};

/// Validity of every generated certificate (30 years)
pub const VALIDITY_YEARS: i64 = 30;

/// Organization granting cluster-admin to client certificates
pub const SYSTEM_MASTERS: &str = "system:masters";

/// A PEM certificate and its PKCS#1 PEM key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCertPair {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Inputs for the derived certificates
#[derive(Debug, Clone)]
pub struct PkiParams {
    /// Extra API server DNS names, e.g. the master FQDN
    pub extra_fqdns: Vec<String>,
    /// API server and etcd IP SANs
    pub extra_ips: Vec<IpAddr>,
    pub cluster_domain: String,
    pub ca: KeyCertPair,
    pub master_count: usize,
    pub key_size: KeySize,
}

/// Everything derived from the CA
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PkiBundle {
    pub apiserver: KeyCertPair,
    pub client: KeyCertPair,
    pub kube_config: KeyCertPair,
    pub etcd_server: KeyCertPair,
    pub etcd_client: KeyCertPair,
    pub etcd_peers: Vec<KeyCertPair>,
}

impl PkiBundle {
    /// Record the bundle and its CA in a certificate profile
    pub fn write_to_profile(&self, ca: &KeyCertPair, profile: &mut CertificateProfile) {
        profile.ca_certificate = ca.certificate_pem.clone();
        profile.ca_private_key = ca.private_key_pem.clone();
        profile.apiserver_certificate = self.apiserver.certificate_pem.clone();
        profile.apiserver_private_key = self.apiserver.private_key_pem.clone();
        profile.client_certificate = self.client.certificate_pem.clone();
        profile.client_private_key = self.client.private_key_pem.clone();
        profile.kube_config_certificate = self.kube_config.certificate_pem.clone();
        profile.kube_config_private_key = self.kube_config.private_key_pem.clone();
        profile.etcd_server_certificate = self.etcd_server.certificate_pem.clone();
        profile.etcd_server_private_key = self.etcd_server.private_key_pem.clone();
        profile.etcd_client_certificate = self.etcd_client.certificate_pem.clone();
        profile.etcd_client_private_key = self.etcd_client.private_key_pem.clone();
        profile.etcd_peer_certificates = self
            .etcd_peers
            .iter()
            .map(|p| p.certificate_pem.clone())
            .collect();
        profile.etcd_peer_private_keys = self
            .etcd_peers
            .iter()
            .map(|p| p.private_key_pem.clone())
            .collect();
    }
}

/// API server DNS names synthesized for in-cluster access
pub fn kubernetes_service_names(cluster_domain: &str) -> Vec<String> {
    vec![
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{}", cluster_domain),
        "kubernetes.kube-system".to_string(),
        "kubernetes.kube-system.svc".to_string(),
        format!("kubernetes.kube-system.svc.{}", cluster_domain),
    ]
}

/// Generates cluster key material
#[async_trait]
pub trait PkiFactory: Send + Sync {
    /// Self-signed CA
    async fn create_ca(&self, common_name: &str) -> Result<KeyCertPair>;

    /// Every derived certificate, signed by `params.ca`
    async fn create_pki(&self, params: PkiParams) -> Result<PkiBundle>;

    /// SSH key pair for node access
    async fn create_ssh_key(&self) -> Result<SshKeyPair>;
}

/// [`PkiFactory`] issuing RSA certificates with SHA-256 signatures
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaPkiFactory {
    key_size: KeySize,
}

impl RsaPkiFactory {
    pub fn new(key_size: KeySize) -> Self {
        Self { key_size }
    }

    pub fn key_size(&self) -> KeySize {
        self.key_size
    }
}

/// Which role a certificate plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    ApiServer,
    Client,
    EtcdServer,
    EtcdClient,
    EtcdPeer,
}

struct CertRequest {
    common_name: &'static str,
    organization: Option<&'static str>,
    role: Role,
    dns_names: Vec<String>,
    ips: Vec<IpAddr>,
}

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // keep the DER INTEGER positive
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn
}

fn base_params(common_name: &str, organization: Option<&str>) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, organization);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let (not_before, not_after) = compute_validity(VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());
    params
}

fn dns_san(name: &str) -> Result<SanType> {
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", name, e))
        })
}

/// Build a self-signed CA
pub fn create_ca_pair(common_name: &str, key_size: KeySize) -> Result<KeyCertPair> {
    let mut params = base_params(common_name, None);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);

    let key = generate_rsa_key(key_size)?;
    let cert = params.self_signed(&key).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
    })?;

    Ok(KeyCertPair {
        certificate_pem: cert.pem(),
        private_key_pem: key_to_pkcs1_pem(&key)?,
    })
}

fn issue(request: &CertRequest, ca: &KeyCertPair, key_size: KeySize) -> Result<KeyCertPair> {
    let mut params = base_params(request.common_name, request.organization);
    params.is_ca = IsCa::NoCa;
    params.extended_key_usages = match request.role {
        Role::ApiServer | Role::EtcdServer => vec![ExtendedKeyUsagePurpose::ServerAuth],
        Role::Client | Role::EtcdClient => vec![ExtendedKeyUsagePurpose::ClientAuth],
        Role::EtcdPeer => vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ],
    };

    let mut sans = request
        .dns_names
        .iter()
        .map(|name| dns_san(name))
        .collect::<Result<Vec<_>>>()?;
    sans.extend(request.ips.iter().copied().map(SanType::IpAddress));
    params.subject_alt_names = sans;

    let key = generate_rsa_key(key_size)?;
    let ca_key = key_from_pem(&ca.private_key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(&ca.certificate_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
    let cert = params.signed_by(&key, &issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!(
            "failed to sign {} certificate: {}",
            request.common_name, e
        ))
    })?;

    Ok(KeyCertPair {
        certificate_pem: cert.pem(),
        private_key_pem: key_to_pkcs1_pem(&key)?,
    })
}

/// Roles generated once per cluster, ahead of the per-master peers
const FIXED_ROLES: usize = 5;

fn requests(params: &PkiParams) -> Vec<CertRequest> {
    let mut apiserver_names = params.extra_fqdns.clone();
    apiserver_names.extend(kubernetes_service_names(&params.cluster_domain));

    let mut out = vec![
        CertRequest {
            common_name: "apiserver",
            organization: None,
            role: Role::ApiServer,
            dns_names: apiserver_names,
            ips: params.extra_ips.clone(),
        },
        CertRequest {
            common_name: "client",
            organization: Some(SYSTEM_MASTERS),
            role: Role::Client,
            dns_names: Vec::new(),
            ips: Vec::new(),
        },
        CertRequest {
            common_name: "client",
            organization: Some(SYSTEM_MASTERS),
            role: Role::Client,
            dns_names: Vec::new(),
            ips: Vec::new(),
        },
        CertRequest {
            common_name: "etcdserver",
            organization: None,
            role: Role::EtcdServer,
            dns_names: Vec::new(),
            ips: params.extra_ips.clone(),
        },
        CertRequest {
            common_name: "etcdclient",
            organization: None,
            role: Role::EtcdClient,
            dns_names: Vec::new(),
            ips: params.extra_ips.clone(),
        },
    ];
    out.extend((0..params.master_count).map(|_| CertRequest {
        common_name: "etcdpeer",
        organization: None,
        role: Role::EtcdPeer,
        dns_names: Vec::new(),
        ips: params.extra_ips.clone(),
    }));
    out
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PkiError::TaskFailed(e.to_string()))?
}

#[async_trait]
impl PkiFactory for RsaPkiFactory {
    async fn create_ca(&self, common_name: &str) -> Result<KeyCertPair> {
        let name = common_name.to_string();
        let key_size = self.key_size;
        run_blocking(move || create_ca_pair(&name, key_size)).await
    }

    async fn create_pki(&self, params: PkiParams) -> Result<PkiBundle> {
        let start = Instant::now();
        // fail fast on an unusable CA before spawning work
        key_from_pem(&params.ca.private_key_pem)?;

        let key_size = params.key_size;
        let tasks = requests(&params).into_iter().map(|request| {
            let ca = params.ca.clone();
            run_blocking(move || issue(&request, &ca, key_size))
        });
        let mut pairs = try_join_all(tasks).await?;
        if pairs.len() < FIXED_ROLES {
            return Err(PkiError::TaskFailed("missing certificate result".to_string()));
        }
        let etcd_peers = pairs.split_off(FIXED_ROLES);
        let [apiserver, client, kube_config, etcd_server, etcd_client]: [KeyCertPair; FIXED_ROLES] =
            pairs
                .try_into()
                .map_err(|_| PkiError::TaskFailed("unexpected certificate results".to_string()))?;
        let bundle = PkiBundle {
            apiserver,
            client,
            kube_config,
            etcd_server,
            etcd_client,
            etcd_peers,
        };

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            peers = bundle.etcd_peers.len(),
            "PKI asset creation finished"
        );
        Ok(bundle)
    }

    async fn create_ssh_key(&self) -> Result<SshKeyPair> {
        let key_size = self.key_size;
        run_blocking(move || create_ssh_key_pair(key_size)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{inspect, verify_signed_by};

    fn factory() -> RsaPkiFactory {
        RsaPkiFactory::new(KeySize::Weak)
    }

    async fn bundle(extra_fqdns: Vec<String>, master_count: usize) -> (KeyCertPair, PkiBundle) {
        let factory = factory();
        let ca = factory.create_ca("ca").await.expect("CA");
        let bundle = factory
            .create_pki(PkiParams {
                extra_fqdns,
                extra_ips: vec!["10.240.255.5".parse().expect("ip")],
                cluster_domain: "cluster.local".to_string(),
                ca: ca.clone(),
                master_count,
                key_size: KeySize::Weak,
            })
            .await
            .expect("PKI");
        (ca, bundle)
    }

    #[tokio::test]
    async fn apiserver_cert_carries_every_service_name() {
        let (ca, bundle) = bundle(vec!["api.example.com".to_string()], 1).await;
        let details = verify_signed_by(&bundle.apiserver.certificate_pem, &ca.certificate_pem)
            .expect("signed by CA");

        for name in [
            "api.example.com",
            "kubernetes",
            "kubernetes.default",
            "kubernetes.default.svc",
            "kubernetes.default.svc.cluster.local",
            "kubernetes.kube-system",
            "kubernetes.kube-system.svc",
            "kubernetes.kube-system.svc.cluster.local",
        ] {
            assert!(
                details.dns_names.iter().any(|n| n == name),
                "missing SAN {}",
                name
            );
        }
        assert_eq!(details.dns_names.len(), 8);
        assert!(details.ip_addresses.contains(&"10.240.255.5".parse().expect("ip")));
    }

    #[tokio::test]
    async fn story_every_certificate_verifies_against_its_ca() {
        // Chapter 1: a three-master cluster gets one peer cert per master
        let (ca, bundle) = bundle(Vec::new(), 3).await;
        assert_eq!(bundle.etcd_peers.len(), 3);

        // Chapter 2: each role carries exactly its advertised usages
        let expectations = [
            (&bundle.apiserver, true, false),
            (&bundle.client, false, true),
            (&bundle.kube_config, false, true),
            (&bundle.etcd_server, true, false),
            (&bundle.etcd_client, false, true),
        ];
        for (pair, server, client) in expectations {
            let details = verify_signed_by(&pair.certificate_pem, &ca.certificate_pem)
                .expect("signed by CA");
            assert_eq!(details.server_auth, server, "{}", details.common_name);
            assert_eq!(details.client_auth, client, "{}", details.common_name);
            assert!(!details.is_ca);
        }
        for peer in &bundle.etcd_peers {
            let details = verify_signed_by(&peer.certificate_pem, &ca.certificate_pem)
                .expect("peer signed by CA");
            assert!(details.server_auth && details.client_auth);
            assert_eq!(details.common_name, "etcdpeer");
        }

        // Chapter 3: admin client certs belong to system:masters
        let client = inspect(&bundle.client.certificate_pem).expect("parses");
        assert_eq!(client.organizations, vec![SYSTEM_MASTERS.to_string()]);

        // Chapter 4: a different CA does not verify them
        let other = factory().create_ca("ca").await.expect("other CA");
        assert!(verify_signed_by(&bundle.apiserver.certificate_pem, &other.certificate_pem).is_err());
    }

    #[tokio::test]
    async fn ca_is_self_signed_for_thirty_years() {
        let ca = factory().create_ca("ca").await.expect("CA");
        let details = verify_signed_by(&ca.certificate_pem, &ca.certificate_pem).expect("self-signed");
        assert!(details.is_ca);
        let years = (details.not_after - details.not_before) / (365 * 24 * 3600);
        assert_eq!(years, VALIDITY_YEARS);
        assert!(ca.private_key_pem.contains("BEGIN RSA PRIVATE KEY"));
    }

    #[tokio::test]
    async fn unusable_ca_fails_the_whole_set() {
        let err = factory()
            .create_pki(PkiParams {
                extra_fqdns: Vec::new(),
                extra_ips: Vec::new(),
                cluster_domain: "cluster.local".to_string(),
                ca: KeyCertPair {
                    certificate_pem: "garbage".to_string(),
                    private_key_pem: "garbage".to_string(),
                },
                master_count: 1,
                key_size: KeySize::Weak,
            })
            .await
            .expect_err("bad CA");
        assert!(matches!(err, PkiError::ParseError(_)));
    }

    #[tokio::test]
    async fn bundle_fills_a_complete_profile() {
        let (ca, bundle) = bundle(Vec::new(), 3).await;
        let mut profile = CertificateProfile::default();
        bundle.write_to_profile(&ca, &mut profile);
        assert!(profile.is_complete(3));
        assert!(!profile.is_complete(5));
    }

    #[test]
    fn serials_are_positive_and_random() {
        let a = random_serial();
        let b = random_serial();
        assert_ne!(a, b);
        assert!(a.to_bytes()[0] < 0x80);
    }
}
