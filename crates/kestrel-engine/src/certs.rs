//! Ensuring the cluster PKI in the model
//!
//! Defaulting decides what is missing; this module asks the PKI factory for
//! it and records the result in the model's certificate profile.

use std::net::{IpAddr, Ipv4Addr};

use tracing::info;

use kestrel_common::api::{
    CertificateAction, CertificateProfile, MasterProfile, Properties,
    DEFAULT_INTERNAL_LB_STATIC_IP_OFFSET,
};
use kestrel_common::{Error, Result};
use kestrel_pki::{KeyCertPair, PkiParams};

use crate::context::Context;

/// Common name of the cluster CA
pub const CA_COMMON_NAME: &str = "ca";

fn offset(ip: Ipv4Addr, by: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(by))
}

/// Static IPs of every master, in index order
pub fn master_ips(master: &MasterProfile) -> Vec<Ipv4Addr> {
    let first = master.first_master_ip();
    (0..master.count.max(1) as u32).map(|i| offset(first, i)).collect()
}

/// Frontend IP of the internal load balancer in front of the masters
pub fn internal_lb_ip(master: &MasterProfile) -> Ipv4Addr {
    offset(
        master.first_master_ip(),
        u32::from(DEFAULT_INTERNAL_LB_STATIC_IP_OFFSET),
    )
}

/// First host address of a CIDR, the `kubernetes` service IP
pub fn first_service_ip(cidr: &str) -> Option<Ipv4Addr> {
    let (network, bits) = cidr.split_once('/')?;
    let network: Ipv4Addr = network.parse().ok()?;
    let bits: u32 = bits.parse().ok().filter(|b| *b <= 32)?;
    let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
    Some(Ipv4Addr::from((u32::from(network) & mask) + 1))
}

/// Factory inputs for the model's control plane
pub fn pki_params(props: &Properties, ca: KeyCertPair, ctx: &Context) -> Result<PkiParams> {
    let master = props
        .master_profile
        .as_ref()
        .ok_or_else(|| Error::model_invalid("properties.masterProfile", "required to create certificates"))?;

    let mut extra_fqdns = Vec::new();
    if !master.fqdn.is_empty() {
        extra_fqdns.push(master.fqdn.clone());
    }
    extra_fqdns.extend(
        master
            .subject_alt_names
            .iter()
            .filter(|n| !n.is_empty())
            .cloned(),
    );

    let mut extra_ips: Vec<IpAddr> = master_ips(master).into_iter().map(IpAddr::V4).collect();
    if master.count > 1 {
        extra_ips.push(IpAddr::V4(internal_lb_ip(master)));
    }
    if let Some(service_ip) = first_service_ip(&props.service_cidr()) {
        extra_ips.push(IpAddr::V4(service_ip));
    }

    Ok(PkiParams {
        extra_fqdns,
        extra_ips,
        cluster_domain: props.cluster_domain(),
        ca,
        master_count: props.master_count(),
        key_size: ctx.key_size,
    })
}

/// Create whatever certificates `action` calls for; returns whether any were made
pub async fn ensure_certificates(
    ctx: &Context,
    props: &mut Properties,
    action: CertificateAction,
) -> Result<bool> {
    let ca = match action {
        CertificateAction::Keep => return Ok(false),
        CertificateAction::DeriveFromCa => {
            let profile = props
                .certificate_profile
                .as_ref()
                .ok_or_else(|| Error::internal("certificate profile vanished before derivation"))?;
            KeyCertPair {
                certificate_pem: profile.ca_certificate.clone(),
                private_key_pem: profile.ca_private_key.clone(),
            }
        }
        CertificateAction::GenerateAll => {
            info!("Generating cluster CA");
            ctx.pki.create_ca(CA_COMMON_NAME).await?
        }
    };

    info!(masters = props.master_count(), "Generating cluster certificates");
    let params = pki_params(props, ca.clone(), ctx)?;
    let bundle = ctx.pki.create_pki(params).await?;
    let profile = props
        .certificate_profile
        .get_or_insert_with(CertificateProfile::default);
    bundle.write_to_profile(&ca, profile);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, MockCloud};
    use kestrel_common::api::{MasterProfile, OrchestratorProfile};
    use kestrel_common::versions::VersionPolicy;

    fn props(count: i32) -> Properties {
        Properties {
            orchestrator_profile: Some(OrchestratorProfile::default()),
            master_profile: Some(MasterProfile {
                count,
                dns_prefix: "kestrel".to_string(),
                fqdn: "kestrel.westus2.cloudapp.azure.com".to_string(),
                subject_alt_names: vec!["api.example.com".to_string()],
                first_consecutive_static_ip: "10.240.255.5".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_ip_is_the_first_host_of_the_range() {
        assert_eq!(first_service_ip("10.0.0.0/16"), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(first_service_ip("10.0.12.7/24"), Some(Ipv4Addr::new(10, 0, 12, 1)));
        assert_eq!(first_service_ip("not-a-cidr"), None);
    }

    #[test]
    fn multi_master_params_cover_every_master_and_the_lb() {
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let params = pki_params(&props(3), KeyCertPair::default(), &ctx).expect("params");
        assert_eq!(
            params.extra_fqdns,
            vec!["kestrel.westus2.cloudapp.azure.com", "api.example.com"]
        );
        let ips: Vec<String> = params.extra_ips.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(
            ips,
            vec!["10.240.255.5", "10.240.255.6", "10.240.255.7", "10.240.255.15", "10.0.0.1"]
        );
        assert_eq!(params.master_count, 3);
        assert_eq!(params.cluster_domain, "cluster.local");
    }

    #[test]
    fn single_master_has_no_lb_ip() {
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let params = pki_params(&props(1), KeyCertPair::default(), &ctx).expect("params");
        let ips: Vec<String> = params.extra_ips.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["10.240.255.5", "10.0.0.1"]);
    }

    #[tokio::test]
    async fn generate_all_fills_a_complete_profile() {
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let mut p = props(3);
        let created = ensure_certificates(&ctx, &mut p, CertificateAction::GenerateAll)
            .await
            .expect("certs");
        assert!(created);
        let profile = p.certificate_profile.expect("profile");
        assert!(profile.is_complete(3));
        assert!(profile.ca_certificate.contains("ca"));
    }

    #[tokio::test]
    async fn derived_certificates_reuse_the_existing_ca() {
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let mut p = props(1);
        p.certificate_profile = Some(CertificateProfile {
            ca_certificate: "user-ca-cert".to_string(),
            ca_private_key: "user-ca-key".to_string(),
            ..Default::default()
        });
        ensure_certificates(&ctx, &mut p, CertificateAction::DeriveFromCa)
            .await
            .expect("certs");
        let profile = p.certificate_profile.expect("profile");
        assert_eq!(profile.ca_certificate, "user-ca-cert");
        assert_eq!(profile.etcd_peer_certificates.len(), 1);
    }

    #[tokio::test]
    async fn keep_touches_nothing() {
        let ctx = context(MockCloud::new(), VersionPolicy::builtin());
        let mut p = props(1);
        assert!(!ensure_certificates(&ctx, &mut p, CertificateAction::Keep)
            .await
            .expect("certs"));
        assert!(p.certificate_profile.is_none());
    }
}
