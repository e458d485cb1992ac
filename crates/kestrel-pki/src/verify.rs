//! Certificate inspection and chain verification

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rcgen::PublicKeyData;
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};

/// What a certificate advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub server_auth: bool,
    pub client_auth: bool,
    pub is_ca: bool,
    /// Unix timestamp
    pub not_before: i64,
    /// Unix timestamp
    pub not_after: i64,
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

fn details(cert: &X509Certificate<'_>) -> Result<CertificateDetails> {
    let parse_err = |e: X509Error| PkiError::ParseError(format!("bad certificate extension: {}", e));

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();
    let organizations = cert
        .subject()
        .iter_organization()
        .filter_map(|o| o.as_str().ok().map(str::to_string))
        .collect();

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Some(san) = cert.subject_alternative_name().map_err(parse_err)? {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                GeneralName::IPAddress(raw) => ip_addresses.extend(ip_from_bytes(raw)),
                _ => {}
            }
        }
    }

    let (server_auth, client_auth) = match cert.extended_key_usage().map_err(parse_err)? {
        Some(eku) => (eku.value.server_auth, eku.value.client_auth),
        None => (false, false),
    };

    Ok(CertificateDetails {
        common_name,
        organizations,
        dns_names,
        ip_addresses,
        server_auth,
        client_auth,
        is_ca: cert.is_ca(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

/// Read a PEM certificate without verifying it
pub fn inspect(cert_pem: &str) -> Result<CertificateDetails> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    details(&cert)
}

/// Verify that `cert_pem` was signed by `ca_pem` and return its details
pub fn verify_signed_by(cert_pem: &str, ca_pem: &str) -> Result<CertificateDetails> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(ca_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    cert.verify_signature(Some(ca_cert.public_key()))
        .map_err(|_| PkiError::ParseError("signature verification failed".to_string()))?;
    details(&cert)
}

/// Verify that a certificate and private key PEM belong together
pub fn key_matches_certificate(cert_pem: &str, key_pem: &str) -> Result<bool> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    let key = crate::keys::key_from_pem(key_pem)?;
    Ok(cert.public_key().raw == key.subject_public_key_info().as_slice())
}
