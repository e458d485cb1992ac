//! Cluster PKI for the kestrel cluster engine
//!
//! Generates the cluster CA, the certificates every control-plane role needs,
//! and SSH key pairs for node access. Keys are RSA and written as PKCS#1 PEM;
//! certificates are signed with SHA-256 and valid for thirty years.

pub mod error;
pub mod factory;
pub mod keys;
pub mod verify;

pub use error::{PkiError, Result};
pub use factory::{
    create_ca_pair, kubernetes_service_names, KeyCertPair, PkiBundle, PkiFactory, PkiParams,
    RsaPkiFactory, SYSTEM_MASTERS, VALIDITY_YEARS,
};
pub use keys::{create_ssh_key_pair, KeySize, SshKeyPair};
pub use verify::{inspect, key_matches_certificate, verify_signed_by, CertificateDetails};
