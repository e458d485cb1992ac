//! RSA key handling
//!
//! rcgen produces and consumes PKCS#8 keys; cluster artifacts and the API
//! model carry PKCS#1 (`RSA PRIVATE KEY`). The conversion only unwraps or
//! wraps the `PrivateKeyInfo` envelope.

use base64::Engine;
use rcgen::{KeyPair, PublicKeyData, RsaKeySize, PKCS_RSA_SHA256};
use x509_parser::der_parser::der::parse_der;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::error::{PkiError, Result};

const PEM_RSA_PRIVATE_KEY: &str = "RSA PRIVATE KEY";
const PEM_PRIVATE_KEY: &str = "PRIVATE KEY";

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_SEQUENCE: u8 = 0x30;

const RSA_ENCRYPTION_OID: &str = "1.2.840.113549.1.1.1";

/// rsaEncryption AlgorithmIdentifier: OID 1.2.840.113549.1.1.1 with NULL parameters
const RSA_ALGORITHM_IDENTIFIER: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// RSA modulus size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeySize {
    /// 2048 bits; fast, for tests
    Weak,
    /// 3072 bits
    Medium,
    /// 4096 bits
    #[default]
    Strong,
}

impl KeySize {
    pub fn bits(self) -> usize {
        match self {
            KeySize::Weak => 2048,
            KeySize::Medium => 3072,
            KeySize::Strong => 4096,
        }
    }

    fn rcgen(self) -> RsaKeySize {
        match self {
            KeySize::Weak => RsaKeySize::_2048,
            KeySize::Medium => RsaKeySize::_3072,
            KeySize::Strong => RsaKeySize::_4096,
        }
    }
}

/// Generate an RSA key pair for SHA-256 signatures
pub fn generate_rsa_key(size: KeySize) -> Result<KeyPair> {
    KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, size.rcgen()).map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate {}-bit RSA key: {}", size.bits(), e))
    })
}

/// PKCS#1 PEM of a key pair
pub fn key_to_pkcs1_pem(key: &KeyPair) -> Result<String> {
    let pkcs1 = pkcs8_to_pkcs1(&key.serialize_der())?;
    Ok(::pem::encode(&::pem::Pem::new(PEM_RSA_PRIVATE_KEY, pkcs1)))
}

/// Load an RSA key from PKCS#1 or PKCS#8 PEM
pub fn key_from_pem(pem_data: &str) -> Result<KeyPair> {
    let parsed = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse key PEM: {}", e)))?;
    let pkcs8_pem = match parsed.tag() {
        PEM_RSA_PRIVATE_KEY => ::pem::encode(&::pem::Pem::new(
            PEM_PRIVATE_KEY,
            pkcs1_to_pkcs8(parsed.contents()),
        )),
        PEM_PRIVATE_KEY => pem_data.to_string(),
        other => {
            return Err(PkiError::ParseError(format!(
                "unexpected PEM block '{}', expected a private key",
                other
            )))
        }
    };
    KeyPair::from_pem(&pkcs8_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to load private key: {}", e)))
}

fn encode_tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = contents.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend(bytes);
    }
    out.extend_from_slice(contents);
    out
}

/// Unwrap the RSAPrivateKey from a PKCS#8 PrivateKeyInfo
pub fn pkcs8_to_pkcs1(pkcs8: &[u8]) -> Result<Vec<u8>> {
    let malformed = |what: &str| PkiError::ParseError(format!("PKCS#8 key {}", what));
    let (_, info) = parse_der(pkcs8)
        .map_err(|e| PkiError::ParseError(format!("malformed PKCS#8 key: {}", e)))?;
    let fields = info
        .as_sequence()
        .map_err(|_| malformed("is not a SEQUENCE"))?;
    let [version, algorithm, private_key, ..] = fields.as_slice() else {
        return Err(malformed("is missing fields"));
    };
    version.as_u32().map_err(|_| malformed("has no version"))?;
    let oid = algorithm
        .as_sequence()
        .ok()
        .and_then(|parts| parts.first())
        .and_then(|oid| oid.as_oid().ok())
        .map(|oid| oid.to_id_string());
    if oid.as_deref() != Some(RSA_ENCRYPTION_OID) {
        return Err(malformed("is not an RSA key"));
    }
    let octets = private_key
        .as_slice()
        .map_err(|_| malformed("has no private key octets"))?;
    Ok(octets.to_vec())
}

/// Wrap an RSAPrivateKey in a PKCS#8 PrivateKeyInfo
pub fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> {
    let mut body = encode_tlv(TAG_INTEGER, &[0]);
    body.extend_from_slice(RSA_ALGORITHM_IDENTIFIER);
    body.extend(encode_tlv(TAG_OCTET_STRING, pkcs1));
    encode_tlv(TAG_SEQUENCE, &body)
}

/// SSH key pair for node administrator access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    /// PKCS#1 PEM, accepted by OpenSSH
    pub private_key_pem: String,
    /// `ssh-rsa AAAA...` line
    pub public_key: String,
}

fn write_ssh_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

fn write_ssh_mpint(out: &mut Vec<u8>, unsigned: &[u8]) {
    let trimmed: &[u8] = match unsigned.iter().position(|b| *b != 0) {
        Some(i) => &unsigned[i..],
        None => &[],
    };
    if trimmed.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
        let mut padded = Vec::with_capacity(trimmed.len() + 1);
        padded.push(0);
        padded.extend_from_slice(trimmed);
        write_ssh_string(out, &padded);
    } else {
        write_ssh_string(out, trimmed);
    }
}

/// OpenSSH `authorized_keys` line for an RSA key pair
pub fn ssh_public_key(key: &KeyPair) -> Result<String> {
    let spki = key.subject_public_key_info();
    let (_, info) = SubjectPublicKeyInfo::from_der(&spki)
        .map_err(|e| PkiError::ParseError(format!("failed to parse public key: {}", e)))?;
    let rsa = match info.parsed() {
        Ok(PublicKey::RSA(rsa)) => rsa,
        Ok(_) => return Err(PkiError::ParseError("SSH keys must be RSA".to_string())),
        Err(e) => return Err(PkiError::ParseError(format!("failed to parse public key: {}", e))),
    };

    let mut blob = Vec::new();
    write_ssh_string(&mut blob, b"ssh-rsa");
    write_ssh_mpint(&mut blob, rsa.exponent);
    write_ssh_mpint(&mut blob, rsa.modulus);
    Ok(format!(
        "ssh-rsa {}",
        base64::engine::general_purpose::STANDARD.encode(blob)
    ))
}

/// Generate an SSH key pair
pub fn create_ssh_key_pair(size: KeySize) -> Result<SshKeyPair> {
    let key = generate_rsa_key(size)?;
    Ok(SshKeyPair {
        private_key_pem: key_to_pkcs1_pem(&key)?,
        public_key: ssh_public_key(&key)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkcs1_and_pkcs8_envelopes_convert_both_ways() {
        let key = generate_rsa_key(KeySize::Weak).expect("key");
        let pkcs8 = key.serialize_der();
        let pkcs1 = pkcs8_to_pkcs1(&pkcs8).expect("unwrap");
        assert_eq!(pkcs1_to_pkcs8(&pkcs1), pkcs8);
    }

    #[test]
    fn pkcs1_pem_loads_back_into_the_same_key() {
        let key = generate_rsa_key(KeySize::Weak).expect("key");
        let pem = key_to_pkcs1_pem(&key).expect("pem");
        assert!(pem.contains("BEGIN RSA PRIVATE KEY"));

        let loaded = key_from_pem(&pem).expect("loads");
        assert_eq!(loaded.subject_public_key_info(), key.subject_public_key_info());

        let pkcs8 = key_from_pem(&key.serialize_pem()).expect("pkcs8 loads");
        assert_eq!(pkcs8.subject_public_key_info(), key.subject_public_key_info());
    }

    #[test]
    fn non_key_pem_is_rejected() {
        let cert = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        assert!(matches!(key_from_pem(&cert), Err(PkiError::ParseError(_))));
        assert!(matches!(key_from_pem("not pem"), Err(PkiError::ParseError(_))));
    }

    #[test]
    fn truncated_der_is_a_parse_error() {
        assert!(pkcs8_to_pkcs1(&[0x30, 0x82, 0x01]).is_err());
        assert!(pkcs8_to_pkcs1(&[]).is_err());
    }

    #[test]
    fn non_rsa_pkcs8_is_rejected() {
        let ec_oid = [0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
        let mut body = encode_tlv(TAG_INTEGER, &[0]);
        body.extend(encode_tlv(TAG_SEQUENCE, &ec_oid));
        body.extend(encode_tlv(TAG_OCTET_STRING, &[1, 2, 3]));
        let err = pkcs8_to_pkcs1(&encode_tlv(TAG_SEQUENCE, &body)).unwrap_err();
        assert!(err.to_string().contains("not an RSA key"));
    }

    #[test]
    fn long_form_lengths_are_encoded() {
        let contents = vec![7u8; 300];
        let tlv = encode_tlv(TAG_OCTET_STRING, &contents);
        assert_eq!(&tlv[..4], &[0x04, 0x82, 0x01, 0x2c]);
        let (rest, parsed) = parse_der(&tlv).expect("parses");
        assert_eq!(parsed.as_slice().expect("octets").len(), 300);
        assert!(rest.is_empty());
    }

    #[test]
    fn ssh_public_key_has_openssh_wire_format() {
        let pair = create_ssh_key_pair(KeySize::Weak).expect("ssh key");
        let encoded = pair.public_key.strip_prefix("ssh-rsa ").expect("ssh-rsa prefix");
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .expect("base64");
        assert_eq!(&blob[..4], &7u32.to_be_bytes());
        assert_eq!(&blob[4..11], b"ssh-rsa");
        assert!(pair.private_key_pem.contains("BEGIN RSA PRIVATE KEY"));
    }

    #[test]
    fn mpint_is_padded_when_high_bit_is_set() {
        let mut out = Vec::new();
        write_ssh_mpint(&mut out, &[0x00, 0x80, 0x01]);
        assert_eq!(out, vec![0, 0, 0, 3, 0x00, 0x80, 0x01]);

        let mut out = Vec::new();
        write_ssh_mpint(&mut out, &[0x01, 0x00, 0x01]);
        assert_eq!(out, vec![0, 0, 0, 3, 0x01, 0x00, 0x01]);
    }
}
