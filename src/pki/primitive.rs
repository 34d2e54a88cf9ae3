//! Issuing one credential: key generation, CSR signing, self-signing and
//! store packaging.
//!
//! Every intermediate (key pair, CSR, PEM buffers) lives in memory for the
//! duration of a single call and is dropped on every exit path.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequest,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SignatureAlgorithm,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use super::inspect::certificate_der;
use super::keystore;
use super::subject::Subject;
use super::truststore::TrustStore;
use crate::ca::model::CA_CRT;
use crate::error::{FleetCaError, Result};

const PASSWORD_LENGTH: usize = 32;

/// Supported key types for generated key pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    #[default]
    EcdsaP256,
    EcdsaP384,
}

/// CA material used to sign leaf certificates.
#[derive(Clone, Copy)]
pub struct Signer<'a> {
    /// PEM encoded PKCS#8 private key of the CA.
    pub key: &'a [u8],
    /// PEM or DER encoded CA certificate.
    pub certificate: &'a [u8],
}

impl<'a> Signer<'a> {
    pub fn new(key: &'a [u8], certificate: &'a [u8]) -> Self {
        Self { key, certificate }
    }

    fn to_rcgen(self) -> Result<Certificate> {
        let key_pair = parse_key_pair(self.key)?;
        let der = certificate_der(self.certificate)?;
        let params = CertificateParams::from_ca_cert_der(&der, key_pair).map_err(|e| {
            FleetCaError::InvalidCertificate {
                reason: format!("Failed to load signing CA: {}", e),
            }
        })?;

        Certificate::from_params(params).map_err(|e| FleetCaError::InvalidCertificate {
            reason: format!("Signing CA key does not match its certificate: {}", e),
        })
    }
}

impl fmt::Debug for Signer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// Output of a single issuance.
///
/// CA credentials carry `trust_store`, leaf credentials carry `key_store`.
/// `password` protects whichever of the two is present.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
    pub trust_store: Option<Vec<u8>>,
    pub key_store: Option<Vec<u8>>,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("certificate_len", &self.certificate.len())
            .field("trust_store", &self.trust_store.as_ref().map(Vec::len))
            .field("key_store", &self.key_store.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Issue one credential for `subject`.
///
/// Without a signer the result is a self-signed CA credential with a new
/// truststore. With a signer a fresh key pair is generated, a CSR is built
/// from it and signed by the CA, and the result is packaged into a PKCS#12
/// keystore aliased by the subject's common name.
pub fn issue(
    subject: &Subject,
    signer: Option<Signer<'_>>,
    validity_days: u32,
    key_type: KeyType,
    now: DateTime<Utc>,
) -> Result<Credential> {
    let key_pair = generate_key_pair(key_type)?;
    match signer {
        None => self_signed(subject, key_pair, validity_days, now),
        Some(signer) => signed(subject, key_pair, signer, validity_days, now),
    }
}

/// Re-issue a self-signed CA certificate for an existing private key.
pub fn renew_self_signed(
    existing_key: &[u8],
    subject: &Subject,
    validity_days: u32,
    now: DateTime<Utc>,
) -> Result<Credential> {
    let key_pair = parse_key_pair(existing_key)?;
    self_signed(subject, key_pair, validity_days, now)
}

/// A new random password. Passwords are never shared between issuances.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

fn self_signed(
    subject: &Subject,
    key_pair: KeyPair,
    validity_days: u32,
    now: DateTime<Utc>,
) -> Result<Credential> {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.alg = signature_algorithm(&key_pair)?;
    params.distinguished_name = subject.distinguished_name();
    params.subject_alt_names = subject.rcgen_sans();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    apply_validity(&mut params, validity_days, now)?;
    params.key_pair = Some(key_pair);

    let certificate = Certificate::from_params(params).map_err(|e| {
        FleetCaError::CertificateGeneration {
            reason: format!("Failed to generate CA certificate: {}", e),
        }
    })?;
    let certificate_pem = certificate.serialize_pem()?;
    let private_key = certificate.serialize_private_key_pem();

    let password = generate_password();
    let mut trust_store = TrustStore::new();
    trust_store.add(CA_CRT, certificate_pem.as_bytes())?;
    let trust_store = trust_store.seal(&password)?;

    debug!(common_name = %subject.common_name, "Issued self-signed CA certificate");

    Ok(Credential {
        private_key: private_key.into_bytes(),
        certificate: certificate_pem.into_bytes(),
        trust_store: Some(trust_store),
        key_store: None,
        password,
    })
}

fn signed(
    subject: &Subject,
    key_pair: KeyPair,
    signer: Signer<'_>,
    validity_days: u32,
    now: DateTime<Utc>,
) -> Result<Credential> {
    let mut request_params = CertificateParams::new(Vec::<String>::new());
    request_params.alg = signature_algorithm(&key_pair)?;
    request_params.distinguished_name = subject.distinguished_name();
    request_params.subject_alt_names = subject.rcgen_sans();
    request_params.key_pair = Some(key_pair);

    let requester = Certificate::from_params(request_params).map_err(|e| {
        FleetCaError::CertificateGeneration {
            reason: format!("Failed to prepare certificate request: {}", e),
        }
    })?;
    let csr_der = requester.serialize_request_der()?;
    let private_key = requester.serialize_private_key_pem();

    let mut csr = CertificateSigningRequest::from_der(&csr_der).map_err(|e| {
        FleetCaError::CertificateGeneration {
            reason: format!("Failed to parse certificate request: {}", e),
        }
    })?;
    // The signer decides the final subject and extensions.
    csr.params.distinguished_name = subject.distinguished_name();
    csr.params.subject_alt_names = subject.rcgen_sans();
    csr.params.is_ca = IsCa::NoCa;
    csr.params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    csr.params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    apply_validity(&mut csr.params, validity_days, now)?;

    let ca = signer.to_rcgen()?;
    let certificate_pem = csr
        .serialize_pem_with_signer(&ca)
        .map_err(|e| FleetCaError::CertificateGeneration {
            reason: format!("Failed to sign certificate for {}: {}", subject.common_name, e),
        })?;

    let password = generate_password();
    let key_store = keystore::package(
        private_key.as_bytes(),
        certificate_pem.as_bytes(),
        Some(signer.certificate),
        &subject.common_name,
        &password,
    )?;

    debug!(common_name = %subject.common_name, sans = subject.subject_alt_names.len(), "Issued leaf certificate");

    Ok(Credential {
        private_key: private_key.into_bytes(),
        certificate: certificate_pem.into_bytes(),
        trust_store: None,
        key_store: Some(key_store),
        password,
    })
}

fn generate_key_pair(key_type: KeyType) -> Result<KeyPair> {
    let alg = match key_type {
        KeyType::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyType::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
    };
    KeyPair::generate(alg).map_err(|e| FleetCaError::CertificateGeneration {
        reason: format!("Failed to generate {:?} key pair: {}", key_type, e),
    })
}

fn parse_key_pair(key_pem: &[u8]) -> Result<KeyPair> {
    let pem = std::str::from_utf8(key_pem).map_err(|e| FleetCaError::InvalidCertificate {
        reason: format!("Private key is not valid PEM: {}", e),
    })?;
    KeyPair::from_pem(pem).map_err(|e| FleetCaError::InvalidCertificate {
        reason: format!("Failed to parse private key: {}", e),
    })
}

fn signature_algorithm(key_pair: &KeyPair) -> Result<&'static SignatureAlgorithm> {
    key_pair
        .compatible_algs()
        .next()
        .ok_or_else(|| FleetCaError::CertificateGeneration {
            reason: "No signature algorithm is compatible with the key pair".to_string(),
        })
}

fn apply_validity(params: &mut CertificateParams, validity_days: u32, now: DateTime<Utc>) -> Result<()> {
    let not_before = OffsetDateTime::from_unix_timestamp(now.timestamp()).map_err(|e| {
        FleetCaError::CertificateGeneration {
            reason: format!("Invalid not_before time: {}", e),
        }
    })?;
    let not_after = not_before
        .checked_add(time::Duration::days(i64::from(validity_days)))
        .ok_or_else(|| FleetCaError::CertificateGeneration {
            reason: format!("Validity of {} days is out of range", validity_days),
        })?;
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::inspect::{key_matches_certificate, summarize};
    use crate::pki::keystore;
    use crate::pki::subject::SanEntry;
    use chrono::Duration;

    fn ca_subject() -> Subject {
        Subject::builder("fleet-cluster-ca")
            .with_organization("fleet.io")
            .build()
    }

    fn leaf_subject() -> Subject {
        Subject::builder("broker-0")
            .with_organization("fleet.io")
            .with_dns_names(["broker-0.brokers.svc", "broker-0.brokers.svc.cluster.local"])
            .with_ip_address("10.1.2.3".parse().unwrap())
            .build()
    }

    #[test]
    fn test_self_signed_credential() {
        let now = Utc::now();
        let ca = issue(&ca_subject(), None, 365, KeyType::EcdsaP256, now).unwrap();

        assert!(ca.trust_store.is_some());
        assert!(ca.key_store.is_none());
        assert_eq!(ca.password.len(), PASSWORD_LENGTH);
        assert!(key_matches_certificate(&ca.private_key, &ca.certificate).unwrap());

        let summary = summarize(&ca.certificate).unwrap();
        assert_eq!(summary.common_name.as_deref(), Some("fleet-cluster-ca"));
        assert_eq!(summary.organization.as_deref(), Some("fleet.io"));
        assert_eq!(summary.not_after - summary.not_before, Duration::days(365));

        let store = TrustStore::open(ca.trust_store.as_ref().unwrap(), &ca.password).unwrap();
        assert!(store.contains(CA_CRT));
    }

    #[test]
    fn test_out_of_range_validity_is_an_error() {
        let result = issue(&ca_subject(), None, u32::MAX, KeyType::EcdsaP256, Utc::now());

        assert!(matches!(
            result,
            Err(FleetCaError::CertificateGeneration { .. })
        ));
    }

    #[test]
    fn test_signed_credential_roundtrip() {
        let now = Utc::now();
        let ca = issue(&ca_subject(), None, 365, KeyType::EcdsaP256, now).unwrap();
        let subject = leaf_subject();

        let leaf = issue(
            &subject,
            Some(Signer::new(&ca.private_key, &ca.certificate)),
            30,
            KeyType::EcdsaP256,
            now,
        )
        .unwrap();

        assert!(leaf.trust_store.is_none());
        let summary = summarize(&leaf.certificate).unwrap();
        assert_eq!(summary.common_name.as_deref(), Some("broker-0"));
        assert_eq!(summary.organization.as_deref(), Some("fleet.io"));
        assert_eq!(summary.subject_alt_names, subject.subject_alt_names);
        assert!(summary.issuer.contains("fleet-cluster-ca"));
        assert!(summary
            .subject_alt_names
            .contains(&SanEntry::Ip("10.1.2.3".parse().unwrap())));

        let contents = keystore::open(leaf.key_store.as_ref().unwrap(), &leaf.password).unwrap();
        assert_eq!(contents.keys.len(), 1);
        assert_eq!(contents.certificates.len(), 2);
    }

    #[test]
    fn test_passwords_are_never_reused() {
        let now = Utc::now();
        let ca = issue(&ca_subject(), None, 365, KeyType::EcdsaP256, now).unwrap();
        let signer = Signer::new(&ca.private_key, &ca.certificate);

        let a = issue(&leaf_subject(), Some(signer), 30, KeyType::EcdsaP256, now).unwrap();
        let b = issue(&leaf_subject(), Some(signer), 30, KeyType::EcdsaP256, now).unwrap();

        assert_ne!(a.password, b.password);
        assert_ne!(a.private_key, b.private_key);
    }

    #[test]
    fn test_renew_self_signed_keeps_key() {
        let now = Utc::now();
        let ca = issue(&ca_subject(), None, 365, KeyType::EcdsaP384, now).unwrap();

        let renewed =
            renew_self_signed(&ca.private_key, &ca_subject(), 365, now + Duration::days(300)).unwrap();

        assert_ne!(renewed.certificate, ca.certificate);
        assert!(key_matches_certificate(&ca.private_key, &renewed.certificate).unwrap());
    }

    #[test]
    fn test_bad_signer_is_fatal() {
        let result = issue(
            &leaf_subject(),
            Some(Signer::new(b"garbage", b"garbage")),
            30,
            KeyType::EcdsaP256,
            Utc::now(),
        );

        assert!(result.is_err());
    }
}
