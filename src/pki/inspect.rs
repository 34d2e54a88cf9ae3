//! Read-only inspection of stored certificate and key material.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Duration, Utc};
use rcgen::KeyPair;
use sha2::{Digest, Sha256};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::parse_x509_certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::X509Certificate;

use super::subject::SanEntry;
use crate::error::{FleetCaError, Result};

/// Parsed view of a certificate, detached from the DER buffer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub issuer: String,
    pub subject_alt_names: BTreeSet<SanEntry>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub fingerprint: String,
}

impl CertificateSummary {
    /// True once `now` has reached `not_after - renewal_days`.
    pub fn in_renewal_window(&self, renewal_days: u32, now: DateTime<Utc>) -> bool {
        self.not_after - Duration::days(renewal_days as i64) <= now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.not_after < now
    }
}

/// Convert stored certificate bytes to DER. PEM input is decoded, anything
/// else is assumed to already be DER.
pub fn certificate_der(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.is_empty() {
        return Err(FleetCaError::InvalidCertificate {
            reason: "Certificate data is empty".to_string(),
        });
    }

    if !bytes.starts_with(b"-----BEGIN") {
        return Ok(bytes.to_vec());
    }

    let (_, pem) = parse_x509_pem(bytes).map_err(|e| FleetCaError::InvalidCertificate {
        reason: format!("Failed to decode certificate PEM: {}", e),
    })?;

    if pem.label != "CERTIFICATE" {
        return Err(FleetCaError::InvalidCertificate {
            reason: format!("Unexpected PEM label: {}", pem.label),
        });
    }

    Ok(pem.contents)
}

/// Parse certificate bytes (PEM or DER) into a [`CertificateSummary`].
pub fn summarize(bytes: &[u8]) -> Result<CertificateSummary> {
    let der = certificate_der(bytes)?;
    let (_, cert) = parse_x509_certificate(&der).map_err(|e| FleetCaError::InvalidCertificate {
        reason: format!("Failed to parse certificate DER: {}", e),
    })?;

    let summary = CertificateSummary {
        common_name: cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string),
        organization: cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|org| org.as_str().ok())
            .map(str::to_string),
        issuer: cert.issuer().to_string(),
        subject_alt_names: subject_alt_names(&cert),
        not_before: timestamp(cert.validity().not_before.timestamp())?,
        not_after: timestamp(cert.validity().not_after.timestamp())?,
        fingerprint: fingerprint(&der),
    };
    Ok(summary)
}

/// SHA-256 fingerprint of DER bytes, hex encoded.
pub fn fingerprint(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hex::encode(hasher.finalize())
}

/// Whether the public key inside `cert` belongs to the PEM private key `key_pem`.
pub fn key_matches_certificate(key_pem: &[u8], cert: &[u8]) -> Result<bool> {
    let key_pem = std::str::from_utf8(key_pem).map_err(|e| FleetCaError::InvalidCertificate {
        reason: format!("Private key is not valid PEM: {}", e),
    })?;
    let key_pair = KeyPair::from_pem(key_pem)?;

    let der = certificate_der(cert)?;
    let (_, parsed) = parse_x509_certificate(&der).map_err(|e| FleetCaError::InvalidCertificate {
        reason: format!("Failed to parse certificate DER: {}", e),
    })?;

    let cert_key: &[u8] = parsed.public_key().subject_public_key.data.as_ref();
    let matches = cert_key == key_pair.public_key_raw();
    Ok(matches)
}

/// Whether `cert` carries a valid signature made by the key of `issuer`.
pub fn signed_by(cert: &[u8], issuer: &[u8]) -> Result<bool> {
    let cert_der = certificate_der(cert)?;
    let issuer_der = certificate_der(issuer)?;

    let (_, parsed) = parse_x509_certificate(&cert_der).map_err(|e| FleetCaError::InvalidCertificate {
        reason: format!("Failed to parse certificate DER: {}", e),
    })?;
    let (_, parsed_issuer) =
        parse_x509_certificate(&issuer_der).map_err(|e| FleetCaError::InvalidCertificate {
            reason: format!("Failed to parse issuer certificate DER: {}", e),
        })?;

    let verified = parsed.verify_signature(Some(parsed_issuer.public_key())).is_ok();
    Ok(verified)
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> BTreeSet<SanEntry> {
    let mut sans = BTreeSet::new();

    for extension in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => {
                        sans.insert(SanEntry::Dns(dns.to_string()));
                    }
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            sans.insert(SanEntry::Ip(ip));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    sans
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| FleetCaError::InvalidCertificate {
        reason: format!("Certificate time out of range: {}", secs),
    })
}
