//! PKCS#12 keystores for leaf credentials.

use p12::PFX;
use rcgen::KeyPair;

use super::inspect::certificate_der;
use crate::error::{FleetCaError, Result};

/// Contents recovered from a PKCS#12 keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreContents {
    /// PKCS#8 DER private keys, normally exactly one.
    pub keys: Vec<Vec<u8>>,
    /// DER certificates: the leaf first, followed by the CA chain.
    pub certificates: Vec<Vec<u8>>,
}

/// Package a PEM private key and its certificate (plus the issuing CA, if
/// any) into a password protected PKCS#12 keystore under `alias`.
pub fn package(
    key_pem: &[u8],
    cert: &[u8],
    ca_cert: Option<&[u8]>,
    alias: &str,
    password: &str,
) -> Result<Vec<u8>> {
    let key_pem = std::str::from_utf8(key_pem).map_err(|e| FleetCaError::Keystore {
        reason: format!("Private key is not valid PEM: {}", e),
    })?;
    let key_der = KeyPair::from_pem(key_pem)?.serialize_der();
    let cert_der = certificate_der(cert)?;
    let ca_der = ca_cert.map(certificate_der).transpose()?;

    let pfx = PFX::new(&cert_der, &key_der, ca_der.as_deref(), password, alias).ok_or_else(|| {
        FleetCaError::Keystore {
            reason: format!("Failed to build PKCS#12 keystore for {}", alias),
        }
    })?;

    Ok(pfx.to_der())
}

/// Open a keystore produced by [`package`], verifying its MAC first.
pub fn open(keystore: &[u8], password: &str) -> Result<KeystoreContents> {
    let pfx = PFX::parse(keystore).map_err(|e| FleetCaError::Keystore {
        reason: format!("Failed to parse PKCS#12 keystore: {:?}", e),
    })?;

    if !pfx.verify_mac(password) {
        return Err(FleetCaError::Keystore {
            reason: "PKCS#12 MAC verification failed - wrong password or corrupted keystore"
                .to_string(),
        });
    }

    let keys = pfx.key_bags(password).map_err(|e| FleetCaError::Keystore {
        reason: format!("Failed to read key bags: {:?}", e),
    })?;
    let certificates = pfx.cert_x509_bags(password).map_err(|e| FleetCaError::Keystore {
        reason: format!("Failed to read certificate bags: {:?}", e),
    })?;

    Ok(KeystoreContents { keys, certificates })
}
