//! Trust-store maintenance.
//!
//! A [`TrustStore`] maps aliases to DER certificates and is persisted as a
//! PKCS#12 file holding one friendly-named certificate bag per alias, with a
//! password MAC over the contents. [`purge_expired`] keeps a CA's certificate
//! data set and its truststore in step when certificates expire.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use p12::{CertBag, ContentInfo, EncryptedData, MacData, PKCS12Attribute, SafeBag, SafeBagKind, PFX};
use tracing::{debug, info, warn};

use super::inspect::{certificate_der, summarize};
use super::primitive::generate_password;
use crate::ca::model::{CaCertBundle, CA_STORE, CA_STORE_PASSWORD};
use crate::error::{FleetCaError, Result};

const PFX_VERSION: u8 = 3;

/// Alias → DER certificate map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a PKCS#12 truststore, verifying its MAC first.
    pub fn open(blob: &[u8], password: &str) -> Result<Self> {
        let pfx = PFX::parse(blob).map_err(|e| FleetCaError::Keystore {
            reason: format!("Failed to parse PKCS#12 truststore: {:?}", e),
        })?;

        if !pfx.verify_mac(password) {
            return Err(FleetCaError::Keystore {
                reason: "Truststore MAC verification failed - wrong password or corrupted truststore"
                    .to_string(),
            });
        }

        let bags = pfx.bags(password).map_err(|e| FleetCaError::Keystore {
            reason: format!("Failed to read truststore bags: {:?}", e),
        })?;

        let mut entries = BTreeMap::new();
        for bag in bags {
            let Some(der) = bag.bag.get_x509_cert() else {
                continue;
            };
            let alias = bag.friendly_name().ok_or_else(|| FleetCaError::Keystore {
                reason: "Truststore certificate has no alias".to_string(),
            })?;
            entries.insert(alias, der);
        }

        Ok(Self { entries })
    }

    /// Encode the store as PKCS#12 under `password`.
    pub fn seal(&self, password: &str) -> Result<Vec<u8>> {
        let bags = self
            .entries
            .iter()
            .map(|(alias, der)| SafeBag {
                bag: SafeBagKind::CertBag(CertBag::X509(der.clone())),
                attributes: vec![PKCS12Attribute::FriendlyName(alias.clone())],
            })
            .collect::<Vec<_>>();

        let bmp_password = bmp_string(password);
        let encrypted = EncryptedData::from_safe_bags(&bags, &bmp_password).ok_or_else(|| {
            FleetCaError::Keystore {
                reason: "Failed to encrypt truststore certificate bags".to_string(),
            }
        })?;
        let contents = ContentInfo::EncryptedData(encrypted);
        let auth_safe = yasna::construct_der(|w| {
            w.write_sequence_of(|w| contents.write(w.next()));
        });

        let mac_data = MacData::new(&auth_safe, &bmp_password);
        let pfx = PFX {
            version: PFX_VERSION,
            auth_safe: ContentInfo::Data(auth_safe),
            mac_data: Some(mac_data),
        };
        Ok(pfx.to_der())
    }

    /// Insert or replace the certificate stored under `alias`.
    pub fn add(&mut self, alias: &str, cert: &[u8]) -> Result<()> {
        let der = certificate_der(cert)?;
        self.entries.insert(alias.to_string(), der);
        Ok(())
    }

    /// Remove every alias in `aliases`, returning how many were present.
    pub fn remove<S: AsRef<str>>(&mut self, aliases: &[S]) -> usize {
        aliases
            .iter()
            .filter(|alias| self.entries.remove(alias.as_ref()).is_some())
            .count()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    /// DER certificate stored under `alias`.
    pub fn get(&self, alias: &str) -> Option<&[u8]> {
        self.entries.get(alias).map(Vec::as_slice)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// PKCS#12 password encoding: big-endian UTF-16 with a trailing NUL.
fn bmp_string(password: &str) -> Vec<u8> {
    let mut bytes = password
        .encode_utf16()
        .flat_map(u16::to_be_bytes)
        .collect::<Vec<_>>();
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

/// Insert-or-replace `cert` under `alias` in a PKCS#12 truststore and return
/// the re-encoded store. A missing blob starts an empty store.
pub fn add_to_trust_store(
    alias: &str,
    cert: &[u8],
    blob: Option<&[u8]>,
    password: &str,
) -> Result<Vec<u8>> {
    let mut store = match blob {
        Some(blob) => TrustStore::open(blob, password)?,
        None => TrustStore::new(),
    };
    store.add(alias, cert)?;
    store.seal(password)
}

/// Remove expired and unparseable certificates from a CA's data set and its
/// truststore. Returns the number of entries removed.
///
/// Every entry except the store and its password is a candidate, including
/// the current `ca.crt`. The truststore is rewritten at most once.
pub fn purge_expired(bundle: &mut CaCertBundle, now: DateTime<Utc>) -> Result<usize> {
    let mut removed = Vec::new();

    for (alias, data) in bundle.entries() {
        if alias == CA_STORE || alias == CA_STORE_PASSWORD {
            continue;
        }

        match summarize(data) {
            Ok(summary) if summary.is_expired(now) => {
                debug!(alias = %alias, not_after = %summary.not_after, "Removing expired CA certificate");
                removed.push(alias.clone());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(alias = %alias, error = %e, "Removing unparseable entry from CA certificate data");
                removed.push(alias.clone());
            }
        }
    }

    if removed.is_empty() {
        return Ok(0);
    }

    for alias in &removed {
        bundle.remove(alias);
    }

    match bundle.open_trust_store() {
        Ok(mut store) => {
            store.remove(&removed);
            let password = bundle.password().unwrap_or_default();
            bundle.set_trust_store(store.seal(&password)?, password);
        }
        Err(e) => {
            warn!(error = %e, "CA truststore could not be opened, rebuilding it");
            rebuild_trust_store(bundle)?;
        }
    }

    info!(removed = removed.len(), "Purged CA certificates from data set and truststore");
    Ok(removed.len())
}

/// Replace the bundle's truststore with one holding every certificate entry
/// of the bundle, protected by a new password.
pub fn rebuild_trust_store(bundle: &mut CaCertBundle) -> Result<()> {
    let mut store = TrustStore::new();
    for (alias, data) in bundle.entries() {
        if alias == CA_STORE || alias == CA_STORE_PASSWORD {
            continue;
        }
        if summarize(data).is_ok() {
            store.add(alias, data)?;
        }
    }

    let password = generate_password();
    bundle.set_trust_store(store.seal(&password)?, password);
    Ok(())
}
