//! Certificate Authority state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FleetCaError, Result};
use crate::pki::primitive::KeyType;
use crate::pki::subject::Subject;
use crate::pki::truststore::TrustStore;

/// Current CA certificate entry.
pub const CA_CRT: &str = "ca.crt";
/// CA private key entry (held in the key record).
pub const CA_KEY: &str = "ca.key";
/// PKCS#12 truststore entry.
pub const CA_STORE: &str = "ca.p12";
/// Truststore password entry.
pub const CA_STORE_PASSWORD: &str = "ca.password";

/// What to do when a self-managed CA certificate enters its renewal window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpirationPolicy {
    #[default]
    RenewCertificate,
    ReplaceKey,
}

/// Static settings of one CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaSettings {
    pub common_name: String,
    pub organization: Option<String>,
    pub validity_days: u32,
    pub renewal_days: u32,
    pub expiration_policy: ExpirationPolicy,
    /// When false the CA material is supplied externally and only observed.
    pub self_managed: bool,
    pub key_type: KeyType,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            common_name: "fleet-ca".to_string(),
            organization: Some("fleet.io".to_string()),
            validity_days: 365,
            renewal_days: 30,
            expiration_policy: ExpirationPolicy::RenewCertificate,
            self_managed: true,
            key_type: KeyType::EcdsaP256,
        }
    }
}

impl CaSettings {
    /// Subject of the CA certificate. `key_generation` is embedded in the
    /// common name for replaced keys so successive keys have distinct subjects.
    pub fn subject(&self, key_generation: Option<u32>) -> Subject {
        let common_name = match key_generation {
            Some(generation) => format!("{} v{}", self.common_name, generation),
            None => self.common_name.clone(),
        };

        let builder = Subject::builder(common_name);
        match &self.organization {
            Some(org) => builder.with_organization(org.clone()).build(),
            None => builder.build(),
        }
    }
}

/// Named certificate entries of a CA: the current certificate, archived
/// certificates, and the PKCS#12 truststore with its password.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CaCertBundle {
    entries: BTreeMap<String, Vec<u8>>,
}

impl CaCertBundle {
    pub fn from_entries(entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.entries.insert(name.into(), data);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.entries.remove(name)
    }

    /// The current CA certificate, if present and non-empty.
    pub fn certificate(&self) -> Option<&[u8]> {
        self.get(CA_CRT).filter(|data| !data.is_empty())
    }

    pub fn trust_store(&self) -> Option<&[u8]> {
        self.get(CA_STORE).filter(|data| !data.is_empty())
    }

    pub fn password(&self) -> Option<String> {
        self.get(CA_STORE_PASSWORD)
            .filter(|data| !data.is_empty())
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn set_trust_store(&mut self, store: Vec<u8>, password: String) {
        self.entries.insert(CA_STORE.to_string(), store);
        self.entries
            .insert(CA_STORE_PASSWORD.to_string(), password.into_bytes());
    }

    /// Open the PKCS#12 truststore with the stored password.
    pub fn open_trust_store(&self) -> Result<TrustStore> {
        let blob = self.trust_store().ok_or_else(|| FleetCaError::Keystore {
            reason: "CA truststore is missing".to_string(),
        })?;
        let password = self.password().ok_or_else(|| FleetCaError::Keystore {
            reason: "CA truststore password is missing".to_string(),
        })?;
        TrustStore::open(blob, &password)
    }

    /// Names of archived (previous) CA certificates.
    pub fn archived(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(|name| *name != CA_CRT && *name != CA_STORE && *name != CA_STORE_PASSWORD)
    }
}

impl fmt::Debug for CaCertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaCertBundle")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A Certificate Authority: settings, material and generation counters.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateAuthority {
    pub settings: CaSettings,
    /// PEM private key, empty when absent.
    pub key: Vec<u8>,
    pub certs: CaCertBundle,
    pub cert_generation: u32,
    pub key_generation: u32,
}

impl CertificateAuthority {
    /// A CA with no material yet, counters at zero.
    pub fn new(settings: CaSettings) -> Self {
        Self {
            settings,
            key: Vec::new(),
            certs: CaCertBundle::default(),
            cert_generation: 0,
            key_generation: 0,
        }
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn certificate(&self) -> Option<&[u8]> {
        self.certs.certificate()
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("settings", &self.settings)
            .field("has_key", &self.has_key())
            .field("certs", &self.certs)
            .field("cert_generation", &self.cert_generation)
            .field("key_generation", &self.key_generation)
            .finish()
    }
}
