use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::pki::keystore;
use crate::pki::primitive::{generate_password, Credential};

/// A leaf credential as persisted in a dependent record.
///
/// Records written before keystores were introduced carry only the key and
/// certificate; those load with `key_store` and `password` unset.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub private_key: Vec<u8>,
    pub certificate: Vec<u8>,
    pub key_store: Option<Vec<u8>>,
    pub password: Option<String>,
}

impl StoredCredential {
    /// Missing keystore or password.
    pub fn is_legacy(&self) -> bool {
        self.key_store.as_ref().map_or(true, Vec::is_empty)
            || self.password.as_ref().map_or(true, String::is_empty)
    }

    /// Key and certificate are both present.
    pub fn is_usable(&self) -> bool {
        !self.private_key.is_empty() && !self.certificate.is_empty()
    }

    /// Repackage key and certificate into a fresh keystore under a new password.
    pub fn migrate(&self, alias: &str, ca_certificate: Option<&[u8]>) -> Result<StoredCredential> {
        let password = generate_password();
        let key_store = keystore::package(
            &self.private_key,
            &self.certificate,
            ca_certificate,
            alias,
            &password,
        )?;

        Ok(StoredCredential {
            private_key: self.private_key.clone(),
            certificate: self.certificate.clone(),
            key_store: Some(key_store),
            password: Some(password),
        })
    }
}

impl From<Credential> for StoredCredential {
    fn from(credential: Credential) -> Self {
        Self {
            private_key: credential.private_key,
            certificate: credential.certificate,
            key_store: credential.key_store,
            password: Some(credential.password),
        }
    }
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("certificate_len", &self.certificate.len())
            .field("legacy", &self.is_legacy())
            .finish_non_exhaustive()
    }
}

/// Leaf credentials of one dependent group, keyed by replica index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentCredentialSet {
    pub group: String,
    /// Replica `i` is named `<replica_prefix>-<i>`.
    pub replica_prefix: String,
    /// certGeneration of the issuing CA when the set was last written.
    pub ca_cert_generation: Option<u32>,
    pub credentials: BTreeMap<usize, StoredCredential>,
}

impl DependentCredentialSet {
    pub fn new(group: impl Into<String>, replica_prefix: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            replica_prefix: replica_prefix.into(),
            ca_cert_generation: None,
            credentials: BTreeMap::new(),
        }
    }

    pub fn replica_name(&self, index: usize) -> String {
        replica_name(&self.replica_prefix, index)
    }

    pub fn get(&self, index: usize) -> Option<&StoredCredential> {
        self.credentials.get(&index)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

pub(crate) fn replica_name(prefix: &str, index: usize) -> String {
    format!("{}-{}", prefix, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_detection() {
        let mut credential = StoredCredential {
            private_key: b"key".to_vec(),
            certificate: b"cert".to_vec(),
            key_store: None,
            password: None,
        };
        assert!(credential.is_legacy());
        assert!(credential.is_usable());

        credential.key_store = Some(b"p12".to_vec());
        credential.password = Some(String::new());
        assert!(credential.is_legacy());

        credential.password = Some("secret".to_string());
        assert!(!credential.is_legacy());
    }

    #[test]
    fn test_replica_names() {
        let set = DependentCredentialSet::new("brokers", "fleet-broker");
        assert_eq!(set.replica_name(3), "fleet-broker-3");
        assert!(set.is_empty());
        assert_eq!(set.ca_cert_generation, None);
    }
}
