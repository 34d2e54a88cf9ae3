//! Record store
//!
//! CA material and dependent credentials are persisted as records addressed
//! by namespace and name. A record holds byte-valued data entries and string
//! annotations. Each `put` replaces the whole record atomically.

pub mod local;
pub mod memory;
pub mod records;

pub use local::LocalSecretStore;
pub use memory::InMemorySecretStore;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::Result;

/// One persisted record.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretRecord {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
    pub annotations: BTreeMap<String, String>,
}

impl SecretRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            data: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn value(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("data", &self.data.keys().collect::<Vec<_>>())
            .field("annotations", &self.annotations)
            .finish()
    }
}

/// Storage backend for records.
pub trait SecretStore: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>>;

    /// Create or atomically replace a record.
    fn put(&self, record: &SecretRecord) -> Result<()>;

    /// Returns whether a record was removed.
    fn delete(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Names of all records in `namespace`, sorted.
    fn list(&self, namespace: &str) -> Result<Vec<String>>;
}

/// Open the store selected by configuration.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn SecretStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(InMemorySecretStore::new())),
        StoreConfig::Local { path } => Ok(Arc::new(LocalSecretStore::new(path.clone())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_store_from_config() {
        let memory = open_store(&StoreConfig::Memory).unwrap();
        assert!(memory.list("fleet").unwrap().is_empty());

        let dir = TempDir::new().unwrap();
        let local = open_store(&StoreConfig::Local {
            path: dir.path().join("records"),
        })
        .unwrap();
        local.put(&SecretRecord::new("fleet", "cluster-ca")).unwrap();
        assert_eq!(local.list("fleet").unwrap(), vec!["cluster-ca"]);
        assert!(dir.path().join("records/fleet/cluster-ca.json").exists());
    }

    #[test]
    fn test_debug_hides_values() {
        let mut record = SecretRecord::new("fleet", "cluster-ca");
        record.data.insert("ca.key".to_string(), b"secret-key-bytes".to_vec());

        let debug = format!("{:?}", record);
        assert!(debug.contains("ca.key"));
        assert!(!debug.contains("secret-key-bytes"));
    }
}
