use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{SecretRecord, SecretStore};
use crate::error::Result;

/// In-process record store. Used in tests and by embedders that persist
/// records elsewhere.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    records: RwLock<BTreeMap<(String, String), SecretRecord>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        let records = self.records.read();
        Ok(records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    fn put(&self, record: &SecretRecord) -> Result<()> {
        let mut records = self.records.write();
        records.insert(
            (record.namespace.clone(), record.name.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut records = self.records.write();
        Ok(records
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let records = self.records.read();
        Ok(records
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect())
    }
}
