use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{SecretRecord, SecretStore};
use crate::error::{FleetCaError, Result};

const RECORD_EXTENSION: &str = "json";

/// Record store backed by a directory: `<base>/<namespace>/<name>.json`,
/// data values base64 encoded. Writes go through a temporary file in the same
/// directory followed by a rename.
#[derive(Debug, Clone)]
pub struct LocalSecretStore {
    base_path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct RecordFile {
    namespace: String,
    name: String,
    data: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl LocalSecretStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf> {
        Ok(self.base_path.join(sanitize_component(namespace)?))
    }

    fn record_path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        let file_name = format!("{}.{}", sanitize_component(name)?, RECORD_EXTENSION);
        Ok(self.namespace_dir(namespace)?.join(file_name))
    }
}

/// Keep only characters safe in a file name and reject traversal.
fn sanitize_component(component: &str) -> Result<String> {
    let sanitized = component
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .collect::<String>();

    if sanitized.is_empty() {
        return Err(FleetCaError::Storage(format!(
            "Empty record path component: {:?}",
            component
        )));
    }

    if sanitized.contains("..") || sanitized.starts_with('.') || sanitized != component {
        return Err(FleetCaError::Storage(format!(
            "Invalid record path component: {:?}",
            component
        )));
    }

    Ok(sanitized)
}

impl SecretStore for LocalSecretStore {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        let path = self.record_path(namespace, name)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: RecordFile = serde_json::from_slice(&content)?;
        let mut data = BTreeMap::new();
        for (key, value) in file.data {
            let bytes = general_purpose::STANDARD.decode(&value).map_err(|e| {
                FleetCaError::Storage(format!(
                    "Record {}/{} has invalid base64 in {}: {}",
                    namespace, name, key, e
                ))
            })?;
            data.insert(key, bytes);
        }

        Ok(Some(SecretRecord {
            namespace: file.namespace,
            name: file.name,
            data,
            annotations: file.annotations,
        }))
    }

    fn put(&self, record: &SecretRecord) -> Result<()> {
        let path = self.record_path(&record.namespace, &record.name)?;
        let dir = self.namespace_dir(&record.namespace)?;
        fs::create_dir_all(&dir)?;

        let file = RecordFile {
            namespace: record.namespace.clone(),
            name: record.name.clone(),
            data: record
                .data
                .iter()
                .map(|(key, value)| (key.clone(), general_purpose::STANDARD.encode(value)))
                .collect(),
            annotations: record.annotations.clone(),
        };
        let content = serde_json::to_vec_pretty(&file)?;

        let mut temp = NamedTempFile::new_in(&dir)?;
        temp.write_all(&content)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| FleetCaError::Io(e.error))?;

        debug!(namespace = %record.namespace, name = %record.name, entries = record.data.len(), "Record written");
        Ok(())
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let path = self.record_path(namespace, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.namespace_dir(namespace)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalSecretStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalSecretStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_record_roundtrip_preserves_binary_values() {
        let (_dir, store) = store();
        let mut record = SecretRecord::new("fleet", "brokers-certs");
        record.data.insert("broker-0.p12".to_string(), vec![0, 159, 146, 150, 255]);
        record
            .annotations
            .insert("fleet-ca.io/cluster-ca-cert-generation".to_string(), "2".to_string());

        store.put(&record).unwrap();

        assert_eq!(store.get("fleet", "brokers-certs").unwrap(), Some(record));
        assert_eq!(store.list("fleet").unwrap(), vec!["brokers-certs"]);
    }

    #[test]
    fn test_missing_record() {
        let (_dir, store) = store();
        assert_eq!(store.get("fleet", "absent").unwrap(), None);
        assert!(!store.delete("fleet", "absent").unwrap());
        assert!(store.list("empty").unwrap().is_empty());
    }

    #[test]
    fn test_put_replaces_whole_record() {
        let (_dir, store) = store();
        let mut record = SecretRecord::new("fleet", "ca");
        record.data.insert("a".to_string(), b"1".to_vec());
        store.put(&record).unwrap();

        record.data.clear();
        record.data.insert("b".to_string(), b"2".to_vec());
        store.put(&record).unwrap();

        let stored = store.get("fleet", "ca").unwrap().unwrap();
        assert_eq!(stored.data.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_path_traversal_is_rejected() {
        let (_dir, store) = store();
        assert!(store.get("../etc", "passwd").is_err());
        assert!(store.get("fleet", "a/b").is_err());
        assert!(store.put(&SecretRecord::new("fleet", "..")).is_err());
        assert!(store.get("", "name").is_err());
    }
}
