use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ca::model::CaSettings;

/// Upper bound on CA and leaf certificate validity.
const MAX_VALIDITY_DAYS: u32 = 36_500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace every record lives in.
    pub namespace: String,
    pub store: StoreConfig,
    pub cluster_ca: CaConfig,
    pub clients_ca: CaConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    Local { path: PathBuf },
}

/// One CA and the names of the records it is persisted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    #[serde(flatten)]
    pub settings: CaSettings,
    pub cert_record: String,
    pub key_record: String,
}

impl CaConfig {
    fn named(prefix: &str, common_name: &str) -> Self {
        Self {
            settings: CaSettings {
                common_name: common_name.to_string(),
                ..Default::default()
            },
            cert_record: format!("{}-cert", prefix),
            key_record: prefix.to_string(),
        }
    }

    pub fn cluster_default() -> Self {
        Self::named("cluster-ca", "fleet-cluster-ca")
    }

    pub fn clients_default() -> Self {
        Self::named("clients-ca", "fleet-clients-ca")
    }

    pub fn validate(&self, name: &str) -> crate::Result<()> {
        if self.settings.common_name.trim().is_empty() {
            return Err(crate::error::FleetCaError::InvalidConfig(format!(
                "{}.common_name cannot be empty",
                name
            )));
        }

        if self.settings.validity_days == 0 {
            return Err(crate::error::FleetCaError::InvalidConfig(format!(
                "{}.validity_days must be greater than 0",
                name
            )));
        }

        if self.settings.validity_days > MAX_VALIDITY_DAYS {
            return Err(crate::error::FleetCaError::InvalidConfig(format!(
                "{}.validity_days ({}) cannot exceed {}",
                name, self.settings.validity_days, MAX_VALIDITY_DAYS
            )));
        }

        if self.settings.renewal_days >= self.settings.validity_days {
            return Err(crate::error::FleetCaError::InvalidConfig(format!(
                "{}.renewal_days ({}) must be less than validity_days ({})",
                name, self.settings.renewal_days, self.settings.validity_days
            )));
        }

        if self.cert_record.is_empty() || self.key_record.is_empty() {
            return Err(crate::error::FleetCaError::InvalidConfig(format!(
                "{}.cert_record and {}.key_record cannot be empty",
                name, name
            )));
        }

        if self.cert_record == self.key_record {
            return Err(crate::error::FleetCaError::InvalidConfig(format!(
                "{}.cert_record and {}.key_record must differ",
                name, name
            )));
        }

        Ok(())
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self::cluster_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "fleet".to_string(),
            store: StoreConfig::Memory,
            cluster_ca: CaConfig::cluster_default(),
            clients_ca: CaConfig::clients_default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::error::FleetCaError::Config(e.to_string()))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.namespace.is_empty() {
            return Err(crate::error::FleetCaError::InvalidConfig(
                "namespace cannot be empty".to_string(),
            ));
        }

        if let StoreConfig::Local { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err(crate::error::FleetCaError::InvalidConfig(
                    "store.path cannot be empty".to_string(),
                ));
            }
        }

        self.cluster_ca.validate("cluster_ca")?;
        self.clients_ca.validate("clients_ca")?;

        let records = [
            &self.cluster_ca.cert_record,
            &self.cluster_ca.key_record,
            &self.clients_ca.cert_record,
            &self.clients_ca.key_record,
        ];
        for (i, a) in records.iter().enumerate() {
            if records[i + 1..].contains(a) {
                return Err(crate::error::FleetCaError::InvalidConfig(format!(
                    "record name {} is used by more than one CA record",
                    a
                )));
            }
        }

        Ok(())
    }
}
