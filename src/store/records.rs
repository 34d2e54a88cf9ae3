//! Mapping between persisted records and engine types.
//!
//! A CA is stored as two records: the certificate record (`ca.crt`, `ca.p12`,
//! `ca.password`, archived certificates) and the key record (`ca.key`).
//! Generation counters and force requests travel as annotations. Each
//! dependent group is one record holding `<replica>.key`, `<replica>.crt`,
//! `<replica>.p12` and `<replica>.password` for every replica.

use crate::ca::model::{CaCertBundle, CaSettings, CertificateAuthority, CA_CRT, CA_KEY};
use crate::error::{FleetCaError, Result};
use crate::issuance::{DependentCredentialSet, StoredCredential};

use super::SecretRecord;

pub const ANNOTATION_PREFIX: &str = "fleet-ca.io/";
/// Request a CA certificate renewal. Set on the certificate record.
pub const FORCE_RENEW: &str = "fleet-ca.io/force-renew";
/// Request a CA key replacement. Set on the key record.
pub const FORCE_REPLACE: &str = "fleet-ca.io/force-replace";
pub const CA_CERT_GENERATION: &str = "fleet-ca.io/ca-cert-generation";
pub const CA_KEY_GENERATION: &str = "fleet-ca.io/ca-key-generation";
/// Cluster CA generation mirrored on dependent records.
pub const CLUSTER_CA_CERT_GENERATION: &str = "fleet-ca.io/cluster-ca-cert-generation";
/// Clients CA generation mirrored on dependent records.
pub const CLIENTS_CA_CERT_GENERATION: &str = "fleet-ca.io/clients-ca-cert-generation";

const KEY_SUFFIX: &str = "key";
const CERT_SUFFIX: &str = "crt";
const STORE_SUFFIX: &str = "p12";
const PASSWORD_SUFFIX: &str = "password";

/// Parse a generation annotation. Absent means `None`, anything but a
/// non-negative integer is an error.
pub fn parse_generation(record: &SecretRecord, annotation: &str) -> Result<Option<u32>> {
    match record.annotation(annotation) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| FleetCaError::InvalidAnnotation {
                record: format!("{}/{}", record.namespace, record.name),
                annotation: annotation.to_string(),
                value: value.to_string(),
            }),
    }
}

/// Whether a boolean request annotation is set to `true`.
pub fn is_flag_set(record: Option<&SecretRecord>, annotation: &str) -> bool {
    record
        .and_then(|record| record.annotation(annotation))
        .map_or(false, |value| value.trim().eq_ignore_ascii_case("true"))
}

/// Build a [`CertificateAuthority`] from its two records.
///
/// Self-managed CAs tolerate missing records and values (the lifecycle
/// engine creates or renews what is missing). Externally managed CAs must
/// supply both `ca.key` and `ca.crt`.
pub fn load_ca(
    settings: &CaSettings,
    cert_record: Option<&SecretRecord>,
    key_record: Option<&SecretRecord>,
) -> Result<CertificateAuthority> {
    let mut ca = CertificateAuthority::new(settings.clone());

    if let Some(record) = key_record {
        ca.key = record.value(CA_KEY).map(<[u8]>::to_vec).unwrap_or_default();
        ca.key_generation = parse_generation(record, CA_KEY_GENERATION)?.unwrap_or(0);
    }

    if let Some(record) = cert_record {
        ca.certs = CaCertBundle::from_entries(record.data.clone());
        ca.cert_generation = parse_generation(record, CA_CERT_GENERATION)?.unwrap_or(0);
    }

    if !settings.self_managed {
        if !ca.has_key() {
            return Err(FleetCaError::MissingCaMaterial {
                record: record_label(key_record, "CA key record"),
                key: CA_KEY.to_string(),
            });
        }
        if ca.certificate().is_none() {
            return Err(FleetCaError::MissingCaMaterial {
                record: record_label(cert_record, "CA certificate record"),
                key: CA_CRT.to_string(),
            });
        }
    }

    Ok(ca)
}

/// The key record for `ca`, keeping foreign annotations of `previous`.
pub fn ca_key_record(
    ca: &CertificateAuthority,
    namespace: &str,
    name: &str,
    previous: Option<&SecretRecord>,
    clear_force_replace: bool,
) -> SecretRecord {
    let mut record = base_record(namespace, name, previous);
    record.data.clear();
    record.data.insert(CA_KEY.to_string(), ca.key.clone());
    record
        .annotations
        .insert(CA_KEY_GENERATION.to_string(), ca.key_generation.to_string());
    if clear_force_replace {
        record.annotations.remove(FORCE_REPLACE);
    }
    record
}

/// The certificate record for `ca`, keeping foreign annotations of `previous`.
pub fn ca_cert_record(
    ca: &CertificateAuthority,
    namespace: &str,
    name: &str,
    previous: Option<&SecretRecord>,
    clear_force_renew: bool,
) -> SecretRecord {
    let mut record = base_record(namespace, name, previous);
    record.data = ca.certs.entries().clone();
    record
        .annotations
        .insert(CA_CERT_GENERATION.to_string(), ca.cert_generation.to_string());
    if clear_force_renew {
        record.annotations.remove(FORCE_RENEW);
    }
    record
}

/// Load a dependent group's credentials. Replica entries that do not follow
/// the `<prefix>-<index>.<suffix>` layout are ignored.
pub fn load_dependent_set(
    record: &SecretRecord,
    group: &str,
    replica_prefix: &str,
    generation_annotation: &str,
) -> Result<DependentCredentialSet> {
    let mut set = DependentCredentialSet::new(group, replica_prefix);
    set.ca_cert_generation = parse_generation(record, generation_annotation)?;

    let indices = record
        .data
        .keys()
        .filter_map(|key| replica_index(key, replica_prefix))
        .collect::<std::collections::BTreeSet<_>>();

    for index in indices {
        let name = set.replica_name(index);
        let value = |suffix: &str| record.value(&entry_key(&name, suffix)).map(<[u8]>::to_vec);

        let credential = StoredCredential {
            private_key: value(KEY_SUFFIX).unwrap_or_default(),
            certificate: value(CERT_SUFFIX).unwrap_or_default(),
            key_store: value(STORE_SUFFIX),
            password: value(PASSWORD_SUFFIX).map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        };
        set.credentials.insert(index, credential);
    }

    Ok(set)
}

/// The record for a dependent group. Data is rebuilt from `set` so replicas
/// removed by a scale-down disappear.
pub fn dependent_record(
    set: &DependentCredentialSet,
    namespace: &str,
    name: &str,
    previous: Option<&SecretRecord>,
    generation_annotation: &str,
) -> SecretRecord {
    let mut record = base_record(namespace, name, previous);
    record.data.clear();

    for (index, credential) in &set.credentials {
        let replica = set.replica_name(*index);
        record
            .data
            .insert(entry_key(&replica, KEY_SUFFIX), credential.private_key.clone());
        record
            .data
            .insert(entry_key(&replica, CERT_SUFFIX), credential.certificate.clone());
        if let Some(key_store) = &credential.key_store {
            record
                .data
                .insert(entry_key(&replica, STORE_SUFFIX), key_store.clone());
        }
        if let Some(password) = &credential.password {
            record
                .data
                .insert(entry_key(&replica, PASSWORD_SUFFIX), password.clone().into_bytes());
        }
    }

    match set.ca_cert_generation {
        Some(generation) => {
            record
                .annotations
                .insert(generation_annotation.to_string(), generation.to_string());
        }
        None => {
            record.annotations.remove(generation_annotation);
        }
    }
    record
}

fn base_record(namespace: &str, name: &str, previous: Option<&SecretRecord>) -> SecretRecord {
    match previous {
        Some(previous) => SecretRecord {
            namespace: namespace.to_string(),
            name: name.to_string(),
            data: previous.data.clone(),
            annotations: previous.annotations.clone(),
        },
        None => SecretRecord::new(namespace, name),
    }
}

fn record_label(record: Option<&SecretRecord>, fallback: &str) -> String {
    record
        .map(|record| format!("{}/{}", record.namespace, record.name))
        .unwrap_or_else(|| fallback.to_string())
}

fn entry_key(replica: &str, suffix: &str) -> String {
    format!("{}.{}", replica, suffix)
}

fn replica_index(key: &str, replica_prefix: &str) -> Option<usize> {
    let rest = key.strip_prefix(replica_prefix)?.strip_prefix('-')?;
    let (index, suffix) = rest.split_once('.')?;
    if ![KEY_SUFFIX, CERT_SUFFIX, STORE_SUFFIX, PASSWORD_SUFFIX].contains(&suffix) {
        return None;
    }
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record_with(annotations: &[(&str, &str)]) -> SecretRecord {
        let mut record = SecretRecord::new("fleet", "cluster-ca-cert");
        record.annotations = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        record
    }

    #[test]
    fn test_annotations_share_prefix() {
        for annotation in [
            FORCE_RENEW,
            FORCE_REPLACE,
            CA_CERT_GENERATION,
            CA_KEY_GENERATION,
            CLUSTER_CA_CERT_GENERATION,
            CLIENTS_CA_CERT_GENERATION,
        ] {
            assert!(annotation.starts_with(ANNOTATION_PREFIX), "{}", annotation);
        }
    }

    #[test]
    fn test_parse_generation() {
        assert_eq!(parse_generation(&record_with(&[]), CA_CERT_GENERATION).unwrap(), None);
        assert_eq!(
            parse_generation(&record_with(&[(CA_CERT_GENERATION, "4")]), CA_CERT_GENERATION).unwrap(),
            Some(4)
        );
        assert!(matches!(
            parse_generation(&record_with(&[(CA_CERT_GENERATION, "-1")]), CA_CERT_GENERATION),
            Err(FleetCaError::InvalidAnnotation { .. })
        ));
    }

    #[test]
    fn test_flags() {
        let record = record_with(&[(FORCE_RENEW, "TRUE"), (FORCE_REPLACE, "no")]);
        assert!(is_flag_set(Some(&record), FORCE_RENEW));
        assert!(!is_flag_set(Some(&record), FORCE_REPLACE));
        assert!(!is_flag_set(None, FORCE_RENEW));
    }

    #[test]
    fn test_external_ca_requires_material() {
        let settings = CaSettings {
            self_managed: false,
            ..Default::default()
        };
        let mut key = SecretRecord::new("fleet", "cluster-ca");
        key.data.insert(CA_KEY.to_string(), b"key".to_vec());

        let result = load_ca(&settings, None, Some(&key));
        match result {
            Err(FleetCaError::MissingCaMaterial { key, .. }) => assert_eq!(key, CA_CRT),
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(load_ca(&CaSettings::default(), None, None).is_ok());
    }

    #[test]
    fn test_ca_records_roundtrip() {
        let mut ca = CertificateAuthority::new(CaSettings::default());
        ca.key = b"key".to_vec();
        ca.certs.insert(CA_CRT, b"cert".to_vec());
        ca.cert_generation = 3;
        ca.key_generation = 1;

        let previous = record_with(&[(FORCE_RENEW, "true"), ("owner", "ops")]);
        let cert = ca_cert_record(&ca, "fleet", "cluster-ca-cert", Some(&previous), true);
        let key = ca_key_record(&ca, "fleet", "cluster-ca", None, false);

        assert_eq!(cert.annotation("owner"), Some("ops"));
        assert_eq!(cert.annotation(FORCE_RENEW), None);
        assert_eq!(cert.annotation(CA_CERT_GENERATION), Some("3"));
        assert_eq!(key.annotation(CA_KEY_GENERATION), Some("1"));

        let loaded = load_ca(&CaSettings::default(), Some(&cert), Some(&key)).unwrap();
        assert_eq!(loaded, ca);
    }

    #[test]
    fn test_replica_index() {
        assert_eq!(replica_index("fleet-broker-12.crt", "fleet-broker"), Some(12));
        assert_eq!(replica_index("fleet-broker-1.password", "fleet-broker"), Some(1));
        assert_eq!(replica_index("fleet-broker-x.crt", "fleet-broker"), None);
        assert_eq!(replica_index("fleet-broker-1.pem", "fleet-broker"), None);
        assert_eq!(replica_index("other-1.crt", "fleet-broker"), None);
    }

    #[test]
    fn test_dependent_record_roundtrip() {
        let mut set = DependentCredentialSet::new("brokers", "fleet-broker");
        set.ca_cert_generation = Some(2);
        set.credentials.insert(
            0,
            StoredCredential {
                private_key: b"k0".to_vec(),
                certificate: b"c0".to_vec(),
                key_store: Some(b"p0".to_vec()),
                password: Some("pw0".to_string()),
            },
        );
        set.credentials.insert(
            1,
            StoredCredential {
                private_key: b"k1".to_vec(),
                certificate: b"c1".to_vec(),
                key_store: None,
                password: None,
            },
        );

        let record = dependent_record(&set, "fleet", "brokers-certs", None, CLUSTER_CA_CERT_GENERATION);
        assert_eq!(record.value("fleet-broker-0.p12"), Some(&b"p0"[..]));
        assert!(record.value("fleet-broker-1.p12").is_none());

        let loaded =
            load_dependent_set(&record, "brokers", "fleet-broker", CLUSTER_CA_CERT_GENERATION).unwrap();
        assert_eq!(loaded, set);
    }
}
