//! One reconciliation pass for one CA kind.
//!
//! The reconciler loads the CA and dependent records, runs the lifecycle
//! engine, persists the CA (key record first, then certificate record) and
//! then issues and persists every dependent group. A crash between any two
//! writes is recovered on the next pass from the generation annotations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::ca::decision::CaCapability;
use crate::ca::lifecycle::{reconcile_ca, CaReconcileOutcome, CaReconcileRequest};
use crate::config::{CaConfig, Config};
use crate::error::Result;
use crate::issuance::{issue_or_reuse, IssuanceOutcome, IssuanceRequest};
use crate::pki::subject::Subject;
use crate::store::records::{
    ca_cert_record, ca_key_record, dependent_record, is_flag_set, load_ca, load_dependent_set,
    parse_generation, FORCE_RENEW, FORCE_REPLACE,
};
use crate::store::{SecretRecord, SecretStore};

/// A group of replicas whose leaf credentials are signed by the CA.
pub struct DependentGroup<'a> {
    /// Record holding the group's credentials.
    pub record: String,
    pub group: String,
    pub replica_prefix: String,
    pub desired_replicas: usize,
    /// Desired subject of replica `i`.
    pub subject_fn: &'a dyn Fn(usize) -> Subject,
}

impl fmt::Debug for DependentGroup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentGroup")
            .field("record", &self.record)
            .field("group", &self.group)
            .field("replica_prefix", &self.replica_prefix)
            .field("desired_replicas", &self.desired_replicas)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub ca: CaReconcileOutcome,
    /// Issuance outcome per group name.
    pub groups: BTreeMap<String, IssuanceOutcome>,
    /// Names of records written during the pass, in write order.
    pub written: Vec<String>,
}

pub struct CaReconciler {
    store: Arc<dyn SecretStore>,
    namespace: String,
    config: CaConfig,
    capability: CaCapability,
}

impl CaReconciler {
    pub fn new(
        store: Arc<dyn SecretStore>,
        namespace: impl Into<String>,
        config: CaConfig,
        capability: CaCapability,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            config,
            capability,
        }
    }

    pub fn cluster(store: Arc<dyn SecretStore>, config: &Config) -> Self {
        Self::new(
            store,
            config.namespace.clone(),
            config.cluster_ca.clone(),
            CaCapability::cluster(),
        )
    }

    pub fn clients(store: Arc<dyn SecretStore>, config: &Config) -> Self {
        Self::new(
            store,
            config.namespace.clone(),
            config.clients_ca.clone(),
            CaCapability::clients(),
        )
    }

    /// Run one pass. Errors abort the pass; records already written stay
    /// consistent with their annotations.
    pub fn reconcile(
        &self,
        groups: &[DependentGroup<'_>],
        maintenance_window_open: bool,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport> {
        let cert_record = self.store.get(&self.namespace, &self.config.cert_record)?;
        let key_record = self.store.get(&self.namespace, &self.config.key_record)?;
        let ca = load_ca(&self.config.settings, cert_record.as_ref(), key_record.as_ref())?;

        let mut dependent_records = Vec::with_capacity(groups.len());
        let mut dependent_generations = Vec::with_capacity(groups.len());
        for group in groups {
            let record = self.store.get(&self.namespace, &group.record)?;
            if let Some(record) = &record {
                dependent_generations.push(parse_generation(
                    record,
                    self.capability.dependent_generation_annotation,
                )?);
            }
            dependent_records.push(record);
        }

        let request = CaReconcileRequest {
            force_renew: is_flag_set(cert_record.as_ref(), FORCE_RENEW),
            force_replace: is_flag_set(key_record.as_ref(), FORCE_REPLACE),
            maintenance_window_open,
            dependent_generations,
        };
        let outcome = reconcile_ca(&ca, &request, &self.capability, now)?;

        let mut written = Vec::new();
        if self.config.settings.self_managed {
            let key = ca_key_record(
                &outcome.ca,
                &self.namespace,
                &self.config.key_record,
                key_record.as_ref(),
                outcome.force_replace_consumed,
            );
            self.write_if_changed(key, key_record.as_ref(), &mut written)?;

            let cert = ca_cert_record(
                &outcome.ca,
                &self.namespace,
                &self.config.cert_record,
                cert_record.as_ref(),
                outcome.force_renew_consumed,
            );
            self.write_if_changed(cert, cert_record.as_ref(), &mut written)?;
        }

        let mut issued = BTreeMap::new();
        for (group, previous) in groups.iter().zip(dependent_records.iter()) {
            let existing = previous
                .as_ref()
                .map(|record| {
                    load_dependent_set(
                        record,
                        &group.group,
                        &group.replica_prefix,
                        self.capability.dependent_generation_annotation,
                    )
                })
                .transpose()?;

            let issuance = IssuanceRequest {
                group: group.group.clone(),
                replica_prefix: group.replica_prefix.clone(),
                desired_replicas: group.desired_replicas,
                ca_decision: outcome.decision,
                maintenance_window_open,
            };
            let result = issue_or_reuse(
                &outcome.ca,
                &issuance,
                group.subject_fn,
                existing.as_ref(),
                now,
            )?;

            let record = dependent_record(
                &result.set,
                &self.namespace,
                &group.record,
                previous.as_ref(),
                self.capability.dependent_generation_annotation,
            );
            self.write_if_changed(record, previous.as_ref(), &mut written)?;
            issued.insert(group.group.clone(), result);
        }

        info!(
            ca = %self.capability.kind.display_name(),
            decision = %outcome.decision,
            groups = groups.len(),
            written = written.len(),
            "Reconciliation pass complete"
        );

        Ok(ReconcileReport {
            ca: outcome,
            groups: issued,
            written,
        })
    }

    fn write_if_changed(
        &self,
        record: SecretRecord,
        previous: Option<&SecretRecord>,
        written: &mut Vec<String>,
    ) -> Result<()> {
        if previous == Some(&record) {
            debug!(name = %record.name, "Record unchanged");
            return Ok(());
        }

        self.store.put(&record)?;
        written.push(record.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::decision::RenewalType;
    use crate::store::InMemorySecretStore;

    fn broker_subject(index: usize) -> Subject {
        Subject::builder(format!("fleet-broker-{}", index))
            .with_dns_name(format!("fleet-broker-{}.brokers.svc", index))
            .build()
    }

    fn brokers(desired: usize) -> DependentGroup<'static> {
        DependentGroup {
            record: "brokers-certs".to_string(),
            group: "brokers".to_string(),
            replica_prefix: "fleet-broker".to_string(),
            desired_replicas: desired,
            subject_fn: &broker_subject,
        }
    }

    #[test]
    fn test_first_pass_writes_key_before_cert() {
        let store = Arc::new(InMemorySecretStore::new());
        let reconciler = CaReconciler::cluster(store.clone(), &Config::default());

        let report = reconciler.reconcile(&[brokers(2)], false, Utc::now()).unwrap();

        assert_eq!(report.ca.decision, RenewalType::Create);
        assert_eq!(
            report.written,
            vec!["cluster-ca", "cluster-ca-cert", "brokers-certs"]
        );
        assert_eq!(report.groups["brokers"].set.len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_second_pass_writes_nothing() {
        let store = Arc::new(InMemorySecretStore::new());
        let reconciler = CaReconciler::cluster(store, &Config::default());
        let now = Utc::now();
        reconciler.reconcile(&[brokers(2)], true, now).unwrap();

        let report = reconciler.reconcile(&[brokers(2)], true, now).unwrap();

        assert_eq!(report.ca.decision, RenewalType::Noop);
        assert!(report.written.is_empty());
    }
}
