//! Per-replica certificate issuance
//!
//! [`issue_or_reuse`] produces exactly one leaf credential per desired
//! replica of a dependent group. Valid credentials from the previous pass are
//! copied byte for byte; anything that cannot be proven current is issued
//! again under the CA.

pub mod credential_set;

pub use credential_set::{DependentCredentialSet, StoredCredential};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ca::decision::RenewalType;
use crate::ca::model::{CertificateAuthority, CA_CRT, CA_KEY};
use crate::error::{FleetCaError, Result};
use crate::pki::inspect::{signed_by, summarize};
use crate::pki::primitive::{issue, Signer};
use crate::pki::subject::Subject;
use credential_set::replica_name;

/// Why a replica's credential was issued in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssuanceReason {
    /// Index beyond the reusable part of the existing set.
    NewReplica,
    /// The CA certificate changed in this pass.
    CaRotated,
    /// The set was written under another CA generation.
    GenerationMismatch,
    /// The desired SAN set differs from the certificate's.
    SubjectChanged,
    /// The certificate is inside its renewal window.
    RenewalDue,
    MissingCredential,
    UnparseableCertificate,
    /// The certificate was not signed by the current CA key.
    IssuerChanged,
}

impl fmt::Display for IssuanceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(issuance_reason_message(*self))
    }
}

pub fn issuance_reason_message(reason: IssuanceReason) -> &'static str {
    match reason {
        IssuanceReason::NewReplica => "new replica",
        IssuanceReason::CaRotated => "CA certificate was rotated",
        IssuanceReason::GenerationMismatch => "issued under a different CA generation",
        IssuanceReason::SubjectChanged => "subject alternative names changed",
        IssuanceReason::RenewalDue => "certificate is due for renewal",
        IssuanceReason::MissingCredential => "no usable credential stored",
        IssuanceReason::UnparseableCertificate => "stored certificate could not be parsed",
        IssuanceReason::IssuerChanged => "certificate was not signed by the current CA",
    }
}

/// Parameters of one [`issue_or_reuse`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    pub group: String,
    pub replica_prefix: String,
    pub desired_replicas: usize,
    /// Decision the CA lifecycle engine took in the same pass.
    pub ca_decision: RenewalType,
    pub maintenance_window_open: bool,
}

/// The new credential set and what happened to each index.
#[derive(Debug, Clone)]
pub struct IssuanceOutcome {
    pub set: DependentCredentialSet,
    pub regenerated: BTreeMap<usize, Vec<IssuanceReason>>,
    pub copied: BTreeSet<usize>,
    /// Subset of `copied` repackaged from a legacy entry.
    pub migrated: BTreeSet<usize>,
}

impl IssuanceOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.regenerated.is_empty() && self.migrated.is_empty()
    }
}

/// Produce exactly `request.desired_replicas` leaf credentials signed by `ca`.
///
/// The existing set is reused only when the CA did not rotate in this pass and
/// the set's mirrored generation equals `ca.cert_generation`. Within the
/// reusable range a credential is copied unless its SANs differ from
/// `subject_fn(i)`, it is due for renewal while the maintenance window is
/// open, or it is missing, unparseable or signed by another key.
pub fn issue_or_reuse<F>(
    ca: &CertificateAuthority,
    request: &IssuanceRequest,
    subject_fn: F,
    existing: Option<&DependentCredentialSet>,
    now: DateTime<Utc>,
) -> Result<IssuanceOutcome>
where
    F: Fn(usize) -> Subject,
{
    let ca_certificate = ca.certificate().ok_or_else(|| FleetCaError::MissingCaMaterial {
        record: "CA certificate record".to_string(),
        key: CA_CRT.to_string(),
    })?;
    if !ca.has_key() {
        return Err(FleetCaError::MissingCaMaterial {
            record: "CA key record".to_string(),
            key: CA_KEY.to_string(),
        });
    }
    let signer = Signer::new(&ca.key, ca_certificate);

    let (existing_count, fresh_reason) = reusable_count(ca, request, existing);

    let mut set = DependentCredentialSet::new(request.group.clone(), request.replica_prefix.clone());
    let mut regenerated = BTreeMap::new();
    let mut copied = BTreeSet::new();
    let mut migrated = BTreeSet::new();

    for index in 0..request.desired_replicas {
        let name = replica_name(&request.replica_prefix, index);
        let subject = subject_fn(index);

        let reasons = match existing.and_then(|set| set.get(index)) {
            Some(stored) if index < existing_count => {
                let reasons = regeneration_reasons(
                    stored,
                    &subject,
                    ca_certificate,
                    ca.settings.renewal_days,
                    request.maintenance_window_open,
                    now,
                );
                if reasons.is_empty() && !stored.is_legacy() {
                    copied.insert(index);
                    set.credentials.insert(index, stored.clone());
                    continue;
                }
                if reasons.is_empty() {
                    match stored.migrate(&name, Some(ca_certificate)) {
                        Ok(kept) => {
                            debug!(replica = %name, "Repackaged legacy credential into a keystore");
                            migrated.insert(index);
                            copied.insert(index);
                            set.credentials.insert(index, kept);
                            continue;
                        }
                        Err(e) => {
                            warn!(replica = %name, error = %e, "Legacy credential could not be repackaged");
                            vec![IssuanceReason::MissingCredential]
                        }
                    }
                } else {
                    reasons
                }
            }
            None if index < existing_count => vec![IssuanceReason::MissingCredential],
            _ => vec![fresh_reason],
        };

        let credential = issue(
            &subject,
            Some(signer),
            ca.settings.validity_days,
            ca.settings.key_type,
            now,
        )?;
        info!(
            group = %request.group,
            replica = %name,
            reason = %reasons_message(&reasons),
            "Issued certificate"
        );
        set.credentials.insert(index, credential.into());
        regenerated.insert(index, reasons);
    }

    set.ca_cert_generation = Some(ca.cert_generation);

    debug!(
        group = %request.group,
        desired = request.desired_replicas,
        regenerated = regenerated.len(),
        copied = copied.len(),
        migrated = migrated.len(),
        "Dependent credentials reconciled"
    );

    Ok(IssuanceOutcome {
        set,
        regenerated,
        copied,
        migrated,
    })
}

fn reusable_count(
    ca: &CertificateAuthority,
    request: &IssuanceRequest,
    existing: Option<&DependentCredentialSet>,
) -> (usize, IssuanceReason) {
    let existing = match existing {
        Some(set) if !set.is_empty() => set,
        _ => return (0, IssuanceReason::NewReplica),
    };

    if request.ca_decision.rotates_ca() {
        return (0, IssuanceReason::CaRotated);
    }

    if existing.ca_cert_generation != Some(ca.cert_generation) {
        debug!(
            group = %request.group,
            mirrored = ?existing.ca_cert_generation,
            current = ca.cert_generation,
            "Dependent set written under another CA generation"
        );
        return (0, IssuanceReason::GenerationMismatch);
    }

    (
        existing.len().min(request.desired_replicas),
        IssuanceReason::NewReplica,
    )
}

fn regeneration_reasons(
    stored: &StoredCredential,
    subject: &Subject,
    ca_certificate: &[u8],
    renewal_days: u32,
    maintenance_window_open: bool,
    now: DateTime<Utc>,
) -> Vec<IssuanceReason> {
    if !stored.is_usable() {
        return vec![IssuanceReason::MissingCredential];
    }

    let summary = match summarize(&stored.certificate) {
        Ok(summary) => summary,
        Err(_) => return vec![IssuanceReason::UnparseableCertificate],
    };

    let mut reasons = Vec::new();
    if summary.subject_alt_names != subject.subject_alt_names {
        reasons.push(IssuanceReason::SubjectChanged);
    }
    if maintenance_window_open && summary.in_renewal_window(renewal_days, now) {
        reasons.push(IssuanceReason::RenewalDue);
    }
    if matches!(signed_by(&stored.certificate, ca_certificate), Ok(false)) {
        reasons.push(IssuanceReason::IssuerChanged);
    }
    reasons
}

fn reasons_message(reasons: &[IssuanceReason]) -> String {
    reasons
        .iter()
        .map(|reason| issuance_reason_message(*reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::lifecycle::{reconcile_ca, CaReconcileRequest};
    use crate::ca::decision::CaCapability;
    use crate::ca::model::CaSettings;
    use crate::pki::keystore;
    use chrono::Duration;

    fn ca(now: DateTime<Utc>) -> CertificateAuthority {
        let request = CaReconcileRequest {
            maintenance_window_open: true,
            ..Default::default()
        };
        reconcile_ca(
            &CertificateAuthority::new(CaSettings::default()),
            &request,
            &CaCapability::cluster(),
            now,
        )
        .unwrap()
        .ca
    }

    fn request(desired: usize, decision: RenewalType) -> IssuanceRequest {
        IssuanceRequest {
            group: "brokers".to_string(),
            replica_prefix: "fleet-broker".to_string(),
            desired_replicas: desired,
            ca_decision: decision,
            maintenance_window_open: true,
        }
    }

    fn subject(index: usize) -> Subject {
        Subject::builder(format!("fleet-broker-{}", index))
            .with_dns_name(format!("fleet-broker-{}.brokers.svc", index))
            .build()
    }

    #[test]
    fn test_first_issuance() {
        let now = Utc::now();
        let ca = ca(now);

        let outcome = issue_or_reuse(&ca, &request(3, RenewalType::Create), subject, None, now).unwrap();

        assert_eq!(outcome.set.len(), 3);
        assert_eq!(outcome.set.ca_cert_generation, Some(0));
        assert_eq!(outcome.regenerated[&0], vec![IssuanceReason::NewReplica]);
        assert!(outcome.copied.is_empty());

        let stored = outcome.set.get(1).unwrap();
        assert!(!stored.is_legacy());
        let summary = summarize(&stored.certificate).unwrap();
        assert_eq!(summary.subject_alt_names, subject(1).subject_alt_names);
        assert!(signed_by(&stored.certificate, ca.certificate().unwrap()).unwrap());
    }

    #[test]
    fn test_second_pass_copies_everything() {
        let now = Utc::now();
        let ca = ca(now);
        let first = issue_or_reuse(&ca, &request(2, RenewalType::Noop), subject, None, now).unwrap();

        let second =
            issue_or_reuse(&ca, &request(2, RenewalType::Noop), subject, Some(&first.set), now).unwrap();

        assert!(second.is_unchanged());
        assert_eq!(second.set, first.set);
    }

    #[test]
    fn test_ca_rotation_regenerates_everything() {
        let now = Utc::now();
        let ca = ca(now);
        let first = issue_or_reuse(&ca, &request(2, RenewalType::Noop), subject, None, now).unwrap();

        let outcome =
            issue_or_reuse(&ca, &request(2, RenewalType::RenewCert), subject, Some(&first.set), now).unwrap();

        assert!(outcome.copied.is_empty());
        assert_eq!(outcome.regenerated[&1], vec![IssuanceReason::CaRotated]);
    }

    #[test]
    fn test_san_change_regenerates_only_that_replica() {
        let now = Utc::now();
        let ca = ca(now);
        let first = issue_or_reuse(&ca, &request(3, RenewalType::Noop), subject, None, now).unwrap();

        let changed = |index: usize| {
            if index == 1 {
                Subject::builder("fleet-broker-1")
                    .with_dns_name("fleet-broker-1.brokers.svc")
                    .with_dns_name("broker.example.com")
                    .build()
            } else {
                subject(index)
            }
        };
        let outcome =
            issue_or_reuse(&ca, &request(3, RenewalType::Noop), changed, Some(&first.set), now).unwrap();

        assert_eq!(outcome.regenerated.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(outcome.regenerated[&1], vec![IssuanceReason::SubjectChanged]);
        assert_eq!(outcome.set.get(0), first.set.get(0));
        assert_eq!(outcome.set.get(2), first.set.get(2));
    }

    #[test]
    fn test_renewal_waits_for_maintenance_window() {
        let now = Utc::now();
        let ca = ca(now);
        let first = issue_or_reuse(&ca, &request(1, RenewalType::Noop), subject, None, now).unwrap();
        let later = now + Duration::days(340);

        let mut closed = request(1, RenewalType::Noop);
        closed.maintenance_window_open = false;
        let outcome = issue_or_reuse(&ca, &closed, subject, Some(&first.set), later).unwrap();
        assert!(outcome.is_unchanged());

        let outcome =
            issue_or_reuse(&ca, &request(1, RenewalType::Noop), subject, Some(&first.set), later).unwrap();
        assert_eq!(outcome.regenerated[&0], vec![IssuanceReason::RenewalDue]);
    }

    #[test]
    fn test_generation_mismatch_forces_full_regeneration() {
        let now = Utc::now();
        let ca = ca(now);
        let mut first = issue_or_reuse(&ca, &request(2, RenewalType::Noop), subject, None, now).unwrap();
        first.set.ca_cert_generation = Some(7);

        let outcome =
            issue_or_reuse(&ca, &request(2, RenewalType::Noop), subject, Some(&first.set), now).unwrap();

        assert_eq!(outcome.regenerated.len(), 2);
        assert_eq!(outcome.regenerated[&0], vec![IssuanceReason::GenerationMismatch]);
        assert_eq!(outcome.set.ca_cert_generation, Some(0));
    }

    #[test]
    fn test_legacy_entry_is_migrated() {
        let now = Utc::now();
        let ca = ca(now);
        let mut first = issue_or_reuse(&ca, &request(1, RenewalType::Noop), subject, None, now).unwrap();
        let legacy = first.set.credentials.get_mut(&0).unwrap();
        legacy.key_store = None;
        legacy.password = None;

        let outcome =
            issue_or_reuse(&ca, &request(1, RenewalType::Noop), subject, Some(&first.set), now).unwrap();

        assert!(outcome.regenerated.is_empty());
        assert!(outcome.migrated.contains(&0));
        let migrated = outcome.set.get(0).unwrap();
        assert_eq!(migrated.certificate, first.set.get(0).unwrap().certificate);
        let contents = keystore::open(
            migrated.key_store.as_ref().unwrap(),
            migrated.password.as_ref().unwrap(),
        )
        .unwrap();
        assert_eq!(contents.keys.len(), 1);
    }

    #[test]
    fn test_corrupt_certificate_is_regenerated() {
        let now = Utc::now();
        let ca = ca(now);
        let mut first = issue_or_reuse(&ca, &request(1, RenewalType::Noop), subject, None, now).unwrap();
        first.set.credentials.get_mut(&0).unwrap().certificate = b"garbage".to_vec();

        let outcome =
            issue_or_reuse(&ca, &request(1, RenewalType::Noop), subject, Some(&first.set), now).unwrap();

        assert_eq!(outcome.regenerated[&0], vec![IssuanceReason::UnparseableCertificate]);
    }

    #[test]
    fn test_credential_from_other_ca_is_regenerated() {
        let now = Utc::now();
        let ours = ca(now);
        let theirs = ca(now);
        let foreign = issue_or_reuse(&theirs, &request(1, RenewalType::Noop), subject, None, now).unwrap();

        let outcome =
            issue_or_reuse(&ours, &request(1, RenewalType::Noop), subject, Some(&foreign.set), now).unwrap();

        assert_eq!(outcome.regenerated[&0], vec![IssuanceReason::IssuerChanged]);
    }

    #[test]
    fn test_ca_without_material_is_rejected() {
        let ca = CertificateAuthority::new(CaSettings::default());
        let result = issue_or_reuse(&ca, &request(1, RenewalType::Noop), subject, None, Utc::now());
        assert!(matches!(result, Err(FleetCaError::MissingCaMaterial { .. })));
    }

    #[test]
    fn test_reason_messages() {
        assert_eq!(IssuanceReason::RenewalDue.to_string(), "certificate is due for renewal");
        assert_eq!(
            reasons_message(&[IssuanceReason::SubjectChanged, IssuanceReason::RenewalDue]),
            "subject alternative names changed, certificate is due for renewal"
        );
    }
}
