//! CA renewal decisions.
//!
//! [`decide`] is the precedence chain that picks a [`RenewalType`]. Message
//! and severity formatting live in free functions so the enum stays plain data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Level;

use super::model::{CertificateAuthority, ExpirationPolicy};
use crate::pki::inspect::{key_matches_certificate, summarize};

/// Outcome of one CA reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenewalType {
    Noop,
    Postponed,
    Create,
    RenewCert,
    ReplaceKey,
}

impl RenewalType {
    /// Whether the CA certificate changed in this pass, invalidating every
    /// leaf certificate signed before it.
    pub fn rotates_ca(self) -> bool {
        matches!(
            self,
            RenewalType::Create | RenewalType::RenewCert | RenewalType::ReplaceKey
        )
    }
}

impl fmt::Display for RenewalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenewalType::Noop => "NOOP",
            RenewalType::Postponed => "POSTPONED",
            RenewalType::Create => "CREATE",
            RenewalType::RenewCert => "RENEW_CERT",
            RenewalType::ReplaceKey => "REPLACE_KEY",
        };
        f.write_str(name)
    }
}

/// Which CA a reconciliation is about. Two kinds can coexist without their
/// annotations colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaKind {
    Cluster,
    Clients,
}

impl CaKind {
    pub fn display_name(self) -> &'static str {
        match self {
            CaKind::Cluster => "Cluster CA",
            CaKind::Clients => "Clients CA",
        }
    }
}

/// Detects whether dependents were issued under another CA generation.
///
/// Receives the CA certGeneration and the mirrored generation of every
/// dependent record (`None` when the record carries no mirror).
pub type ChangeDetector = fn(u32, &[Option<u32>]) -> bool;

/// Per-kind parameters of the otherwise generic lifecycle engine.
#[derive(Debug, Clone, Copy)]
pub struct CaCapability {
    pub kind: CaKind,
    /// Annotation mirroring the CA certGeneration on dependent records.
    pub dependent_generation_annotation: &'static str,
    pub change_detector: ChangeDetector,
}

impl CaCapability {
    pub fn cluster() -> Self {
        Self {
            kind: CaKind::Cluster,
            dependent_generation_annotation: crate::store::records::CLUSTER_CA_CERT_GENERATION,
            change_detector: any_generation_mismatch,
        }
    }

    pub fn clients() -> Self {
        Self {
            kind: CaKind::Clients,
            dependent_generation_annotation: crate::store::records::CLIENTS_CA_CERT_GENERATION,
            change_detector: any_generation_mismatch_or_missing,
        }
    }
}

/// Mismatch only when a dependent carries a different generation.
pub fn any_generation_mismatch(ca_generation: u32, dependents: &[Option<u32>]) -> bool {
    dependents
        .iter()
        .flatten()
        .any(|generation| *generation != ca_generation)
}

/// Like [`any_generation_mismatch`], but a dependent without a mirror counts
/// as out of date too.
pub fn any_generation_mismatch_or_missing(ca_generation: u32, dependents: &[Option<u32>]) -> bool {
    dependents
        .iter()
        .any(|generation| *generation != Some(ca_generation))
}

/// Inputs of a decision besides the CA itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionInput {
    pub force_renew: bool,
    pub force_replace: bool,
    pub maintenance_window_open: bool,
}

/// The self-managed precedence chain. The first matching branch wins:
///
/// 1. no key → `Create`
/// 2. no usable certificate → `RenewCert`
/// 3. forced renewal → `RenewCert`, or `Postponed` outside the window
/// 4. forced key replacement → `ReplaceKey`, or `Postponed` outside the window
/// 5. certificate in its renewal window → the expiration policy, or `Postponed`
/// 6. `Noop`
pub fn decide(ca: &CertificateAuthority, input: &DecisionInput, now: DateTime<Utc>) -> RenewalType {
    if !ca.has_key() {
        return RenewalType::Create;
    }

    let certificate = match ca.certificate() {
        Some(certificate) if !certificate_belongs_to_other_key(&ca.key, certificate) => certificate,
        _ => return RenewalType::RenewCert,
    };

    let within_window = |action: RenewalType| {
        if input.maintenance_window_open {
            action
        } else {
            RenewalType::Postponed
        }
    };

    if input.force_renew {
        return within_window(RenewalType::RenewCert);
    }

    if input.force_replace {
        return within_window(RenewalType::ReplaceKey);
    }

    // An unparseable certificate skips the expiry branch.
    if let Ok(summary) = summarize(certificate) {
        if summary.in_renewal_window(ca.settings.renewal_days, now) {
            let action = match ca.settings.expiration_policy {
                ExpirationPolicy::RenewCertificate => RenewalType::RenewCert,
                ExpirationPolicy::ReplaceKey => RenewalType::ReplaceKey,
            };
            return within_window(action);
        }
    }

    RenewalType::Noop
}

/// Observation for externally managed CAs: dependents out of step with the
/// supplied CA are reported as `ReplaceKey`, nothing is ever acted on.
pub fn observe(
    ca: &CertificateAuthority,
    capability: &CaCapability,
    dependent_generations: &[Option<u32>],
) -> RenewalType {
    if (capability.change_detector)(ca.cert_generation, dependent_generations) {
        RenewalType::ReplaceKey
    } else {
        RenewalType::Noop
    }
}

// A parseable certificate whose public key is not the stored key is left over
// from an interrupted write of the key and certificate records.
fn certificate_belongs_to_other_key(key: &[u8], certificate: &[u8]) -> bool {
    matches!(key_matches_certificate(key, certificate), Ok(false))
}

/// Human readable description of a decision.
pub fn renewal_message(kind: CaKind, renewal: RenewalType) -> String {
    let ca = kind.display_name();
    match renewal {
        RenewalType::Noop => format!("{} certificate is up to date", ca),
        RenewalType::Postponed => format!(
            "{} certificate renewal is pending but postponed until the next maintenance window",
            ca
        ),
        RenewalType::Create => format!("{} key and certificate will be created", ca),
        RenewalType::RenewCert => format!("{} certificate will be renewed", ca),
        RenewalType::ReplaceKey => format!("{} key will be replaced", ca),
    }
}

/// Severity at which a decision is reported.
pub fn severity(renewal: RenewalType) -> Level {
    match renewal {
        RenewalType::Noop => Level::DEBUG,
        RenewalType::Postponed => Level::WARN,
        RenewalType::Create | RenewalType::RenewCert | RenewalType::ReplaceKey => Level::INFO,
    }
}
