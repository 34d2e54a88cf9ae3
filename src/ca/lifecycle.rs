//! CA lifecycle engine.
//!
//! [`reconcile_ca`] takes the persisted CA state, decides what has to happen
//! and returns the updated state in a [`CaReconcileOutcome`]. Nothing is
//! written here; the caller persists the outcome.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn, Level};

use super::decision::{decide, observe, renewal_message, severity, CaCapability, DecisionInput, RenewalType};
use super::model::{CaCertBundle, CertificateAuthority, CA_CRT, CA_KEY};
use crate::error::{FleetCaError, Result};
use crate::pki::inspect::key_matches_certificate;
use crate::pki::primitive::{issue, renew_self_signed};
use crate::pki::truststore::{purge_expired, rebuild_trust_store};

/// Per-pass inputs of [`reconcile_ca`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaReconcileRequest {
    pub force_renew: bool,
    pub force_replace: bool,
    pub maintenance_window_open: bool,
    /// Mirrored CA generation of every dependent record, `None` where absent.
    pub dependent_generations: Vec<Option<u32>>,
}

/// Result of one pass over a CA.
#[derive(Debug, Clone)]
pub struct CaReconcileOutcome {
    pub decision: RenewalType,
    pub ca: CertificateAuthority,
    /// The force-renew request was acted on and should be cleared.
    pub force_renew_consumed: bool,
    /// The force-replace request was acted on and should be cleared.
    pub force_replace_consumed: bool,
    /// Entries dropped from the certificate data set by the purge.
    pub certs_removed: usize,
    pub message: String,
}

impl CaReconcileOutcome {
    /// Whether the CA material differs from what was loaded.
    pub fn material_changed(&self) -> bool {
        self.decision.rotates_ca() || self.certs_removed > 0
    }
}

/// Run one reconciliation of `ca`.
///
/// Self-managed CAs go through [`decide`] and the matching transition, then
/// expired certificates are purged. Externally managed CAs are only observed
/// and returned untouched.
pub fn reconcile_ca(
    ca: &CertificateAuthority,
    request: &CaReconcileRequest,
    capability: &CaCapability,
    now: DateTime<Utc>,
) -> Result<CaReconcileOutcome> {
    if !ca.settings.self_managed {
        ensure_external_material(ca)?;
        let decision = observe(ca, capability, &request.dependent_generations);
        let message = renewal_message(capability.kind, decision);
        report(capability, decision, &message);

        return Ok(CaReconcileOutcome {
            decision,
            ca: ca.clone(),
            force_renew_consumed: false,
            force_replace_consumed: false,
            certs_removed: 0,
            message,
        });
    }

    let input = DecisionInput {
        force_renew: request.force_renew,
        force_replace: request.force_replace,
        maintenance_window_open: request.maintenance_window_open,
    };
    let mut decision = decide(ca, &input, now);

    let mut updated = match decision {
        RenewalType::Create => create(ca, now)?,
        RenewalType::RenewCert => renew_cert(ca, now)?,
        RenewalType::ReplaceKey => replace_key(ca, now)?,
        RenewalType::Noop | RenewalType::Postponed => ca.clone(),
    };

    let certs_removed = purge_expired(&mut updated.certs, now)?;
    if certs_removed > 0 {
        info!(
            ca = %capability.kind.display_name(),
            removed = certs_removed,
            "Removed expired certificates from CA data"
        );
    }

    // The purge may take the current certificate with it; a key without a
    // certificate is renewed regardless of the window.
    if updated.certificate().is_none() {
        decision = RenewalType::RenewCert;
        updated = renew_cert(&updated, now)?;
    }

    let message = renewal_message(capability.kind, decision);
    report(capability, decision, &message);

    Ok(CaReconcileOutcome {
        decision,
        force_renew_consumed: request.force_renew && renews_certificate(decision),
        force_replace_consumed: request.force_replace && replaces_key(decision),
        ca: updated,
        certs_removed,
        message,
    })
}

/// Alias an archived CA certificate is stored under. A numeric suffix is
/// appended when `certs` already holds an archive from the same second.
pub fn archived_certificate_alias(certs: &CaCertBundle, now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let alias = format!("ca-{}.crt", stamp);
    if certs.get(&alias).is_none() {
        return alias;
    }

    let mut suffix = 1u32;
    loop {
        let alias = format!("ca-{}-{}.crt", stamp, suffix);
        if certs.get(&alias).is_none() {
            return alias;
        }
        suffix += 1;
    }
}

fn renews_certificate(decision: RenewalType) -> bool {
    decision.rotates_ca()
}

fn replaces_key(decision: RenewalType) -> bool {
    matches!(decision, RenewalType::Create | RenewalType::ReplaceKey)
}

fn ensure_external_material(ca: &CertificateAuthority) -> Result<()> {
    if !ca.has_key() {
        return Err(FleetCaError::MissingCaMaterial {
            record: "CA key record".to_string(),
            key: CA_KEY.to_string(),
        });
    }
    if ca.certificate().is_none() {
        return Err(FleetCaError::MissingCaMaterial {
            record: "CA certificate record".to_string(),
            key: CA_CRT.to_string(),
        });
    }
    Ok(())
}

fn report(capability: &CaCapability, decision: RenewalType, message: &str) {
    let ca = capability.kind.display_name();
    let level = severity(decision);
    if level == Level::WARN {
        warn!(ca = %ca, decision = %decision, "{}", message);
    } else if level == Level::INFO {
        info!(ca = %ca, decision = %decision, "{}", message);
    } else {
        debug!(ca = %ca, decision = %decision, "{}", message);
    }
}

fn create(ca: &CertificateAuthority, now: DateTime<Utc>) -> Result<CertificateAuthority> {
    let settings = &ca.settings;
    let credential = issue(
        &settings.subject(None),
        None,
        settings.validity_days,
        settings.key_type,
        now,
    )?;

    let mut certs = CaCertBundle::default();
    certs.insert(CA_CRT, credential.certificate.clone());
    install_trust_store(&mut certs, credential.trust_store, credential.password)?;

    Ok(CertificateAuthority {
        settings: settings.clone(),
        key: credential.private_key,
        certs,
        cert_generation: ca.cert_generation,
        key_generation: ca.key_generation,
    })
}

fn renew_cert(ca: &CertificateAuthority, now: DateTime<Utc>) -> Result<CertificateAuthority> {
    let settings = &ca.settings;
    let current = ca.certificate();
    // Left behind by an interrupted key replacement: the key record was
    // written, the certificate record was not.
    let stale = current.filter(|cert| matches!(key_matches_certificate(&ca.key, cert), Ok(false)));

    let key_generation = match (current, stale) {
        (Some(_), None) => None,
        _ => Some(ca.key_generation).filter(|generation| *generation > 0),
    };
    let credential = renew_self_signed(
        &ca.key,
        &settings.subject(key_generation),
        settings.validity_days,
        now,
    )?;

    let mut updated = ca.clone();
    rotate_certificate(&mut updated.certs, &credential.certificate, stale, now)?;
    updated.cert_generation += 1;

    debug!(
        cert_generation = updated.cert_generation,
        archived = stale.is_some(),
        "Renewed CA certificate with existing key"
    );
    Ok(updated)
}

fn replace_key(ca: &CertificateAuthority, now: DateTime<Utc>) -> Result<CertificateAuthority> {
    let settings = &ca.settings;
    let key_generation = ca.key_generation + 1;
    let credential = issue(
        &settings.subject(Some(key_generation)),
        None,
        settings.validity_days,
        settings.key_type,
        now,
    )?;

    let mut updated = ca.clone();
    rotate_certificate(&mut updated.certs, &credential.certificate, ca.certificate(), now)?;
    updated.key = credential.private_key;
    updated.cert_generation += 1;
    updated.key_generation = key_generation;

    debug!(
        cert_generation = updated.cert_generation,
        key_generation = updated.key_generation,
        "Replaced CA key"
    );
    Ok(updated)
}

// Installs `certificate` as `ca.crt`, archiving `previous` first, in both the
// data set and the truststore.
fn rotate_certificate(
    certs: &mut CaCertBundle,
    certificate: &[u8],
    previous: Option<&[u8]>,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut additions: Vec<(String, Vec<u8>)> = Vec::new();
    if let Some(previous) = previous {
        let alias = archived_certificate_alias(certs, now);
        certs.insert(alias.clone(), previous.to_vec());
        additions.push((alias, previous.to_vec()));
    }
    certs.insert(CA_CRT, certificate.to_vec());
    additions.push((CA_CRT.to_string(), certificate.to_vec()));

    let additions: Vec<(&str, &[u8])> = additions
        .iter()
        .map(|(alias, cert)| (alias.as_str(), cert.as_slice()))
        .collect();
    update_trust_store(certs, &additions)
}

fn install_trust_store(certs: &mut CaCertBundle, trust_store: Option<Vec<u8>>, password: String) -> Result<()> {
    let trust_store = trust_store.ok_or_else(|| FleetCaError::CertificateGeneration {
        reason: "Self-signed issuance returned no truststore".to_string(),
    })?;
    certs.set_trust_store(trust_store, password);
    Ok(())
}

// Adds to the existing truststore, or rebuilds it from the data set when it
// cannot be opened. The data set already holds every addition.
fn update_trust_store(certs: &mut CaCertBundle, additions: &[(&str, &[u8])]) -> Result<()> {
    match (certs.open_trust_store(), certs.password()) {
        (Ok(mut store), Some(password)) => {
            for (alias, cert) in additions {
                store.add(alias, cert)?;
            }
            let encoded = store.seal(&password)?;
            certs.set_trust_store(encoded, password);
            Ok(())
        }
        (Err(e), _) => {
            warn!(error = %e, "CA truststore could not be opened, rebuilding it");
            rebuild_trust_store(certs)
        }
        (Ok(_), None) => rebuild_trust_store(certs),
    }
}
