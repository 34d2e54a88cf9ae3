pub mod ca;
pub mod config;
pub mod error;
pub mod issuance;
pub mod pki;
pub mod reconciler;
pub mod store;

pub use error::{FleetCaError, Result};
pub use config::Config;
pub use ca::{CaCapability, CaKind, CaReconcileOutcome, CaReconcileRequest, CertificateAuthority, RenewalType, reconcile_ca};
pub use issuance::{DependentCredentialSet, IssuanceOutcome, IssuanceReason, IssuanceRequest, issue_or_reuse};
pub use reconciler::{CaReconciler, DependentGroup, ReconcileReport};
pub use store::{InMemorySecretStore, LocalSecretStore, SecretRecord, SecretStore};
