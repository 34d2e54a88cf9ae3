//! Certificate Authority lifecycle: state, renewal decisions and transitions.

pub mod decision;
pub mod lifecycle;
pub mod model;

pub use decision::{
    CaCapability, CaKind, ChangeDetector, DecisionInput, RenewalType, decide, observe,
    renewal_message, severity,
};
pub use lifecycle::{CaReconcileOutcome, CaReconcileRequest, archived_certificate_alias, reconcile_ca};
pub use model::{CaCertBundle, CaSettings, CertificateAuthority, ExpirationPolicy};
