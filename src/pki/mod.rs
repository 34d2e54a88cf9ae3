//! Certificate primitives
//!
//! Building blocks for everything that touches X.509 material:
//!
//! - **Subject**: desired identity of a certificate (CN, organization, SANs)
//! - **Primitive**: key generation, CSR signing, self-signing
//! - **Keystore**: PKCS#12 packaging of leaf credentials
//! - **Truststore**: PKCS#12 alias → certificate store and expiry purge
//! - **Inspect**: parsing stored certificates and keys

pub mod inspect;
pub mod keystore;
pub mod primitive;
pub mod subject;
pub mod truststore;

pub use inspect::{CertificateSummary, key_matches_certificate, signed_by, summarize};
pub use primitive::{Credential, KeyType, Signer, generate_password, issue, renew_self_signed};
pub use subject::{SanEntry, Subject, SubjectBuilder};
pub use truststore::{TrustStore, add_to_trust_store, purge_expired, rebuild_trust_store};
