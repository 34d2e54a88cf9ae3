use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetCaError>;

#[derive(Error, Debug)]
pub enum FleetCaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("Certificate generation failed: {reason}")]
    CertificateGeneration { reason: String },

    #[error("Invalid certificate: {reason}")]
    InvalidCertificate { reason: String },

    #[error("Keystore error: {reason}")]
    Keystore { reason: String },

    #[error("CA material missing from {record}: {key}")]
    MissingCaMaterial { record: String, key: String },

    #[error("Invalid annotation {annotation} on {record}: {value}")]
    InvalidAnnotation {
        record: String,
        annotation: String,
        value: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
