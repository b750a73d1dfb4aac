use crate::domain::processor::ProcessorIdentity;
use crate::domain::transaction::TransactionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Rate budget exhausted for processor {processor}")]
    RateExceeded { processor: ProcessorIdentity },
    #[error("Credential unavailable for processor {processor}: {reason}")]
    CredentialUnavailable {
        processor: ProcessorIdentity,
        reason: String,
    },
    #[error("Audit trail unavailable: {0}")]
    AuditUnavailable(String),
    #[error("Transaction {0} already has an attempt in flight")]
    AlreadyInFlight(TransactionId),
    #[error("Event channel error: {0}")]
    EventChannel(String),
    #[error("Side effect failed: {0}")]
    SideEffect(String),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDBError(#[from] rocksdb::Error),
}
