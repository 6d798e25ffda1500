use crate::collection::Collection;
use crate::store::StoreError;

/// Operation-level failures. Each one aborts the call that raised it.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("archive error: {0}")]
    Archive(String),
}

impl MigrationError {
    /// Stable machine-readable discriminator for API and CLI payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Decode(_) => "decode",
            Self::Transaction(_) => "transaction",
            Self::Encode(_) => "encode",
            Self::Archive(_) => "archive",
        }
    }
}

impl From<StoreError> for MigrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::Connection(message),
            StoreError::RecordRejected(message) | StoreError::Operation(message) => {
                Self::Transaction(message)
            }
        }
    }
}

/// A single source row that could not be turned into a canonical record.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MappingError {
    #[error("{collection}.{field} holds binary content")]
    BinaryField { collection: Collection, field: &'static str },
    #[error("{collection}.id is not an integer identity: {value}")]
    InvalidIdentity { collection: Collection, value: String },
}
