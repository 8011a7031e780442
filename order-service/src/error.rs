//! Error types for the order service.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::PoolError;
use thiserror::Error;

/// Failures reported by the storage gateway.
///
/// The gateway never retries; callers decide whether a failure is fatal,
/// retried later or surfaced to a client.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database error: {0}")]
    Database(DieselError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    /// Whether the same write can succeed later without changing its input.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(DieselError::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::SerializationFailure | DatabaseErrorKind::ReadOnlyTransaction
            ),
            _ => false,
        }
    }
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => StoreError::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation
                | DatabaseErrorKind::ForeignKeyViolation
                | DatabaseErrorKind::NotNullViolation
                | DatabaseErrorKind::CheckViolation => {
                    StoreError::ConstraintViolation(info.message().to_string())
                }
                DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand => {
                    StoreError::Unavailable(info.message().to_string())
                }
                _ => StoreError::Database(DieselError::DatabaseError(kind, info)),
            },
            DieselError::BrokenTransactionManager => {
                StoreError::Unavailable("transaction manager is broken".to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

impl From<bb8::RunError<PoolError>> for StoreError {
    fn from(err: bb8::RunError<PoolError>) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Reasons an ingestion payload cannot be turned into an aggregate.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,

    #[error("malformed order payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid date_created {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("order_uid is missing")]
    MissingOrderUid,

    #[error("{field} contains a NUL character")]
    NulCharacter { field: &'static str },
}

/// Reasons an ingestion session ended.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("order {order_uid} was not persisted and must be redelivered: {reason}")]
    Redeliver { order_uid: String, reason: String },

    #[error("message stream closed")]
    StreamClosed,
}
