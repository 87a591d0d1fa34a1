//! Error types for the credit ledger.

use crate::identity::Identity;
use tonic::Status;

/// Errors raised by a [`CreditStore`](crate::store::CreditStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database rejected or failed the query.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be interpreted as a credit record.
    #[error("Invalid credit record: {0}")]
    InvalidRecord(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the credit ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The balance for an identity could not be read or seeded.
    #[error("Credit lookup failed for {identity}: {source}")]
    Lookup {
        /// Identity being resolved.
        identity: Identity,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },

    /// The decremented balance could not be written.
    #[error("Credit update failed for {identity}: {source}")]
    Update {
        /// Identity being updated.
        identity: Identity,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },
}

impl LedgerError {
    /// Identity the failed operation was for.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        match self {
            Self::Lookup { identity, .. } | Self::Update { identity, .. } => identity,
        }
    }
}

impl From<LedgerError> for Status {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Lookup { .. } => Self::unavailable(err.to_string()),
            LedgerError::Update { .. } => Self::aborted(err.to_string()),
        }
    }
}

/// Errors raised while discovering the caller's public IP address.
#[derive(Debug, thiserror::Error)]
pub enum IpDiscoveryError {
    /// The lookup endpoint could not be reached or returned an error status.
    #[error("IP lookup request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with something that is not an IP address.
    #[error("IP lookup returned an invalid address: {0}")]
    InvalidAddress(String),
}

/// Errors raised by [`CreditLedgerClient`](crate::client::CreditLedgerClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection to the service failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The service returned an error status.
    #[error("Service error [{code}]: {message}")]
    ServiceError {
        /// gRPC status code.
        code: tonic::Code,
        /// Status message.
        message: String,
    },

    /// The service answered with a value this client does not understand.
    #[error("Response error: {0}")]
    ResponseError(String),
}

impl From<tonic::transport::Error> for ClientError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        Self::ServiceError {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}
