use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Reputation error: {0}")]
    Reputation(#[from] ReputationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Invalid rate limit key: {0}")]
    InvalidKey(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReputationError {
    #[error("IP {0} is whitelisted and cannot be blocked")]
    Whitelisted(String),
}

/// Failure of the keyed state behind one of the stores.
///
/// Never fatal: brute force and IP decisions fail closed on it, rate limiting
/// fails open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of an audit sink write. Seen only by the delivery worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit sink rejected event: {0}")]
    Rejected(String),
}

impl Error {
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_whitelist_override(&self) -> bool {
        matches!(self, Error::Reputation(ReputationError::Whitelisted(_)))
    }

    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}
