use crate::lease::client::ClientError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid manager config: {0}")]
    InvalidConfig(String),

    #[error("Lease duration must be positive")]
    InvalidDuration,

    #[error("Leadership of {name:?} is held by {holder:?}")]
    LeaseHeldByOther { name: String, holder: String },

    #[error("{holder:?} is not leader of {name:?}")]
    NotLeader { name: String, holder: String },

    #[error("{holder:?} does not hold the lease for {name:?}")]
    LeaseNotOwned { name: String, holder: String },

    #[error("Lease store error: {0}")]
    Store(#[from] ClientError),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Cancelled while waiting")]
    Cancelled,

    #[error("Leadership manager stopped")]
    ManagerStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
