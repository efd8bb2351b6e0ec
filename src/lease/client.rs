use super::{LeaseInfo, Leases, Request};
use async_trait::async_trait;
use thiserror::Error;

/// Classified failures of a lease store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Lease {name:?} is held by {holder:?}")]
    LeaseHeld { name: String, holder: String },

    #[error("Lease {name:?} is not held by {holder:?}")]
    LeaseNotOwned { name: String, holder: String },

    #[error("Lease {name:?} has not expired")]
    LeaseNotExpired { name: String },

    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Store failure: {0}")]
    Other(String),
}

impl ClientError {
    /// Failures worth retrying without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

/// Access to a durable lease store.
///
/// Every mutation is atomic against the backing store, so any number of
/// clients (in this process or others) may share one store. `leases()` only
/// reads the client's local snapshot, which mutations made through this client
/// and `refresh()` keep current.
#[async_trait]
pub trait Client: Send + Sync + std::fmt::Debug {
    /// Takes a free lease, or re-takes one already held by `request.holder`.
    /// The new expiry is `now + request.duration`, but a re-take never moves
    /// the holder's expiry backward.
    async fn claim_lease(&self, name: &str, request: Request) -> Result<LeaseInfo, ClientError>;

    /// Pushes the expiry of a lease held by `request.holder` to
    /// `now + request.duration`. Never moves an expiry backward.
    async fn extend_lease(&self, name: &str, request: Request) -> Result<LeaseInfo, ClientError>;

    /// Removes a lease whose expiry is at or before now.
    async fn expire_lease(&self, name: &str) -> Result<(), ClientError>;

    /// Removes a lease held by `holder` regardless of its expiry.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ClientError>;

    /// Local snapshot of all known leases.
    fn leases(&self) -> Leases;

    /// Re-reads the snapshot from the backing store.
    async fn refresh(&self) -> Result<(), ClientError>;
}
