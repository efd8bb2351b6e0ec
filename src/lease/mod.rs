// Lease records and the store contract
//
// A lease is a time-bounded exclusive claim on a named resource. The store
// behind a `Client` is the arbiter of exclusivity; everything above it only
// caches what the store reported.

pub mod client;
pub mod memory;

pub use client::{Client, ClientError};
pub use memory::{MemoryClient, MemoryStore};

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Snapshot of every lease a store knows about, keyed by lease name.
pub type Leases = HashMap<String, LeaseInfo>;

/// One active lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Current holder
    pub holder: String,

    /// Instant at which the lease stops being valid
    pub expiry: Timestamp,
}

impl LeaseInfo {
    pub fn new(holder: impl Into<String>, expiry: Timestamp) -> Self {
        Self {
            holder: holder.into(),
            expiry,
        }
    }

    /// A lease is expired at and after its expiry instant.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }
}

/// Parameters of a claim or extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub holder: String,
    pub duration: Duration,
}

impl Request {
    pub fn new(holder: impl Into<String>, duration: Duration) -> Self {
        Self {
            holder: holder.into(),
            duration,
        }
    }
}
