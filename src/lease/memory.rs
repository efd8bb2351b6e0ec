// In-memory lease store and the reference `Client` over it

use super::{Client, ClientError, LeaseInfo, Leases, Request};
use crate::time::{add, Clock};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Shared backing store. Every `MemoryClient` built over the same store sees
/// the same leases; per-key mutations are atomic.
#[derive(Debug)]
pub struct MemoryStore {
    leases: DashMap<String, LeaseInfo>,
    clock: Arc<dyn Clock>,
    /// Failures handed out, in order, to the next store operations
    injected: Mutex<VecDeque<ClientError>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            leases: DashMap::new(),
            clock,
            injected: Mutex::new(VecDeque::new()),
        })
    }

    /// Seeds the store with an existing lease.
    pub fn insert(&self, name: impl Into<String>, info: LeaseInfo) {
        self.leases.insert(name.into(), info);
    }

    pub fn get(&self, name: &str) -> Option<LeaseInfo> {
        self.leases.get(name).map(|entry| entry.clone())
    }

    pub fn snapshot(&self) -> Leases {
        self.leases
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Makes the next store operation fail with `error`.
    pub fn inject_failure(&self, error: ClientError) {
        self.injected.lock().push_back(error);
    }

    fn take_failure(&self) -> Result<(), ClientError> {
        match self.injected.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn claim(&self, name: &str, request: &Request) -> Result<LeaseInfo, ClientError> {
        self.take_failure()?;
        let now = self.clock.now();
        let expiry = add(now, request.duration);
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.holder != request.holder && !current.is_expired(now) {
                    return Err(ClientError::LeaseHeld {
                        name: name.to_string(),
                        holder: current.holder.clone(),
                    });
                }
                let expiry = if current.holder == request.holder {
                    expiry.max(current.expiry)
                } else {
                    expiry
                };
                let info = LeaseInfo::new(request.holder.clone(), expiry);
                entry.insert(info.clone());
                Ok(info)
            }
            Entry::Vacant(entry) => {
                let info = LeaseInfo::new(request.holder.clone(), expiry);
                entry.insert(info.clone());
                Ok(info)
            }
        }
    }

    fn extend(&self, name: &str, request: &Request) -> Result<LeaseInfo, ClientError> {
        self.take_failure()?;
        let now = self.clock.now();
        match self.leases.get_mut(name) {
            Some(mut current) if current.holder == request.holder => {
                current.expiry = add(now, request.duration).max(current.expiry);
                Ok(current.clone())
            }
            _ => Err(ClientError::LeaseNotOwned {
                name: name.to_string(),
                holder: request.holder.clone(),
            }),
        }
    }

    fn expire(&self, name: &str) -> Result<(), ClientError> {
        self.take_failure()?;
        let now = self.clock.now();
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(entry) if entry.get().is_expired(now) => {
                entry.remove();
                Ok(())
            }
            Entry::Occupied(_) => Err(ClientError::LeaseNotExpired {
                name: name.to_string(),
            }),
            Entry::Vacant(_) => Ok(()),
        }
    }

    fn release(&self, name: &str, holder: &str) -> Result<(), ClientError> {
        self.take_failure()?;
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(entry) if entry.get().holder == holder => {
                entry.remove();
                Ok(())
            }
            _ => Err(ClientError::LeaseNotOwned {
                name: name.to_string(),
                holder: holder.to_string(),
            }),
        }
    }
}

/// Reference `Client` over a `MemoryStore`. Holds its own snapshot, which may
/// lag behind changes made by other clients until `refresh()`.
#[derive(Debug)]
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    snapshot: Mutex<Leases>,
}

impl MemoryClient {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        let snapshot = store.snapshot();
        Self {
            store,
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Copies the store's view of one lease into the snapshot.
    fn observe(&self, name: &str) {
        let mut snapshot = self.snapshot.lock();
        match self.store.get(name) {
            Some(info) => {
                snapshot.insert(name.to_string(), info);
            }
            None => {
                snapshot.remove(name);
            }
        }
    }
}

#[async_trait]
impl Client for MemoryClient {
    async fn claim_lease(&self, name: &str, request: Request) -> Result<LeaseInfo, ClientError> {
        trace!(name, holder = %request.holder, "claim_lease");
        let result = self.store.claim(name, &request);
        self.observe(name);
        result
    }

    async fn extend_lease(&self, name: &str, request: Request) -> Result<LeaseInfo, ClientError> {
        trace!(name, holder = %request.holder, "extend_lease");
        let result = self.store.extend(name, &request);
        self.observe(name);
        result
    }

    async fn expire_lease(&self, name: &str) -> Result<(), ClientError> {
        trace!(name, "expire_lease");
        let result = self.store.expire(name);
        self.observe(name);
        result
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ClientError> {
        trace!(name, holder, "release_lease");
        let result = self.store.release(name, holder);
        self.observe(name);
        result
    }

    fn leases(&self) -> Leases {
        self.snapshot.lock().clone()
    }

    async fn refresh(&self) -> Result<(), ClientError> {
        self.store.take_failure()?;
        *self.snapshot.lock() = self.store.snapshot();
        Ok(())
    }
}
