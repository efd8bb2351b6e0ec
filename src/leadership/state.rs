// Cache and waiter bookkeeping owned by the control loop

use crate::lease::{LeaseInfo, Leases};
use crate::time::Timestamp;
use crate::{Error, Result};
use std::collections::HashMap;
use tokio::sync::oneshot;

pub(crate) type WaiterId = u64;

/// Everything the control loop knows about leadership. Only the loop holds
/// one, so nothing here is synchronised.
#[derive(Debug, Default)]
pub(crate) struct LeadershipState {
    /// Last known lease per name
    cache: Leases,

    /// Callers blocked until a name has no holder, in registration order
    waiters: HashMap<String, Vec<(WaiterId, oneshot::Sender<Result<()>>)>>,
}

impl LeadershipState {
    pub fn new(cache: Leases) -> Self {
        Self {
            cache,
            waiters: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&LeaseInfo> {
        self.cache.get(name)
    }

    /// The lease on `name` if it is still valid at `now`.
    pub fn current(&self, name: &str, now: Timestamp) -> Option<&LeaseInfo> {
        self.cache.get(name).filter(|info| !info.is_expired(now))
    }

    pub fn insert(&mut self, name: &str, info: LeaseInfo) {
        self.cache.insert(name.to_string(), info);
    }

    pub fn remove(&mut self, name: &str) -> Option<LeaseInfo> {
        self.cache.remove(name)
    }

    /// Swaps in a fresh view of the store.
    pub fn replace(&mut self, cache: Leases) {
        self.cache = cache;
    }

    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.cache.values().map(|info| info.expiry).min()
    }

    /// Names whose recorded expiry has been reached, sorted.
    pub fn expired(&self, now: Timestamp) -> Vec<String> {
        let mut names: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, info)| info.is_expired(now))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn add_waiter(&mut self, name: &str, id: WaiterId, reply: oneshot::Sender<Result<()>>) {
        self.waiters
            .entry(name.to_string())
            .or_default()
            .push((id, reply));
    }

    pub fn remove_waiter(&mut self, name: &str, id: WaiterId) -> bool {
        let Some(waiters) = self.waiters.get_mut(name) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|(waiter, _)| *waiter != id);
        let removed = waiters.len() != before;
        if waiters.is_empty() {
            self.waiters.remove(name);
        }
        removed
    }

    /// Releases every waiter on `name`. Returns how many were still listening.
    pub fn wake(&mut self, name: &str) -> usize {
        self.waiters
            .remove(name)
            .unwrap_or_default()
            .into_iter()
            .map(|(_, reply)| reply.send(Ok(())))
            .filter(|sent| sent.is_ok())
            .count()
    }

    /// Names that have waiters but no cached lease.
    pub fn released(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .waiters
            .keys()
            .filter(|name| !self.cache.contains_key(*name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn fail_waiters(&mut self, error: Error) {
        for (_, waiters) in self.waiters.drain() {
            for (_, reply) in waiters {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }
}
