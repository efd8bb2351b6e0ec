// The leadership control loop
//
// One task owns the lease cache and the waiters. It wakes for the next of:
// - a shutdown request
// - the alarm for the earliest cached expiry (or `max_sleep`, whichever is sooner)
// - a command from a `Manager` handle
// and it is the only thing that mutates the store on the manager's behalf.

use super::config::Tuning;
use super::manager::Command;
use super::state::{LeadershipState, WaiterId};
use crate::lease::{Client, ClientError, LeaseInfo, Request};
use crate::time::{self, Alarm, Clock, Timestamp};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

enum Event {
    Shutdown,
    Alarm,
    Command(Option<Command>),
}

pub(crate) struct ControlLoop {
    clock: Arc<dyn Clock>,
    client: Arc<dyn Client>,
    tuning: Tuning,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    state: LeadershipState,
    alarm: Option<Alarm>,

    /// Consecutive failed reconciliations
    failures: u32,

    /// Consecutive failed reconciliations the store could not classify
    unclassified: u32,
}

impl ControlLoop {
    pub fn new(
        clock: Arc<dyn Clock>,
        client: Arc<dyn Client>,
        tuning: Tuning,
        commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) -> Self {
        let state = LeadershipState::new(client.leases());
        Self {
            clock,
            client,
            tuning,
            commands,
            shutdown,
            state,
            alarm: None,
            failures: 0,
            unclassified: 0,
        }
    }

    /// Serves commands until shutdown, then answers everything still queued
    /// or blocked with `ManagerStopped`.
    pub async fn run(mut self) -> Result<()> {
        info!("leadership manager started");
        self.rearm(self.tuning.retry_backoff);
        let result = self.serve().await;
        match &result {
            Ok(()) => info!("leadership manager stopped"),
            Err(error) => error!(%error, "leadership manager failed"),
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(Error::ManagerStopped);
        }
        self.state.fail_waiters(Error::ManagerStopped);
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let mut alarm = match self.alarm.take() {
                Some(alarm) => alarm,
                None => self.clock.after(self.tuning.max_sleep),
            };
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Event::Shutdown,
                _ = &mut alarm => Event::Alarm,
                command = self.commands.recv() => Event::Command(command),
            };
            match event {
                Event::Shutdown | Event::Command(None) => return Ok(()),
                Event::Alarm => self.tick().await?,
                Event::Command(Some(command)) => {
                    self.alarm = Some(alarm);
                    self.handle(command).await?;
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Claim {
                name,
                request,
                reply,
            } => {
                debug!(name = %name, holder = %request.holder, "claim requested");
                let result = self.claim(&name, request).await;
                self.rearm(Duration::ZERO);
                respond(reply, result)
            }
            Command::Release {
                name,
                holder,
                reply,
            } => {
                debug!(name = %name, holder = %holder, "release requested");
                let result = self.release(&name, &holder).await;
                self.rearm(Duration::ZERO);
                respond(reply, result)
            }
            Command::Check {
                name,
                holder,
                reply,
            } => {
                let _ = reply.send(self.check(&name, &holder));
                Ok(())
            }
            Command::Block {
                name,
                waiter,
                reply,
            } => {
                self.block(&name, waiter, reply);
                self.rearm(Duration::ZERO);
                Ok(())
            }
            Command::Unblock { name, waiter } => {
                if self.state.remove_waiter(&name, waiter) {
                    debug!(name = %name, waiter, "waiter cancelled");
                }
                Ok(())
            }
        }
    }

    async fn claim(&mut self, name: &str, request: Request) -> Result<()> {
        if request.duration.is_zero() {
            return Err(Error::InvalidDuration);
        }
        let now = self.clock.now();

        // A lapsed entry may still be in the store; it has to go before anyone
        // can claim.
        if self.state.get(name).is_some_and(|info| info.is_expired(now)) {
            debug!(name, "cached lease has lapsed; expiring before claim");
            self.expire(name).await?;
        }

        let previous = self.state.current(name, now).cloned();
        let result = match &previous {
            Some(info) if info.holder != request.holder => {
                return Err(Error::LeaseHeldByOther {
                    name: name.to_string(),
                    holder: info.holder.clone(),
                });
            }
            Some(_) => {
                interruptible(&self.shutdown, self.client.extend_lease(name, request.clone())).await
            }
            None => {
                interruptible(&self.shutdown, self.client.claim_lease(name, request.clone())).await
            }
        };

        match result {
            Ok(granted) => {
                // A cached expiry can predate a release and a shorter re-claim
                // made elsewhere; judge the grant against the store's view.
                let previous = match previous {
                    Some(cached) if granted.expiry < cached.expiry => {
                        debug!(name, holder = %request.holder, "extension came back shorter; rereading store");
                        interruptible(&self.shutdown, self.client.refresh()).await?;
                        self.client
                            .leases()
                            .remove(name)
                            .filter(|info| info.holder == request.holder)
                    }
                    other => other,
                };
                verify_grant(name, &request, now, previous.as_ref(), &granted)?;
                if previous.is_some() {
                    info!(name, holder = %granted.holder, expiry = %granted.expiry, "leadership extended");
                } else {
                    info!(name, holder = %granted.holder, expiry = %granted.expiry, "leadership claimed");
                }
                self.state.insert(name, granted);
                Ok(())
            }
            Err(Error::Store(ClientError::LeaseHeld { holder, .. })) => {
                debug!(name, holder = %holder, "claim lost to current holder");
                self.adopt(name);
                Err(Error::LeaseHeldByOther {
                    name: name.to_string(),
                    holder,
                })
            }
            Err(Error::Store(ClientError::LeaseNotOwned { .. })) => {
                debug!(name, holder = %request.holder, "extension refused; lease changed hands");
                self.adopt(name);
                Err(Error::LeaseNotOwned {
                    name: name.to_string(),
                    holder: request.holder,
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn release(&mut self, name: &str, holder: &str) -> Result<()> {
        match interruptible(&self.shutdown, self.client.release_lease(name, holder)).await {
            Ok(()) => {
                info!(name, holder, "leadership released");
                self.state.remove(name);
                self.wake(name);
                Ok(())
            }
            Err(Error::Store(ClientError::LeaseNotOwned { .. })) => {
                self.adopt(name);
                Err(Error::LeaseNotOwned {
                    name: name.to_string(),
                    holder: holder.to_string(),
                })
            }
            Err(error) => Err(error),
        }
    }

    fn check(&self, name: &str, holder: &str) -> Result<Timestamp> {
        let now = self.clock.now();
        match self.state.current(name, now) {
            Some(info) if info.holder == holder => Ok(now),
            _ => Err(Error::NotLeader {
                name: name.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    fn block(&mut self, name: &str, waiter: WaiterId, reply: oneshot::Sender<Result<()>>) {
        if self.state.get(name).is_none() {
            let _ = reply.send(Ok(()));
            return;
        }
        debug!(name, waiter, "waiting for release");
        self.state.add_waiter(name, waiter, reply);
    }

    /// Reconciles with the store; failures back off instead of stopping the
    /// loop unless the store keeps failing in ways it cannot classify.
    async fn tick(&mut self) -> Result<()> {
        trace!("reconciling with lease store");
        match self.reconcile().await {
            Ok(()) => {
                self.failures = 0;
                self.unclassified = 0;
                self.rearm(self.tuning.retry_backoff);
                Ok(())
            }
            Err(Error::Store(error)) => {
                self.failures = self.failures.saturating_add(1);
                if !error.is_transient() {
                    self.unclassified = self.unclassified.saturating_add(1);
                    if self.unclassified >= self.tuning.max_unclassified_failures {
                        error!(%error, failures = self.unclassified, "giving up on lease store");
                        return Err(Error::Store(error));
                    }
                }
                let delay = self.tuning.backoff(self.failures);
                warn!(%error, attempt = self.failures, ?delay, "reconciliation failed; retrying");
                self.alarm = Some(self.clock.after(delay));
                Ok(())
            }
            Err(Error::ManagerStopped) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn reconcile(&mut self) -> Result<()> {
        interruptible(&self.shutdown, self.client.refresh()).await?;
        self.state.replace(self.client.leases());

        let now = self.clock.now();
        for name in self.state.expired(now) {
            self.expire(&name).await?;
        }
        for name in self.state.released() {
            self.wake(&name);
        }
        Ok(())
    }

    /// Removes a lapsed lease from the store. If the store says it is still
    /// valid, someone extended it, so the store's view is adopted instead.
    async fn expire(&mut self, name: &str) -> Result<()> {
        match interruptible(&self.shutdown, self.client.expire_lease(name)).await {
            Ok(()) => {
                let previous = self.state.remove(name);
                info!(name, holder = ?previous.map(|info| info.holder), "leadership expired");
                self.wake(name);
                Ok(())
            }
            Err(Error::Store(ClientError::LeaseNotExpired { .. })) => {
                debug!(name, "lease was extended in the store");
                interruptible(&self.shutdown, self.client.refresh()).await?;
                self.adopt(name);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Copies the client's view of `name` into the cache.
    fn adopt(&mut self, name: &str) {
        match self.client.leases().remove(name) {
            Some(info) => self.state.insert(name, info),
            None => {
                self.state.remove(name);
                self.wake(name);
            }
        }
    }

    fn wake(&mut self, name: &str) {
        let woken = self.state.wake(name);
        if woken > 0 {
            debug!(name, woken, "waiters released");
        }
    }

    /// Arms the alarm for the earliest cached expiry, at most `max_sleep`
    /// away. An expiry that has already passed waits `floor` instead.
    fn rearm(&mut self, floor: Duration) {
        let now = self.clock.now();
        let delay = match self.state.next_expiry() {
            Some(expiry) => {
                let remaining = time::until(now, expiry);
                let remaining = if remaining.is_zero() { floor } else { remaining };
                remaining.min(self.tuning.max_sleep)
            }
            None => self.tuning.max_sleep,
        };
        trace!(?delay, "alarm armed");
        self.alarm = Some(self.clock.after(delay));
    }
}

/// Replies to a caller. Invariant violations are also returned so the loop
/// stops.
fn respond(reply: oneshot::Sender<Result<()>>, result: Result<()>) -> Result<()> {
    let fatal = match &result {
        Err(error @ Error::InvariantViolation(_)) => Some(error.clone()),
        _ => None,
    };
    let _ = reply.send(result);
    fatal.map_or(Ok(()), Err)
}

/// Runs a store call unless shutdown is requested first.
async fn interruptible<T>(
    shutdown: &CancellationToken,
    call: impl Future<Output = std::result::Result<T, ClientError>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(Error::ManagerStopped),
        result = call => result.map_err(Error::from),
    }
}

/// Checks a successful claim or extension against what was asked for and
/// what the cache already knew.
fn verify_grant(
    name: &str,
    request: &Request,
    now: Timestamp,
    previous: Option<&LeaseInfo>,
    granted: &LeaseInfo,
) -> Result<()> {
    if granted.holder != request.holder {
        return Err(Error::InvariantViolation(format!(
            "store granted {name:?} to {:?} when {:?} claimed it",
            granted.holder, request.holder
        )));
    }
    if granted.expiry <= now {
        return Err(Error::InvariantViolation(format!(
            "store granted {name:?} until {}, which is not after {now}",
            granted.expiry
        )));
    }
    if let Some(previous) = previous {
        if granted.expiry < previous.expiry {
            return Err(Error::InvariantViolation(format!(
                "expiry of {name:?} for {:?} moved backward from {} to {}",
                granted.holder, previous.expiry, granted.expiry
            )));
        }
    }
    Ok(())
}
