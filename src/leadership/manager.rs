// Handle to the leadership control loop

use super::config::ManagerConfig;
use super::control::ControlLoop;
use super::state::WaiterId;
use super::token::Token;
use crate::lease::Request;
use crate::time::Timestamp;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A message to the control loop. Every variant with a `reply` gets exactly
/// one answer.
#[derive(Debug)]
pub(crate) enum Command {
    Claim {
        name: String,
        request: Request,
        reply: oneshot::Sender<Result<()>>,
    },
    Release {
        name: String,
        holder: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Check {
        name: String,
        holder: String,
        reply: oneshot::Sender<Result<Timestamp>>,
    },
    Block {
        name: String,
        waiter: WaiterId,
        reply: oneshot::Sender<Result<()>>,
    },
    Unblock {
        name: String,
        waiter: WaiterId,
    },
}

impl Command {
    /// Answers the sender with `error` without handling the command.
    pub fn reject(self, error: Error) {
        match self {
            Command::Claim { reply, .. }
            | Command::Release { reply, .. }
            | Command::Block { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Check { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Unblock { .. } => {}
        }
    }
}

/// Decides which holder leads each named service.
///
/// All state lives in a single background task; a `Manager` only sends it
/// commands, so clones are cheap and may be used from any task. The loop runs
/// until `kill()` is called, every handle is dropped, or it hits a fatal
/// error, which `wait()` then reports.
#[derive(Debug, Clone)]
pub struct Manager {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    done: watch::Receiver<Option<Result<()>>>,
    next_waiter: Arc<AtomicU64>,
}

impl Manager {
    /// Validates `config` and starts the control loop on the current tokio
    /// runtime.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let (Some(clock), Some(client)) = (config.clock, config.client) else {
            return Err(Error::InvalidConfig("missing collaborator".to_string()));
        };

        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (done_tx, done) = watch::channel(None);

        let control = ControlLoop::new(clock, client, config.tuning, receiver, shutdown.clone());
        tokio::spawn(
            async move {
                let result = control.run().await;
                let _ = done_tx.send(Some(result));
            }
            .instrument(tracing::info_span!("leadership")),
        );

        Ok(Self {
            commands,
            shutdown,
            done,
            next_waiter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Claims `name` for `holder`, or extends the claim if `holder` already has
    /// it. Fails with `LeaseHeldByOther` while someone else holds it.
    ///
    /// An extension can also fail with `LeaseNotOwned` when the lease was
    /// released or taken over elsewhere since this manager last saw it. The
    /// cache is corrected before the reply, so retrying the claim acts on the
    /// store's current view.
    pub async fn claim_leadership(&self, name: &str, holder: &str, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Err(Error::InvalidDuration);
        }
        self.request(|reply| Command::Claim {
            name: name.to_string(),
            request: Request::new(holder, duration),
            reply,
        })
        .await
    }

    /// Gives up `holder`'s lease on `name` and releases anyone blocked on it.
    pub async fn release_leadership(&self, name: &str, holder: &str) -> Result<()> {
        self.request(|reply| Command::Release {
            name: name.to_string(),
            holder: holder.to_string(),
            reply,
        })
        .await
    }

    /// Returns a token proving `holder` leads `name` right now, answered from
    /// the loop's cache.
    pub async fn leadership_check(&self, name: &str, holder: &str) -> Result<Token> {
        let valid_as_of = self.check(name, holder).await?;
        Ok(Token::new(self.clone(), name, holder, valid_as_of))
    }

    /// Waits until `name` has no holder. Fails with `Cancelled` once `cancel`
    /// fires, leaving other waiters on `name` in place.
    pub async fn block_until_leadership_released(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (reply, released) = oneshot::channel();
        self.commands
            .send(Command::Block {
                name: name.to_string(),
                waiter,
                reply,
            })
            .map_err(|_| Error::ManagerStopped)?;

        tokio::select! {
            biased;
            result = released => result.unwrap_or(Err(Error::ManagerStopped)),
            _ = cancel.cancelled() => {
                let _ = self.commands.send(Command::Unblock {
                    name: name.to_string(),
                    waiter,
                });
                Err(Error::Cancelled)
            }
        }
    }

    /// Asks the loop to stop. Safe to call any number of times.
    pub fn kill(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the loop to stop and returns why it stopped: `Ok` after a
    /// clean shutdown, the fatal error otherwise. Every caller sees the same
    /// result.
    pub async fn wait(&self) -> Result<()> {
        let mut done = self.done.clone();
        let result = match done.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(Error::InvariantViolation(
                "control loop exited without a result".to_string(),
            ))
        })
    }

    pub(crate) async fn check(&self, name: &str, holder: &str) -> Result<Timestamp> {
        self.request(|reply| Command::Check {
            name: name.to_string(),
            holder: holder.to_string(),
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::ManagerStopped)?;
        response.await.unwrap_or(Err(Error::ManagerStopped))
    }
}
