use crate::lease::Client;
use crate::time::Clock;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Longest the loop sleeps before reconciling with the store
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(60);

/// First delay after a failed background reconciliation
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Consecutive unclassified store failures the loop tolerates
pub const DEFAULT_MAX_UNCLASSIFIED_FAILURES: u32 = 3;

/// Loop tuning. Deserializable so it can live in a larger config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub max_sleep: Duration,
    pub retry_backoff: Duration,
    pub max_unclassified_failures: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_sleep: DEFAULT_MAX_SLEEP,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_unclassified_failures: DEFAULT_MAX_UNCLASSIFIED_FAILURES,
        }
    }
}

impl Tuning {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped
    /// at `max_sleep`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_sleep)
    }
}

/// Collaborators and tuning for a `Manager`.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub clock: Option<Arc<dyn Clock>>,
    pub client: Option<Arc<dyn Client>>,
    pub tuning: Tuning,
}

impl ManagerConfig {
    pub fn new(clock: Arc<dyn Clock>, client: Arc<dyn Client>) -> Self {
        Self {
            clock: Some(clock),
            client: Some(client),
            tuning: Tuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.clock.is_none() {
            return Err(Error::InvalidConfig("missing clock".to_string()));
        }
        if self.client.is_none() {
            return Err(Error::InvalidConfig("missing client".to_string()));
        }
        if self.tuning.max_sleep.is_zero() {
            return Err(Error::InvalidConfig("max_sleep must be positive".to_string()));
        }
        if self.tuning.retry_backoff.is_zero() {
            return Err(Error::InvalidConfig("retry_backoff must be positive".to_string()));
        }
        Ok(())
    }
}
