use super::manager::Manager;
use crate::time::Timestamp;
use crate::Result;

/// Proof that a holder led a service at `valid_as_of`.
///
/// `check()` asks the manager whether that is still true. The answer comes
/// from the manager's cache, so it never costs a store round-trip.
#[derive(Debug, Clone)]
pub struct Token {
    manager: Manager,
    name: String,
    holder: String,
    valid_as_of: Timestamp,
}

impl Token {
    pub(crate) fn new(manager: Manager, name: &str, holder: &str, valid_as_of: Timestamp) -> Self {
        Self {
            manager,
            name: name.to_string(),
            holder: holder.to_string(),
            valid_as_of,
        }
    }

    /// `Ok` while the holder still leads; `NotLeader` afterwards.
    pub async fn check(&self) -> Result<()> {
        self.manager.check(&self.name, &self.holder).await.map(|_| ())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn valid_as_of(&self) -> Timestamp {
        self.valid_as_of
    }
}
