use anyhow::Result;
use tokio::sync::mpsc;
use tracing::debug;

use crate::user::User;

/// Source of user records.
///
/// Providers publish users in batches over a channel; the stream ends when
/// the sending side is dropped. Consumers handle each user independently and
/// know nothing about how the users were discovered.
pub trait Provider: Send + Sync {
    /// Short name used for logging and as the key-file name in `authorized_keys.d`.
    fn name(&self) -> &'static str;

    /// Start streaming user batches.
    fn users(&self) -> Result<mpsc::Receiver<Vec<User>>>;
}

/// Provider backed by a fixed list of users, published as a single batch.
/// Used for config-driven runs and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticProvider {
    users: Vec<User>,
}

impl StaticProvider {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }
}

impl Provider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    fn users(&self) -> Result<mpsc::Receiver<Vec<User>>> {
        let (tx, rx) = mpsc::channel(1);
        if !self.users.is_empty() {
            debug!(count = self.users.len(), "publishing static user batch");
            tx.try_send(self.users.clone())
                .map_err(|e| anyhow::anyhow!("publish user batch: {e}"))?;
        }
        Ok(rx)
    }
}
