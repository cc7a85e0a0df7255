use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Account whose SSH keys are managed.
///
/// Records are produced by a [`Provider`](crate::provider::Provider) and are
/// treated as read-only input by everything downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Login name, used for logging and error context.
    pub name: String,
    /// Public keys as opaque lines; never parsed.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// Home directory holding `.ssh` and the lock file.
    pub home_dir: PathBuf,
    #[serde(default)]
    pub shell: String,
    /// Disabled accounts are skipped by sync runs.
    #[serde(default)]
    pub disabled: bool,
}

impl User {
    pub fn new(name: impl Into<String>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            home_dir: home_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ssh_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }
}
