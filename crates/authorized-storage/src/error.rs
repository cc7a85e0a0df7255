use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::lock::LockError;

/// Errors produced while opening or using a user's `authorized_keys.d`.
///
/// Every variant names the user and the path involved. The user's lock has
/// always been released by the time one of these reaches the caller.
#[derive(Debug, Error)]
pub enum KeysDirError {
    #[error("user {user}: {source}")]
    Lock {
        user: String,
        #[source]
        source: LockError,
    },
    /// Nothing to open and creation was not requested.
    #[error("user {user}: {path} does not exist")]
    NotExist { user: String, path: PathBuf },
    /// Something other than a directory sits where the store should be.
    /// Never removed automatically.
    #[error("user {user}: {path} is not a directory")]
    NotADirectory { user: String, path: PathBuf },
    #[error("user {user}: stat {path}: {source}")]
    Stat {
        user: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("user {user}: {source}")]
    Migration {
        user: String,
        #[source]
        source: MigrationError,
    },
    #[error("user {user}: invalid entry name {name:?}")]
    InvalidEntryName { user: String, name: String },
    #[error("user {user}: {path}: {source}")]
    Io {
        user: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl KeysDirError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::NotExist { .. })
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(
            self,
            Self::Lock {
                source: LockError::Timeout { .. },
                ..
            }
        )
    }

    pub fn user(&self) -> &str {
        match self {
            Self::Lock { user, .. }
            | Self::NotExist { user, .. }
            | Self::NotADirectory { user, .. }
            | Self::Stat { user, .. }
            | Self::Migration { user, .. }
            | Self::InvalidEntryName { user, .. }
            | Self::Io { user, .. } => user,
        }
    }
}

/// Stage of the legacy-to-directory migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    PrepareSshDir,
    ClearStaging,
    CreateStagingDir,
    StageLegacyKeys,
    SyncStaging,
    Install,
    RemoveLegacy,
}

impl MigrationStep {
    /// Whether the new directory is already visible once this step runs.
    pub fn is_after_install(self) -> bool {
        matches!(self, Self::RemoveLegacy)
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PrepareSshDir => "prepare .ssh",
            Self::ClearStaging => "clear stale staging",
            Self::CreateStagingDir => "create staging directory",
            Self::StageLegacyKeys => "stage legacy keys",
            Self::SyncStaging => "sync staging",
            Self::Install => "install directory",
            Self::RemoveLegacy => "remove legacy file",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Failed before the directory was installed. The pre-existing layout is
    /// untouched and the migration can be retried.
    #[error("migration failed during {step} ({path}): {source}")]
    Staging {
        step: MigrationStep,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The directory is installed but the legacy file could not be retired.
    /// Needs operator attention; never retried automatically.
    #[error("directory installed but {step} failed ({path}): {source}")]
    Inconsistent {
        step: MigrationStep,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MigrationError {
    pub(crate) fn at(step: MigrationStep, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if step.is_after_install() {
            Self::Inconsistent { step, path, source }
        } else {
            Self::Staging { step, path, source }
        }
    }

    pub fn step(&self) -> MigrationStep {
        match self {
            Self::Staging { step, .. } | Self::Inconsistent { step, .. } => *step,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Staging { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_after_install_are_not_retryable() {
        let err = MigrationError::at(
            MigrationStep::RemoveLegacy,
            "/home/a/.ssh/authorized_keys",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, MigrationError::Inconsistent { .. }));
        assert!(!err.is_retryable());

        let err = MigrationError::at(
            MigrationStep::Install,
            "/home/a/.ssh/authorized_keys.d",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_retryable());
        assert_eq!(err.step(), MigrationStep::Install);
    }

    #[test]
    fn messages_carry_user_and_path() {
        let err = KeysDirError::NotADirectory {
            user: "alice".into(),
            path: PathBuf::from("/home/alice/.ssh/authorized_keys.d"),
        };
        assert_eq!(
            err.to_string(),
            "user alice: /home/alice/.ssh/authorized_keys.d is not a directory"
        );
        assert_eq!(err.user(), "alice");
    }

    #[test]
    fn timeout_is_distinguishable() {
        let err = KeysDirError::Lock {
            user: "bob".into(),
            source: LockError::Timeout {
                path: PathBuf::from("/home/bob/.authorized_keys.d.lock"),
                waited: std::time::Duration::from_secs(1),
            },
        };
        assert!(err.is_lock_timeout());
        assert!(!err.is_not_exist());
    }
}
