use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use authorized_core::user::User;
use authorized_storage::{IdentityContext, Layout};
use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Configuration loaded from `~/.config/authorized/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Give up waiting for a user's lock after this many seconds; wait forever when unset.
    pub lock_timeout_secs: Option<u64>,
    /// Users served by the static provider.
    #[serde(default)]
    pub users: Vec<UserEntry>,
    /// Overrides for store file and directory names.
    #[serde(default)]
    pub layout: Layout,
}

/// One configured user plus the identity its files should belong to.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UserEntry {
    #[serde(flatten)]
    pub user: User,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl UserEntry {
    pub fn identity(&self) -> IdentityContext {
        IdentityContext {
            uid: self.uid,
            gid: self.gid,
        }
    }
}

impl Config {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }

    pub fn find_user(&self, name: &str) -> Option<&UserEntry> {
        self.users.iter().find(|entry| entry.user.name == name)
    }

    pub fn provider_users(&self) -> Vec<User> {
        self.users.iter().map(|entry| entry.user.clone()).collect()
    }

    pub fn identities(&self) -> HashMap<String, IdentityContext> {
        self.users
            .iter()
            .map(|entry| (entry.user.name.clone(), entry.identity()))
            .collect()
    }
}

/// Load config from `path`, or the default path when none is given.
pub fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_from_path(path),
        None => load_from_path(default_path()?),
    }
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("authorized").join("config.toml"))
}

/// Write the default config to `path`, creating parent directories as needed.
/// An existing file is left alone to avoid clobbering user edits.
pub fn write_default_if_missing(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(&Config::default())?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
