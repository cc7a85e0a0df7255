use authorized_storage::{FileLock, KeysDirManager};
use tracing::debug;

use crate::config::Config;

/// Build the directory manager from config: layout overrides plus the
/// optional lock timeout.
pub fn manager_from_config(config: &Config) -> KeysDirManager {
    let lock = match config.lock_timeout() {
        Some(timeout) => FileLock::with_timeout(timeout),
        None => FileLock::blocking(),
    };
    debug!(timeout = ?lock.timeout(), "initializing keys dir manager");
    KeysDirManager::with_lock(config.layout.clone(), lock)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn applies_lock_timeout_and_layout() {
        let mut config = Config {
            lock_timeout_secs: Some(3),
            ..Config::default()
        };
        config.layout.authorized_keys_dir = "keys.d".into();

        let manager = manager_from_config(&config);
        assert_eq!(manager.layout().authorized_keys_dir, "keys.d");
        assert_eq!(manager.lock().timeout(), Some(Duration::from_secs(3)));

        let blocking = manager_from_config(&Config::default());
        assert_eq!(blocking.layout(), &authorized_storage::Layout::default());
        assert_eq!(blocking.lock().timeout(), None);
    }
}
