use std::path::PathBuf;

use authorized_core::user::User;
use serde::{Deserialize, Serialize};

/// File and directory names making up a user's key store.
///
/// Every name is relative: `lock_file` to the home directory, the rest to
/// `ssh_dir`. Defaults match the OpenSSH layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Layout {
    pub ssh_dir: String,
    pub authorized_keys_file: String,
    pub authorized_keys_dir: String,
    /// Name the legacy file is preserved under inside the directory.
    pub preserved_keys_name: String,
    pub lock_file: String,
    pub stage_file: String,
    pub stage_dir: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            ssh_dir: ".ssh".to_string(),
            authorized_keys_file: "authorized_keys".to_string(),
            authorized_keys_dir: "authorized_keys.d".to_string(),
            preserved_keys_name: "orig_authorized_keys".to_string(),
            lock_file: ".authorized_keys.d.lock".to_string(),
            stage_file: ".authorized_keys.d.stage_file".to_string(),
            stage_dir: ".authorized_keys.d.stage_dir".to_string(),
        }
    }
}

/// Resolved absolute paths for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPaths {
    pub home: PathBuf,
    pub ssh_dir: PathBuf,
    pub authorized_keys: PathBuf,
    pub keys_dir: PathBuf,
    /// Where the legacy file ends up once migration commits.
    pub preserved_keys: PathBuf,
    pub lock_file: PathBuf,
    pub stage_file: PathBuf,
    pub stage_dir: PathBuf,
    /// `preserved_keys` as seen from inside the staging directory.
    pub staged_preserved_keys: PathBuf,
}

impl Layout {
    /// Map a user to its store paths. Pure; touches no filesystem state.
    pub fn paths(&self, user: &User) -> UserPaths {
        let home = user.home_dir.clone();
        let ssh_dir = home.join(&self.ssh_dir);
        let keys_dir = ssh_dir.join(&self.authorized_keys_dir);
        let stage_dir = ssh_dir.join(&self.stage_dir);
        UserPaths {
            lock_file: home.join(&self.lock_file),
            authorized_keys: ssh_dir.join(&self.authorized_keys_file),
            preserved_keys: keys_dir.join(&self.preserved_keys_name),
            staged_preserved_keys: stage_dir.join(&self.preserved_keys_name),
            stage_file: ssh_dir.join(&self.stage_file),
            keys_dir,
            stage_dir,
            ssh_dir,
            home,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_openssh_paths() {
        let user = User::new("alice", "/home/alice");
        let paths = Layout::default().paths(&user);

        assert_eq!(paths.lock_file, PathBuf::from("/home/alice/.authorized_keys.d.lock"));
        assert_eq!(paths.ssh_dir, PathBuf::from("/home/alice/.ssh"));
        assert_eq!(
            paths.authorized_keys,
            PathBuf::from("/home/alice/.ssh/authorized_keys")
        );
        assert_eq!(paths.keys_dir, PathBuf::from("/home/alice/.ssh/authorized_keys.d"));
        assert_eq!(
            paths.preserved_keys,
            PathBuf::from("/home/alice/.ssh/authorized_keys.d/orig_authorized_keys")
        );
        assert_eq!(
            paths.stage_file,
            PathBuf::from("/home/alice/.ssh/.authorized_keys.d.stage_file")
        );
        assert_eq!(
            paths.staged_preserved_keys,
            PathBuf::from("/home/alice/.ssh/.authorized_keys.d.stage_dir/orig_authorized_keys")
        );
    }
}
