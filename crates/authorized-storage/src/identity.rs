use std::{fs::File, io, path::Path};

use serde::{Deserialize, Serialize};

/// Identity that files created on a user's behalf should belong to.
///
/// The manager runs with its own process credentials; every artifact it
/// creates under a home directory (lock file, `.ssh`, staged directory and
/// files) is handed over to this identity so the user, and sshd's
/// `StrictModes` checks, see files they own. An empty context leaves
/// ownership to the process, which is what unprivileged runs and tests use.
///
/// Ownership changes never follow symlinks: paths are changed with
/// `lchown`, open files through their descriptor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityContext {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl IdentityContext {
    /// Inherit the identity of the running process.
    pub fn current() -> Self {
        Self::default()
    }

    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Some(uid),
            gid: Some(gid),
        }
    }

    pub fn is_current(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }

    /// Transfer ownership of a freshly created path to this identity.
    /// A symlink at `path` is changed itself, not its target.
    pub fn adopt(&self, path: &Path) -> io::Result<()> {
        if self.is_current() {
            return Ok(());
        }
        lchown(path, self.uid, self.gid)
    }

    /// Transfer ownership of an open file to this identity.
    pub fn adopt_file(&self, file: &File) -> io::Result<()> {
        if self.is_current() {
            return Ok(());
        }
        fchown(file, self.uid, self.gid)
    }
}

#[cfg(unix)]
fn lchown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    std::os::unix::fs::lchown(path, uid, gid)
}

#[cfg(unix)]
fn fchown(file: &File, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    std::os::unix::fs::fchown(file, uid, gid)
}

#[cfg(not(unix))]
fn lchown(_path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn fchown(_file: &File, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
    Ok(())
}
