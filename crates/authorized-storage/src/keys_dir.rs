use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use authorized_core::user::User;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::{
    error::KeysDirError,
    identity::IdentityContext,
    layout::{Layout, UserPaths},
    lock::{ExclusiveLock, FileLock, FileLockGuard, LockGuard},
    migrate,
};

/// What to do when a user has no `authorized_keys.d` yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Migrate the legacy `authorized_keys` into a new directory.
    CreateIfMissing,
    /// Fail with [`KeysDirError::NotExist`].
    RequireExisting,
}

/// How an open produced its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The directory already existed.
    Resolved,
    /// The directory was created by this open.
    Migrated,
}

/// Opens users' `authorized_keys.d` directories under their per-user lock.
pub struct KeysDirManager<L: ExclusiveLock = FileLock> {
    layout: Layout,
    lock: L,
}

impl KeysDirManager<FileLock> {
    pub fn new(layout: Layout) -> Self {
        Self::with_lock(layout, FileLock::blocking())
    }
}

impl<L: ExclusiveLock> KeysDirManager<L> {
    pub fn with_lock(layout: Layout, lock: L) -> Self {
        Self { layout, lock }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn lock(&self) -> &L {
        &self.lock
    }

    /// Open the user's directory, creating it from the legacy file if asked.
    ///
    /// Blocks until the user's lock is free. The returned handle holds that
    /// lock until [`StoreHandle::close`]; on error the lock is already
    /// released.
    #[instrument(skip_all, fields(user = %user.name, mode = ?mode))]
    pub fn open<'u>(
        &self,
        user: &'u User,
        identity: &IdentityContext,
        mode: OpenMode,
    ) -> Result<StoreHandle<'u, L::Guard>, KeysDirError> {
        let paths = self.layout.paths(user);
        let lock = self
            .lock
            .acquire(&paths.lock_file, identity)
            .map_err(|source| KeysDirError::Lock {
                user: user.name.clone(),
                source,
            })?;

        reject_symlink(user, &paths.ssh_dir)?;
        let state = match resolve(user, &paths.keys_dir) {
            Ok(()) => HandleState::Resolved,
            Err(err) if err.is_not_exist() && mode == OpenMode::CreateIfMissing => {
                let migration =
                    migrate::migrate(&paths, identity).map_err(|source| KeysDirError::Migration {
                        user: user.name.clone(),
                        source,
                    })?;
                debug!(preserved_bytes = ?migration.preserved_bytes, "migrated");
                HandleState::Migrated
            }
            Err(err) => return Err(err),
        };

        debug!(?state, "opened");
        Ok(StoreHandle {
            paths,
            user,
            identity: *identity,
            state,
            lock,
        })
    }
}

/// Check that `path` is an existing directory. A symlink is not followed and
/// is reported as [`KeysDirError::NotADirectory`].
pub fn resolve(user: &User, path: &Path) -> Result<(), KeysDirError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(KeysDirError::NotADirectory {
            user: user.name.clone(),
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(KeysDirError::NotExist {
            user: user.name.clone(),
            path: path.to_path_buf(),
        }),
        Err(source) => Err(KeysDirError::Stat {
            user: user.name.clone(),
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// `.ssh` may be missing, but must not be a symlink into someone else's files.
fn reject_symlink(user: &User, path: &Path) -> Result<(), KeysDirError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(KeysDirError::NotADirectory {
            user: user.name.clone(),
            path: path.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

/// An opened `authorized_keys.d`, valid while its lock is held.
///
/// Consumed by [`close`](Self::close). Dropping the handle also releases
/// the lock, but swallows any unlock error.
#[derive(Debug)]
pub struct StoreHandle<'u, G: LockGuard = FileLockGuard> {
    paths: UserPaths,
    user: &'u User,
    identity: IdentityContext,
    state: HandleState,
    lock: G,
}

impl<'u, G: LockGuard> StoreHandle<'u, G> {
    /// The `authorized_keys.d` directory.
    pub fn path(&self) -> &Path {
        &self.paths.keys_dir
    }

    pub fn paths(&self) -> &UserPaths {
        &self.paths
    }

    pub fn user(&self) -> &'u User {
        self.user
    }

    pub fn identity(&self) -> &IdentityContext {
        &self.identity
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Names of the key files in the directory, sorted. Dotfiles and
    /// non-regular files are skipped.
    pub fn entries(&self) -> Result<Vec<String>, KeysDirError> {
        let dir = self.path();
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| self.io_err(dir, e))? {
            let entry = entry.map_err(|e| self.io_err(dir, e))?;
            let file_type = entry.file_type().map_err(|e| self.io_err(&entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if !name.starts_with('.') => names.push(name),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    /// Atomically replace one key file with `contents`.
    #[instrument(skip(self, contents), fields(user = %self.user.name))]
    pub fn write_entry(&self, name: &str, contents: &[u8]) -> Result<PathBuf, KeysDirError> {
        let target = self.entry_path(name)?;
        write_atomic(self.path(), &target, contents, &self.identity)
            .map_err(|e| self.io_err(&target, e))?;
        debug!(bytes = contents.len(), "entry written");
        Ok(target)
    }

    /// Remove a key file (idempotent).
    pub fn remove_entry(&self, name: &str) -> Result<(), KeysDirError> {
        let target = self.entry_path(name)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(&target, e)),
        }
    }

    /// Release the lock, ending the session.
    pub fn close(self) -> Result<(), KeysDirError> {
        let StoreHandle {
            paths, user, lock, ..
        } = self;
        lock.release().map_err(|source| KeysDirError::Io {
            user: user.name.clone(),
            path: paths.lock_file,
            source,
        })
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf, KeysDirError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(KeysDirError::InvalidEntryName {
                user: self.user.name.clone(),
                name: name.to_string(),
            });
        }
        Ok(self.path().join(name))
    }

    fn io_err(&self, path: &Path, source: io::Error) -> KeysDirError {
        KeysDirError::Io {
            user: self.user.name.clone(),
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write via a temp file in `dir` and rename over `target`.
pub(crate) fn write_atomic(
    dir: &Path,
    target: &Path,
    contents: &[u8],
    identity: &IdentityContext,
) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    identity.adopt_file(tmp.as_file())?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
