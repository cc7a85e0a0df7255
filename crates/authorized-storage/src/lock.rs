use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fs4::FileExt;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::identity::IdentityContext;

const POLL_START: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },
}

/// Capability to hold an exclusive, cross-process lock named by a path.
///
/// Dropping the guard releases the lock. Implementations must also release
/// it when the holding process dies so that no manual cleanup is needed.
pub trait ExclusiveLock: Send + Sync {
    type Guard: LockGuard;

    fn acquire(&self, path: &Path, identity: &IdentityContext) -> Result<Self::Guard, LockError>;
}

/// A held lock.
pub trait LockGuard: Send {
    /// Unlock explicitly and surface any error, instead of relying on drop.
    fn release(self) -> io::Result<()>;
}

/// Advisory `flock(2)` lock on a marker file.
///
/// The marker is created on first use with mode 0600, never written and
/// never removed. The kernel drops the lock when the descriptor is closed,
/// including when the owning process exits for any reason.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLock {
    timeout: Option<Duration>,
}

impl FileLock {
    /// Wait as long as it takes.
    pub fn blocking() -> Self {
        Self { timeout: None }
    }

    /// Give up with [`LockError::Timeout`] once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl ExclusiveLock for FileLock {
    type Guard = FileLockGuard;

    #[instrument(skip_all, fields(path = %path.display()))]
    fn acquire(&self, path: &Path, identity: &IdentityContext) -> Result<FileLockGuard, LockError> {
        let file = open_lock_file(path, identity).map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        match self.timeout {
            None => lock_blocking(&file).map_err(|source| LockError::Lock {
                path: path.to_path_buf(),
                source,
            })?,
            Some(timeout) => lock_with_deadline(&file, path, timeout)?,
        }

        debug!("lock acquired");
        Ok(FileLockGuard {
            file,
            path: path.to_path_buf(),
        })
    }
}

/// Held lock. Closing the file releases it.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LockGuard for FileLockGuard {
    fn release(self) -> io::Result<()> {
        let result = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "lock released");
        result
    }
}

/// Open the marker read-only without following a symlink at `path`, and
/// refuse anything but a regular file with a single link. The marker lives
/// in a directory its user controls and is handed to them afterwards.
fn open_lock_file(path: &Path, identity: &IdentityContext) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // std only honours `create` together with write access.
        options
            .custom_flags(libc::O_CREAT | libc::O_NOFOLLOW)
            .mode(0o600);
    }
    #[cfg(not(unix))]
    {
        options.write(true).create(true).truncate(false);
    }
    let file = options.open(path)?;

    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "lock file is not a regular file",
        ));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if meta.nlink() > 1 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "lock file has more than one link",
            ));
        }
    }

    identity.adopt_file(&file)?;
    Ok(file)
}

fn lock_blocking(file: &File) -> io::Result<()> {
    loop {
        match file.lock_exclusive() {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn lock_with_deadline(file: &File, path: &Path, timeout: Duration) -> Result<(), LockError> {
    let start = Instant::now();
    let mut backoff = POLL_START;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(LockError::Lock {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let waited = start.elapsed();
        if waited >= timeout {
            return Err(LockError::Timeout {
                path: path.to_path_buf(),
                waited,
            });
        }
        thread::sleep(backoff.min(timeout - waited));
        backoff = (backoff * 2).min(POLL_MAX);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(".authorized_keys.d.lock")
    }

    #[test]
    fn creates_empty_owner_only_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&dir);

        let guard = FileLock::blocking()
            .acquire(&path, &IdentityContext::current())
            .expect("acquire");
        assert_eq!(guard.path(), path);

        let meta = std::fs::metadata(&path).expect("lock file exists");
        assert_eq!(meta.len(), 0);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }

        guard.release().expect("release");
        assert!(path.exists(), "lock file is never removed");
    }

    #[test]
    fn second_holder_times_out_while_first_holds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&dir);
        let identity = IdentityContext::current();

        let _held = FileLock::blocking().acquire(&path, &identity).expect("acquire");
        let err = FileLock::with_timeout(Duration::from_millis(50))
            .acquire(&path, &identity)
            .expect_err("lock is held");
        match err {
            LockError::Timeout { waited, .. } => assert!(waited >= Duration::from_millis(50)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn dropping_guard_releases_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&dir);
        let identity = IdentityContext::current();

        drop(FileLock::blocking().acquire(&path, &identity).expect("acquire"));
        FileLock::with_timeout(Duration::from_millis(50))
            .acquire(&path, &identity)
            .expect("lock should be free after drop");
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = lock_path(&dir);
        let held = FileLock::blocking()
            .acquire(&path, &IdentityContext::current())
            .expect("acquire");

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let guard = FileLock::blocking()
                .acquire(&waiter_path, &IdentityContext::current())
                .expect("acquire after release");
            tx.send(()).expect("send");
            drop(guard);
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(150)).is_err(),
            "waiter must block while the lock is held"
        );
        held.release().expect("release");
        rx.recv_timeout(Duration::from_secs(5))
            .expect("waiter acquires once released");
        waiter.join().expect("join");
    }

    #[test]
    fn missing_home_is_an_open_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("no-such-home").join(".authorized_keys.d.lock");

        let err = FileLock::blocking()
            .acquire(&path, &IdentityContext::current())
            .expect_err("parent does not exist");
        assert!(matches!(err, LockError::Open { .. }));
    }

    #[cfg(unix)]
    mod links {
        use std::os::unix::fs::{symlink, MetadataExt};

        use super::*;

        /// An identity the marker would be handed to: a foreign one when
        /// running as root, so a followed link would visibly change owner.
        fn target_identity(dir: &tempfile::TempDir) -> IdentityContext {
            let uid = std::fs::metadata(dir.path()).expect("metadata").uid();
            if uid == 0 {
                IdentityContext::new(1000, 1000)
            } else {
                let gid = std::fs::metadata(dir.path()).expect("metadata").gid();
                IdentityContext::new(uid, gid)
            }
        }

        fn outside_file(dir: &tempfile::TempDir) -> PathBuf {
            let target = dir.path().join("shadow");
            std::fs::write(&target, b"root:secret\n").expect("write target");
            target
        }

        #[test]
        fn symlinked_marker_is_refused_and_target_untouched() {
            let home = tempfile::tempdir().expect("tempdir");
            let elsewhere = tempfile::tempdir().expect("tempdir");
            let target = outside_file(&elsewhere);
            let before = std::fs::metadata(&target).expect("metadata");
            let path = lock_path(&home);
            symlink(&target, &path).expect("symlink");

            let err = FileLock::blocking()
                .acquire(&path, &target_identity(&home))
                .expect_err("symlink must not be followed");
            assert!(matches!(err, LockError::Open { .. }), "{err:?}");

            let after = std::fs::metadata(&target).expect("metadata");
            assert_eq!(after.uid(), before.uid());
            assert_eq!(after.gid(), before.gid());
            assert_eq!(after.mode(), before.mode());
            assert_eq!(std::fs::read(&target).expect("read"), b"root:secret\n");
        }

        #[test]
        fn hard_linked_marker_is_refused_and_target_untouched() {
            let home = tempfile::tempdir().expect("tempdir");
            let target = outside_file(&home);
            let before = std::fs::metadata(&target).expect("metadata");
            let path = lock_path(&home);
            std::fs::hard_link(&target, &path).expect("hard link");

            let err = FileLock::blocking()
                .acquire(&path, &target_identity(&home))
                .expect_err("extra links are refused");
            assert!(matches!(err, LockError::Open { .. }), "{err:?}");
            assert_eq!(std::fs::metadata(&target).expect("metadata").uid(), before.uid());
        }

        #[test]
        fn read_only_marker_can_be_locked() {
            use std::os::unix::fs::PermissionsExt;

            let home = tempfile::tempdir().expect("tempdir");
            let path = lock_path(&home);
            std::fs::write(&path, b"").expect("create marker");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o400))
                .expect("chmod");

            let guard = FileLock::with_timeout(Duration::from_millis(50))
                .acquire(&path, &IdentityContext::current())
                .expect("marker is only opened for reading");
            guard.release().expect("release");
        }

        #[test]
        fn directory_in_place_of_marker_is_refused() {
            let home = tempfile::tempdir().expect("tempdir");
            let path = lock_path(&home);
            std::fs::create_dir(&path).expect("mkdir");

            let err = FileLock::blocking()
                .acquire(&path, &IdentityContext::current())
                .expect_err("not a regular file");
            assert!(matches!(err, LockError::Open { .. }), "{err:?}");
        }
    }
}
