use std::{
    fs::{self, DirBuilder, File, OpenOptions},
    io::{self, Read, Write},
    path::Path,
};

use tracing::{debug, info, instrument, warn};

use crate::{
    error::{MigrationError, MigrationStep},
    identity::IdentityContext,
    layout::UserPaths,
};

/// Outcome of a committed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Bytes carried over from the legacy file, `None` if there was none.
    pub preserved_bytes: Option<u64>,
}

/// Convert the legacy single-file layout into `authorized_keys.d`.
///
/// Must run while holding the user's lock, and only after the directory was
/// found missing. The directory is assembled under the staging name and
/// renamed into place in one step, so readers see either no directory or a
/// complete one. The legacy file is removed only after that rename.
#[instrument(skip_all, fields(keys_dir = %paths.keys_dir.display()))]
pub fn migrate(paths: &UserPaths, identity: &IdentityContext) -> Result<Migration, MigrationError> {
    let created_ssh_dir = prepare_ssh_dir(&paths.ssh_dir, identity)
        .map_err(|e| MigrationError::at(MigrationStep::PrepareSshDir, &paths.ssh_dir, e))?;

    let staged = clear_staging(paths).and_then(|()| stage(paths, identity));
    let preserved_bytes = match staged {
        Ok(preserved) => preserved,
        Err(err) => {
            roll_back(paths, created_ssh_dir);
            return Err(err);
        }
    };

    #[cfg(test)]
    hooks::after_stage(paths);

    if let Err(e) = fs::rename(&paths.stage_dir, &paths.keys_dir) {
        roll_back(paths, created_ssh_dir);
        return Err(MigrationError::at(MigrationStep::Install, &paths.keys_dir, e));
    }
    if let Err(e) = sync_dir(&paths.ssh_dir) {
        warn!(path = %paths.ssh_dir.display(), err = %e, "failed to sync .ssh after install");
    }
    info!(preserved = preserved_bytes.is_some(), "authorized_keys.d installed");

    if preserved_bytes.is_some() {
        match fs::remove_file(&paths.authorized_keys) {
            Ok(()) => debug!("legacy authorized_keys removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(MigrationError::at(
                    MigrationStep::RemoveLegacy,
                    &paths.authorized_keys,
                    e,
                ))
            }
        }
    }

    Ok(Migration { preserved_bytes })
}

/// Build the future directory under its staging name.
fn stage(paths: &UserPaths, identity: &IdentityContext) -> Result<Option<u64>, MigrationError> {
    create_private_dir(&paths.stage_dir, identity)
        .map_err(failed(MigrationStep::CreateStagingDir, &paths.stage_dir))?;

    let legacy = read_legacy(&paths.authorized_keys)
        .map_err(failed(MigrationStep::StageLegacyKeys, &paths.authorized_keys))?;
    let preserved = match legacy {
        Some(bytes) => {
            write_stage_file(&paths.stage_file, &bytes, identity)
                .map_err(failed(MigrationStep::StageLegacyKeys, &paths.stage_file))?;
            fs::rename(&paths.stage_file, &paths.staged_preserved_keys)
                .map_err(failed(MigrationStep::StageLegacyKeys, &paths.staged_preserved_keys))?;
            debug!(bytes = bytes.len(), "legacy authorized_keys staged");
            Some(bytes.len() as u64)
        }
        None => None,
    };

    sync_dir(&paths.stage_dir).map_err(failed(MigrationStep::SyncStaging, &paths.stage_dir))?;
    Ok(preserved)
}

fn failed(step: MigrationStep, path: &Path) -> impl FnOnce(io::Error) -> MigrationError + '_ {
    move |e| MigrationError::at(step, path, e)
}

/// Make sure `.ssh` is a real directory. Returns whether it was created here.
fn prepare_ssh_dir(ssh_dir: &Path, identity: &IdentityContext) -> io::Result<bool> {
    match fs::symlink_metadata(ssh_dir) {
        Ok(meta) if meta.file_type().is_symlink() => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to follow a symlink",
        )),
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists but is not a directory",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            create_private_dir(ssh_dir, identity)?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Read the legacy file without following a symlink; `None` if absent.
fn read_legacy(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to follow a symlink",
            ))
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NOFOLLOW);
    }
    let mut file = options.open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let mut bytes = Vec::with_capacity(meta.len() as usize);
    file.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

/// Drop leftovers of an earlier migration that died before installing.
fn clear_staging(paths: &UserPaths) -> Result<(), MigrationError> {
    for path in [&paths.stage_file, &paths.stage_dir] {
        let removed = remove_any(path)
            .map_err(|e| MigrationError::at(MigrationStep::ClearStaging, path.as_path(), e))?;
        if removed {
            warn!(path = %path.display(), "removed stale staging artifact");
        }
    }
    Ok(())
}

/// Undo everything a failed migration created before the install rename.
fn roll_back(paths: &UserPaths, created_ssh_dir: bool) {
    for path in [&paths.stage_file, &paths.stage_dir] {
        if let Err(e) = remove_any(path) {
            warn!(path = %path.display(), err = %e, "failed to discard staging artifact");
        }
    }
    if created_ssh_dir {
        if let Err(e) = fs::remove_dir(&paths.ssh_dir) {
            warn!(path = %paths.ssh_dir.display(), err = %e, "failed to remove new .ssh");
        }
    }
}

/// Remove a file or directory tree; `Ok(false)` if nothing was there.
fn remove_any(path: &Path) -> io::Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

fn create_private_dir(path: &Path, identity: &IdentityContext) -> io::Result<()> {
    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)?;
    identity.adopt(path).inspect_err(|_| {
        let _ = fs::remove_dir(path);
    })
}

fn write_stage_file(path: &Path, bytes: &[u8], identity: &IdentityContext) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    identity.adopt_file(&file)
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}
