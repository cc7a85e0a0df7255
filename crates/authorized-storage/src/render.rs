use std::{fs, path::PathBuf};

use tracing::{info, instrument};

use crate::{
    error::KeysDirError,
    keys_dir::{write_atomic, StoreHandle},
    lock::LockGuard,
};

const HEADER: &[u8] = b"# Generated from authorized_keys.d; local edits will be overwritten.\n";

/// Regenerate `~/.ssh/authorized_keys` from the open directory.
///
/// Entries are concatenated in name order, each newline-terminated, and the
/// result replaces the file atomically. Contents are copied verbatim.
#[instrument(skip_all, fields(user = %handle.user().name))]
pub fn render_authorized_keys<G: LockGuard>(
    handle: &StoreHandle<'_, G>,
) -> Result<PathBuf, KeysDirError> {
    let paths = handle.paths();
    let io_err = |path: &std::path::Path, source| KeysDirError::Io {
        user: handle.user().name.clone(),
        path: path.to_path_buf(),
        source,
    };

    let entries = handle.entries()?;
    let mut out = HEADER.to_vec();
    for name in &entries {
        let path = handle.path().join(name);
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        out.extend_from_slice(&bytes);
        if !bytes.is_empty() && !bytes.ends_with(b"\n") {
            out.push(b'\n');
        }
    }

    write_atomic(&paths.ssh_dir, &paths.authorized_keys, &out, handle.identity())
        .map_err(|e| io_err(&paths.authorized_keys, e))?;
    info!(entries = entries.len(), "authorized_keys rendered");
    Ok(paths.authorized_keys.clone())
}
