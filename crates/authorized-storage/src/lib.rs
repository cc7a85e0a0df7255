//! Lifecycle management for per-user `authorized_keys.d` directories.
//! Opens are serialized per user by an advisory lock file; a missing
//! directory is created by atomically migrating the legacy
//! `authorized_keys` file.

pub mod error;
pub mod identity;
pub mod keys_dir;
pub mod layout;
pub mod lock;
pub mod migrate;
pub mod render;

pub use error::{KeysDirError, MigrationError, MigrationStep};
pub use identity::IdentityContext;
pub use keys_dir::{HandleState, KeysDirManager, OpenMode, StoreHandle};
pub use layout::{Layout, UserPaths};
pub use lock::{ExclusiveLock, FileLock, FileLockGuard, LockError, LockGuard};
