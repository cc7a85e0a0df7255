use std::sync::Arc;

use authorized_core::{provider::Provider, user::User};
use authorized_storage::{
    render::render_authorized_keys, HandleState, IdentityContext, KeysDirError, KeysDirManager,
    OpenMode,
};
use color_eyre::Result;
use tracing::{error, info};

use crate::config::Config;
use crate::storage;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub migrated: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Drain the provider and bring every enabled user's directory up to date.
pub async fn run(cfg: &Config, provider: &dyn Provider) -> Result<SyncSummary> {
    let manager = Arc::new(storage::manager_from_config(cfg));
    let identities = cfg.identities();
    let source = provider.name();
    info!(provider = source, "sync started");

    let mut batches = provider
        .users()
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    let mut summary = SyncSummary::default();
    while let Some(batch) = batches.recv().await {
        for user in batch {
            if !user.is_enabled() {
                info!(user = %user.name, "skipping disabled user");
                summary.skipped += 1;
                continue;
            }
            let identity = identities.get(&user.name).copied().unwrap_or_default();
            let manager = Arc::clone(&manager);
            let name = user.name.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                sync_user(&manager, &user, &identity, source)
            })
            .await?;

            match outcome {
                Ok(HandleState::Migrated) => summary.migrated += 1,
                Ok(HandleState::Resolved) => summary.updated += 1,
                Err(err) => {
                    error!(user = %name, "sync failed: {err}");
                    summary.failed += 1;
                }
            }
        }
    }

    info!(?summary, "sync finished");
    Ok(summary)
}

/// Open (migrating if needed), write the provider's keys, render, close.
pub fn sync_user(
    manager: &KeysDirManager,
    user: &User,
    identity: &IdentityContext,
    source: &str,
) -> Result<HandleState, KeysDirError> {
    let handle = manager.open(user, identity, OpenMode::CreateIfMissing)?;
    let mut body = user.ssh_keys.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    handle.write_entry(source, body.as_bytes())?;
    render_authorized_keys(&handle)?;
    let state = handle.state();
    handle.close()?;
    Ok(state)
}
