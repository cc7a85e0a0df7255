use authorized_storage::{KeysDirManager, OpenMode};
use color_eyre::Result;
use serde::Serialize;

use crate::{
    config::{Config, UserEntry},
    storage,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Present,
    Absent,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserStatus {
    pub user: String,
    pub status: StoreStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Print the store status of every configured user. Never creates a store.
pub async fn run(config: &Config, json: bool) -> Result<()> {
    let manager = storage::manager_from_config(config);
    let users = config.users.clone();
    let statuses: Vec<UserStatus> =
        tokio::task::spawn_blocking(move || users.iter().map(|u| inspect(&manager, u)).collect())
            .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        print_table(&statuses);
    }
    Ok(())
}

pub fn inspect(manager: &KeysDirManager, entry: &UserEntry) -> UserStatus {
    let mut status = UserStatus {
        user: entry.user.name.clone(),
        status: StoreStatus::Absent,
        entries: Vec::new(),
        error: None,
    };

    let handle = match manager.open(&entry.user, &entry.identity(), OpenMode::RequireExisting) {
        Ok(handle) => handle,
        Err(err) if err.is_not_exist() => return status,
        Err(err) => {
            status.status = StoreStatus::Error;
            status.error = Some(err.to_string());
            return status;
        }
    };

    let listed = handle.entries();
    let closed = handle.close();
    match listed.and_then(|entries| closed.map(|()| entries)) {
        Ok(entries) => {
            status.status = StoreStatus::Present;
            status.entries = entries;
        }
        Err(err) => {
            status.status = StoreStatus::Error;
            status.error = Some(err.to_string());
        }
    }
    status
}

fn print_table(statuses: &[UserStatus]) {
    if statuses.is_empty() {
        println!("No users configured. Add [[users]] entries to the config file.");
        return;
    }
    for status in statuses {
        let label = match status.status {
            StoreStatus::Present => "present",
            StoreStatus::Absent => "absent",
            StoreStatus::Error => "error",
        };
        println!("{:<16} {label}", status.user);
        if !status.entries.is_empty() {
            println!("    entries: {}", status.entries.join(", "));
        }
        if let Some(err) = &status.error {
            println!("    {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use authorized_core::user::User;
    use authorized_storage::{IdentityContext, Layout};

    use super::*;

    fn entry(home: &std::path::Path, name: &str) -> UserEntry {
        UserEntry {
            user: User::new(name, home),
            ..UserEntry::default()
        }
    }

    #[test]
    fn reports_absent_present_and_error() {
        let manager = KeysDirManager::new(Layout::default());

        let absent_home = tempfile::tempdir().expect("tempdir");
        let absent = inspect(&manager, &entry(absent_home.path(), "absent"));
        assert_eq!(absent.status, StoreStatus::Absent);
        assert!(!absent_home.path().join(".ssh").exists());

        let present_home = tempfile::tempdir().expect("tempdir");
        let present_entry = entry(present_home.path(), "present");
        manager
            .open(
                &present_entry.user,
                &IdentityContext::current(),
                OpenMode::CreateIfMissing,
            )
            .expect("create")
            .close()
            .expect("close");
        let present = inspect(&manager, &present_entry);
        assert_eq!(present.status, StoreStatus::Present);
        assert!(present.entries.is_empty());

        let broken_home = tempfile::tempdir().expect("tempdir");
        fs::create_dir(broken_home.path().join(".ssh")).expect("mkdir");
        fs::write(broken_home.path().join(".ssh/authorized_keys.d"), b"x").expect("collide");
        let broken = inspect(&manager, &entry(broken_home.path(), "broken"));
        assert_eq!(broken.status, StoreStatus::Error);
        assert!(broken
            .error
            .as_deref()
            .is_some_and(|e| e.contains("not a directory")));
    }

    #[test]
    fn json_omits_empty_fields() {
        let status = UserStatus {
            user: "alice".into(),
            status: StoreStatus::Absent,
            entries: Vec::new(),
            error: None,
        };
        let json = serde_json::to_string(&status).expect("serialize");
        assert_eq!(json, r#"{"user":"alice","status":"absent"}"#);
    }
}
