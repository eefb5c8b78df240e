//! The only state that survives a restart: the id of the last profile that
//! connected successfully.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use veilnet_model::{LastConnection, ProfileId};

const FILE_NAME: &str = "last_connection.json";

pub fn default_state_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".veilnet");
    }

    PathBuf::from(".")
}

pub fn store_last_connection(state_dir: &Path, profile_id: &str) -> Result<()> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let record = LastConnection {
        profile_id: profile_id.to_owned(),
    };

    let path = state_dir.join(FILE_NAME);
    let json = serde_json::to_string_pretty(&record).context("Failed to encode the record")?;

    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn load_last_connection(state_dir: &Path) -> Option<ProfileId> {
    let raw = std::fs::read_to_string(state_dir.join(FILE_NAME)).ok()?;
    let record: LastConnection = serde_json::from_str(&raw).ok()?;

    Some(record.profile_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();

        store_last_connection(dir.path(), "profile-7").unwrap();

        assert_eq!(
            load_last_connection(dir.path()).as_deref(),
            Some("profile-7")
        );
    }

    #[test]
    fn missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(load_last_connection(dir.path()), None);
    }
}
