//! Hourly sweep: deletes runs (and their artifact trees) older than the
//! retention window, then reaps orphaned artifact directories. Directory
//! removal failures are logged, never fatal — the same policy the teacher
//! applies to sandbox cleanup failures.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use tracing::{error, info, warn};

use crate::artifact;
use crate::store::{Store, StoreError};

const TICK_INTERVAL: Duration = Duration::from_secs(3600);
const STARTUP_DELAY: Duration = Duration::from_secs(60);

pub struct Retention {
    store: Arc<Store>,
    artifact_root: std::path::PathBuf,
    retention_days: i64,
}

impl Retention {
    pub fn new(store: Arc<Store>, artifact_root: std::path::PathBuf, retention_days: i64) -> Self {
        Self { store, artifact_root, retention_days }
    }

    pub async fn run_forever(self: Arc<Self>) {
        tokio::time::sleep(STARTUP_DELAY).await;
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "retention: sweep failed");
            }
        }
    }

    pub async fn sweep(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let expired = self.store.run_ids_older_than(cutoff).await?;
        info!(count = expired.len(), "retention: deleting expired runs");

        for run_id in &expired {
            let dir = artifact::run_dir(&self.artifact_root, *run_id);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(run_id = %run_id, error = %e, "retention: failed to remove artifact directory");
                }
            }
            self.store.delete_run(*run_id).await?;
        }

        reap_orphans(&self.artifact_root, &self.store).await?;
        Ok(())
    }
}

/// Removes immediate children of `artifact_root` whose name is a
/// UUID-shaped directory not present in the `runs` table.
async fn reap_orphans(artifact_root: &Path, store: &Store) -> Result<(), StoreError> {
    let known_ids = store.all_run_ids().await?;

    let uuid_pattern =
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("static regex is valid");

    let mut entries = match tokio::fs::read_dir(artifact_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            warn!(error = %e, "retention: failed to list artifact root for orphan reaping");
            return Ok(());
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !uuid_pattern.is_match(&name) || known_ids.contains(&name) {
            continue;
        }
        if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
            warn!(dir = %name, error = %e, "retention: failed to reap orphan directory");
        } else {
            info!(dir = %name, "retention: reaped orphan artifact directory");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn sweep_deletes_expired_runs_and_their_directories() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tmp = tempfile::tempdir().unwrap();

        let run = store
            .create_run(
                "SIT1",
                crate::store::TriggerType::Manual,
                None,
                None,
                &HashMap::new(),
                &serde_json::Value::Null,
                &[],
            )
            .await
            .unwrap();
        let dir = artifact::run_dir(tmp.path(), run.id);
        tokio::fs::create_dir_all(&dir).await.unwrap();

        // Force the row into the past by updating created_at directly.
        {
            let conn = store.lock().await;
            conn.execute(
                "UPDATE runs SET created_at = ?1 WHERE id = ?2",
                rusqlite::params![(Utc::now() - ChronoDuration::days(40)).to_rfc3339(), run.id.to_string()],
            )
            .unwrap();
        }

        let retention = Retention::new(store.clone(), tmp.path().to_path_buf(), 30);
        retention.sweep().await.unwrap();

        assert!(store.get_run(run.id).await.unwrap().is_none());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn orphan_reaper_removes_unknown_uuid_directories_only() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tmp = tempfile::tempdir().unwrap();

        let orphan = uuid::Uuid::new_v4();
        tokio::fs::create_dir_all(tmp.path().join(orphan.to_string())).await.unwrap();
        tokio::fs::create_dir_all(tmp.path().join("not-a-uuid")).await.unwrap();

        reap_orphans(tmp.path(), &store).await.unwrap();

        assert!(!tmp.path().join(orphan.to_string()).exists());
        assert!(tmp.path().join("not-a-uuid").exists());
    }
}
