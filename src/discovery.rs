//! Test tree discovery: reconciles the catalog against the filesystem.
//!
//! A test folder is any directory containing `meta.json` and exactly one
//! `*.spec.js` file. Discovery never aborts wholesale on a malformed folder
//! — the bad folder is logged and skipped, the pass continues.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

use crate::store::{ConstantSet, Store, StoreError, TestDefinition, TestMeta};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of one `discover_and_sync` pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub upserted: usize,
    pub deactivated: usize,
    pub skipped_folders: usize,
}

#[derive(Debug, serde::Deserialize)]
struct RawMeta {
    #[serde(rename = "testKey")]
    test_key: String,
    #[serde(rename = "friendlyName")]
    friendly_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Walks `test_root`, upserts every well-formed test folder found, then
/// deactivates catalog rows whose `testKey` went unseen.
pub async fn discover_and_sync(store: &Store, test_root: &Path) -> Result<DiscoveryReport, DiscoveryError> {
    if !test_root.exists() {
        warn!(path = %test_root.display(), "test root does not exist, skipping discovery");
        return Ok(DiscoveryReport::default());
    }

    let mut report = DiscoveryReport::default();
    let mut seen_keys = Vec::new();

    for folder in test_folders(test_root) {
        match sync_one_folder(store, test_root, &folder).await {
            Ok(def) => {
                seen_keys.push(def.test_key);
                report.upserted += 1;
            }
            Err(err) => {
                warn!(folder = %folder.display(), error = %err, "skipping malformed test folder");
                report.skipped_folders += 1;
            }
        }
    }

    report.deactivated = store.deactivate_missing_tests(&seen_keys).await?;
    Ok(report)
}

/// Folders under `root` containing `meta.json` and exactly one `*.spec.js`.
fn test_folders(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();
        if !dir.join("meta.json").is_file() {
            continue;
        }
        let spec_count = std::fs::read_dir(dir)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .filter(|e| {
                e.path().extension().is_some_and(|ext| ext == "js")
                    && e.file_name().to_string_lossy().ends_with(".spec.js")
            })
            .count();
        if spec_count == 1 {
            out.push(dir.to_path_buf());
        }
    }
    out
}

#[derive(Debug, Error)]
enum FolderError {
    #[error("reading meta.json: {0}")]
    ReadMeta(#[source] std::io::Error),
    #[error("parsing meta.json: {0}")]
    ParseMeta(#[source] serde_json::Error),
    #[error("reading constants.json: {0}")]
    ReadConstants(#[source] std::io::Error),
    #[error("parsing constants.json: {0}")]
    ParseConstants(#[source] serde_json::Error),
    #[error("meta.json testKey is empty")]
    EmptyTestKey,
    #[error("meta.json friendlyName is empty")]
    EmptyFriendlyName,
    #[error("no *.spec.js file in folder")]
    MissingSpec,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

async fn sync_one_folder(
    store: &Store,
    test_root: &Path,
    folder: &Path,
) -> Result<TestDefinition, FolderError> {
    let meta_raw = std::fs::read_to_string(folder.join("meta.json")).map_err(FolderError::ReadMeta)?;
    let meta: RawMeta = serde_json::from_str(&meta_raw).map_err(FolderError::ParseMeta)?;
    if meta.test_key.trim().is_empty() {
        return Err(FolderError::EmptyTestKey);
    }
    if meta.friendly_name.trim().is_empty() {
        return Err(FolderError::EmptyFriendlyName);
    }

    let constants = match std::fs::read_to_string(folder.join("constants.json")) {
        Ok(raw) => serde_json::from_str(&raw).map_err(FolderError::ParseConstants)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConstantSet::default(),
        Err(err) => return Err(FolderError::ReadConstants(err)),
    };

    let spec_path = spec_file_in(folder).ok_or(FolderError::MissingSpec)?;

    let folder_path = relative_posix(test_root, folder);
    let spec_path_rel = relative_posix(test_root, &spec_path);

    let test_meta = TestMeta {
        friendly_name: meta.friendly_name,
        description: meta.description,
        tags: meta.tags,
    };

    store
        .upsert_test_definition(&meta.test_key, &folder_path, &spec_path_rel, &test_meta, &constants)
        .await
        .map_err(FolderError::from)
}

fn spec_file_in(folder: &Path) -> Option<PathBuf> {
    std::fs::read_dir(folder)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| {
            p.extension().is_some_and(|ext| ext == "js")
                && p.file_name().unwrap().to_string_lossy().ends_with(".spec.js")
        })
}

fn relative_posix(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::fs;

    fn write_folder(root: &Path, folder: &str, test_key: &str, friendly_name: &str) {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("meta.json"),
            format!(r#"{{"testKey":"{test_key}","friendlyName":"{friendly_name}","tags":["smoke"]}}"#),
        )
        .unwrap();
        fs::write(dir.join(format!("{test_key}.spec.js")), "// test").unwrap();
    }

    #[tokio::test]
    async fn discovers_and_upserts_well_formed_folders() {
        let tmp = tempfile::tempdir().unwrap();
        write_folder(tmp.path(), "auth/login", "auth.login", "Login");
        let store = Store::open_in_memory().unwrap();

        let report = discover_and_sync(&store, tmp.path()).await.unwrap();
        assert_eq!(report.upserted, 1);
        assert_eq!(report.skipped_folders, 0);

        let def = store.get_test_by_key("auth.login").await.unwrap().unwrap();
        assert_eq!(def.folder_path, "auth/login");
        assert!(def.active);
    }

    #[tokio::test]
    async fn nonexistent_root_is_a_clean_noop() {
        let store = Store::open_in_memory().unwrap();
        let report = discover_and_sync(&store, Path::new("/does/not/exist")).await.unwrap();
        assert_eq!(report.upserted, 0);
        assert_eq!(report.deactivated, 0);
    }

    #[tokio::test]
    async fn empty_root_leaves_catalog_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_test_definition("x", "x", "x.spec.js", &TestMeta::default(), &ConstantSet::default())
            .await
            .unwrap();
        discover_and_sync(&store, tmp.path()).await.unwrap();
        assert!(store.get_test_by_key("x").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn folder_missing_spec_file_is_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("meta.json"), r#"{"testKey":"x","friendlyName":"X"}"#).unwrap();
        let store = Store::open_in_memory().unwrap();

        let report = discover_and_sync(&store, tmp.path()).await.unwrap();
        assert_eq!(report.upserted, 0);
        assert_eq!(report.skipped_folders, 0);
    }

    #[tokio::test]
    async fn rediscovery_deactivates_vanished_tests() {
        let tmp = tempfile::tempdir().unwrap();
        write_folder(tmp.path(), "a", "a.one", "A One");
        write_folder(tmp.path(), "b", "b.two", "B Two");
        let store = Store::open_in_memory().unwrap();
        discover_and_sync(&store, tmp.path()).await.unwrap();

        fs::remove_dir_all(tmp.path().join("b")).unwrap();
        let report = discover_and_sync(&store, tmp.path()).await.unwrap();
        assert_eq!(report.deactivated, 1);
        assert!(!store.get_test_by_key("b.two").await.unwrap().unwrap().active);
        assert!(store.get_test_by_key("a.one").await.unwrap().unwrap().active);
    }
}
