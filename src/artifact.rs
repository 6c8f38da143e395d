//! Path-safe access to `<artifactRoot>/<runId>/<testKey>/...`.
//!
//! Every public function rejects filenames containing `..`, `/`, or `\` —
//! the HTTP artifact route and the executor's own log/video writers are
//! both required to go through here rather than building paths by hand.

use std::path::{Path, PathBuf};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("unsafe filename: {0}")]
    UnsafeFilename(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

/// The directory for one run's artifacts: `<root>/<runId>/`.
pub fn run_dir(root: &Path, run_id: Uuid) -> PathBuf {
    root.join(run_id.to_string())
}

/// The directory for one test's artifacts within a run:
/// `<root>/<runId>/<testKey>/`.
pub fn test_dir(root: &Path, run_id: Uuid, test_key: &str) -> Result<PathBuf, ArtifactError> {
    if !is_safe_component(test_key) {
        return Err(ArtifactError::UnsafeFilename(test_key.to_string()));
    }
    Ok(run_dir(root, run_id).join(test_key))
}

pub async fn ensure_test_dir(
    root: &Path,
    run_id: Uuid,
    test_key: &str,
) -> Result<PathBuf, ArtifactError> {
    let dir = test_dir(root, run_id, test_key)?;
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Resolves `filename` inside a test's artifact directory, rejecting any
/// path-traversal attempt.
pub fn resolve_artifact_path(
    root: &Path,
    run_id: Uuid,
    test_key: &str,
    filename: &str,
) -> Result<PathBuf, ArtifactError> {
    if !is_safe_component(filename) {
        return Err(ArtifactError::UnsafeFilename(filename.to_string()));
    }
    Ok(test_dir(root, run_id, test_key)?.join(filename))
}

pub const CONSOLE_LOG: &str = "console.log";
pub const LIVE_SCREENSHOT: &str = "live.jpg";
pub const VIDEO: &str = "video.webm";

/// Appends `bytes` to a test's `console.log`, creating it (with the header
/// line already written) if absent.
pub async fn append_console_log(dir: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(CONSOLE_LOG))
        .await?;
    file.write_all(bytes).await?;
    Ok(())
}

pub async fn seed_console_log(dir: &Path, header: &str) -> Result<(), ArtifactError> {
    tokio::fs::write(dir.join(CONSOLE_LOG), header).await?;
    Ok(())
}

/// Deletes the live screenshot after a test ends, if present.
pub async fn delete_live_screenshot(dir: &Path) -> Result<(), ArtifactError> {
    let path = dir.join(LIVE_SCREENSHOT);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recursively searches `dir` for the first `*.webm` or `*.mp4`; if found
/// and not already named `video.webm` at the root, renames it there.
/// Returns the filename recorded in `RunTestArtifacts.video`.
pub async fn locate_and_normalize_video(dir: &Path) -> Result<Option<String>, ArtifactError> {
    let found = find_video_file(dir);
    let Some(found) = found else { return Ok(None) };

    let target = dir.join(VIDEO);
    if found != target {
        tokio::fs::rename(&found, &target).await?;
    }
    Ok(Some(VIDEO.to_string()))
}

fn find_video_file(dir: &Path) -> Option<PathBuf> {
    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry.path().extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext.eq_ignore_ascii_case("webm") || ext.eq_ignore_ascii_case("mp4") {
            return Some(entry.path().to_path_buf());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_in_test_key() {
        assert!(test_dir(Path::new("/root"), Uuid::new_v4(), "../../etc").is_err());
    }

    #[test]
    fn rejects_traversal_in_filename() {
        let root = Path::new("/root");
        let run_id = Uuid::new_v4();
        assert!(resolve_artifact_path(root, run_id, "auth.login", "../secret").is_err());
        assert!(resolve_artifact_path(root, run_id, "auth.login", "a/b").is_err());
    }

    #[tokio::test]
    async fn locate_and_normalize_renames_nested_video() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("sub");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("recording.webm"), b"x").await.unwrap();

        let name = locate_and_normalize_video(tmp.path()).await.unwrap();
        assert_eq!(name.as_deref(), Some(VIDEO));
        assert!(tmp.path().join(VIDEO).exists());
    }

    #[tokio::test]
    async fn locate_and_normalize_returns_none_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(locate_and_normalize_video(tmp.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_console_log_accumulates_without_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        seed_console_log(tmp.path(), "header\n").await.unwrap();
        append_console_log(tmp.path(), b"line1\n").await.unwrap();
        append_console_log(tmp.path(), b"line2\n").await.unwrap();
        let contents = tokio::fs::read_to_string(tmp.path().join(CONSOLE_LOG)).await.unwrap();
        assert_eq!(contents, "header\nline1\nline2\n");
    }
}
