//! Configuration loading for testbay.
//!
//! `app.config.json` and `environments.json` are loaded as typed JSON
//! documents, then `app.config.json`'s values are overridden by a handful
//! of well-known environment variables. Both files live under a single
//! `configDir` resolved from `CONFIG_PATH` (default `.`).

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads `app.config.json` from `path`, applying field defaults for
/// anything absent. A missing file is not an error — it yields all
/// defaults, since every field has one.
pub fn load_app_config(path: &Path) -> Result<AppConfig> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config file: {}", path.display()));
        }
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Loads `app.config.json` from a JSON string. Used by tests.
pub fn load_app_config_str(content: &str) -> Result<AppConfig> {
    let mut config: AppConfig = serde_json::from_str(content).context("failed to parse config")?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// `PORT`, `TEST_ROOT`, `ARTIFACT_ROOT`, `DATABASE_PATH` override the
/// corresponding file value when set.
fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(port) = std::env::var("PORT") {
        config.port = port.parse().context("PORT must be a valid u16")?;
    }
    if let Ok(test_root) = std::env::var("TEST_ROOT") {
        config.test_root = test_root.into();
    }
    if let Ok(artifact_root) = std::env::var("ARTIFACT_ROOT") {
        config.artifact_root = artifact_root.into();
    }
    if let Ok(database_path) = std::env::var("DATABASE_PATH") {
        config.database_path = database_path.into();
    }
    Ok(())
}

/// Loads `environments.json`. Absent or malformed is a startup error — the
/// access policy has nothing meaningful to check requests against without
/// it.
pub fn load_environments(path: &Path) -> Result<Vec<Environment>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read environments file: {}", path.display()))?;
    let parsed: EnvironmentsFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse environments file: {}", path.display()))?;
    Ok(parsed.environments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_fields_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = load_app_config_str("{}").unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_concurrent_runs, 10);
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = load_app_config_str(r#"{"port": 8080, "maxConcurrentRuns": 4}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_concurrent_runs, 4);
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn port_env_var_overrides_file_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("PORT", "9090");
        }
        let config = load_app_config_str(r#"{"port": 3000}"#).unwrap();
        assert_eq!(config.port, 9090);
        unsafe {
            std::env::remove_var("PORT");
        }
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = load_app_config(Path::new("/nonexistent/app.config.json")).unwrap();
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn environments_file_parses_entries() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            r#"{"environments":[{"code":"SIT1","name":"SIT 1","isProd":false}]}"#,
        )
        .unwrap();
        let envs = load_environments(tmp.path()).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].code, "SIT1");
        assert!(!envs[0].is_prod);
    }
}
