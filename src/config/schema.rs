//! Typed schema for `app.config.json` and `environments.json`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    3000
}

fn default_test_root() -> PathBuf {
    PathBuf::from("tests")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("testbay.db")
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_retention_days() -> i64 {
    30
}

/// `app.config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_test_root")]
    pub test_root: PathBuf,
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            test_root: default_test_root(),
            artifact_root: default_artifact_root(),
            database_path: default_database_path(),
            max_concurrent_runs: default_max_concurrent_runs(),
            retention_days: default_retention_days(),
        }
    }
}

/// One entry of `environments.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub code: String,
    pub name: String,
    #[serde(default, rename = "isProd")]
    pub is_prod: bool,
}

#[derive(Debug, Deserialize)]
pub struct EnvironmentsFile {
    pub environments: Vec<Environment>,
}
