//! Data model shared by the store, executor, scheduler, and HTTP surface.
//!
//! These types mirror the catalog/run/schedule rows described in the data
//! model: JSON-valued columns are represented here as their parsed Rust
//! shape and (de)serialized at the store boundary, not carried around as
//! raw strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

/// Status of a [`RunTest`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTestStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl RunTestStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => return None,
        })
    }
}

/// What triggered a run into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Schedule,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "manual" => Self::Manual,
            "schedule" => Self::Schedule,
            _ => return None,
        })
    }
}

/// Per-environment and shared constants attached to a [`TestDefinition`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantSet {
    #[serde(default)]
    pub shared: HashMap<String, Value>,
    #[serde(default)]
    pub environments: HashMap<String, HashMap<String, Value>>,
}

/// Friendly metadata parsed from a test folder's `meta.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMeta {
    pub friendly_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A catalog entry for one discovered spec file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub id: Uuid,
    pub test_key: String,
    pub folder_path: String,
    pub spec_path: String,
    pub meta: TestMeta,
    pub constants: ConstantSet,
    pub overrides: Option<ConstantSet>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filenames of the artifacts recorded for one [`RunTest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTestArtifacts {
    pub console_log: Option<String>,
    pub video: Option<String>,
    pub trace: Option<String>,
}

/// One spec's execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTest {
    pub run_id: Uuid,
    pub test_id: Uuid,
    pub test_key: String,
    pub status: RunTestStatus,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub artifacts: RunTestArtifacts,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Totals and duration recorded against a finished (or in-flight) [`Run`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: Option<i64>,
}

/// One orchestrated execution against one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub environment: String,
    pub schedule_id: Option<Uuid>,
    pub triggered_by_email: Option<String>,
    pub run_overrides: HashMap<String, Value>,
    pub metadata: Value,
    pub summary: RunSummary,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A run bundled together with its per-test rows, as returned by the "get
/// run with tests" HTTP operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWithTests {
    #[serde(flatten)]
    pub run: Run,
    pub tests: Vec<RunTest>,
}

/// Tagged variant describing which active tests a schedule materializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Selector {
    Folder {
        #[serde(rename = "folderPrefix")]
        folder_prefix: String,
    },
    Tags {
        tags: Vec<String>,
    },
    Explicit {
        #[serde(rename = "testKeys")]
        test_keys: Vec<String>,
    },
}

/// A recurring run template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub environment: String,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub selector: Selector,
    pub default_run_overrides: Option<HashMap<String, Value>>,
    pub created_by_email: String,
    pub updated_by_email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
