//! Run summary (run_summary.json)
//!
//! Written to the per-archive workspace directory after every run that got
//! as far as creating one. Never written to the output directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::failure::{FailureKind, Status};
use super::outcome::RunOutcome;
use crate::state::Stage;

/// Schema version for run_summary.json
pub const RUN_SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for run_summary.json
pub const RUN_SUMMARY_SCHEMA_ID: &str = "apktwin/run_summary@1";

/// File name of the summary inside the workspace directory
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Wall-clock time spent in one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
    pub succeeded: bool,
}

/// Run summary (run_summary.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Run identifier (ULID)
    pub run_id: String,

    /// When the summary was created
    pub created_at: DateTime<Utc>,

    /// Input archive
    pub archive: PathBuf,

    /// Package identifier read from the manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_identifier: Option<String>,

    /// Package identifier after insertion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_identifier: Option<String>,

    /// Overall status
    pub status: Status,

    /// Process exit code for this run
    pub exit_code: i32,

    /// Failure category, if the run failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    /// Stage that failed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,

    /// Stages that ran, in order
    pub stages: Vec<StageTiming>,

    /// SHA-256 of the final archive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,

    /// Wall-clock duration of the entire run in milliseconds
    pub duration_ms: u64,

    /// Human-readable summary
    pub human_summary: String,
}

impl RunSummary {
    /// Build a summary from a finished run
    pub fn from_outcome(
        run_id: String,
        archive: PathBuf,
        outcome: &RunOutcome,
        stages: Vec<StageTiming>,
        duration_ms: u64,
    ) -> Self {
        let failure = outcome.failure_detail();
        Self {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION,
            schema_id: RUN_SUMMARY_SCHEMA_ID.to_string(),
            run_id,
            created_at: Utc::now(),
            archive,
            old_identifier: None,
            new_identifier: outcome.artifact().map(|a| a.identifier.clone()),
            status: outcome.status(),
            exit_code: outcome.exit_code().as_i32(),
            failure_kind: failure.map(|f| f.kind),
            failed_stage: failure.map(|f| f.stage),
            stages,
            artifact_sha256: outcome.artifact().map(|a| a.sha256.clone()),
            duration_ms,
            human_summary: outcome.describe(),
        }
    }

    /// Record the identifiers once they are known
    pub fn with_identifiers(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_identifier = old;
        if new.is_some() {
            self.new_identifier = new;
        }
        self
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)
    }

    /// Load from file
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))
    }
}
