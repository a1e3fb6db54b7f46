//! Terminal result of a pipeline run

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::failure::{ExitCode, FailureKind, Status};
use crate::state::Stage;

/// The signed archive produced by a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// Final archive path (`<output>/<base>/<new-id>.apk`)
    pub path: PathBuf,

    /// New package identifier, dotted
    pub identifier: String,

    /// SHA-256 of the archive bytes, hex
    pub sha256: String,

    /// Archive size in bytes
    pub size: u64,

    /// Companion expansion files copied next to the archive
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obb_files: Vec<PathBuf>,
}

/// Why a run stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Stage that was active when the run failed
    pub stage: Stage,

    /// Failure category
    pub kind: FailureKind,

    /// Human-readable detail
    pub message: String,

    /// Exit status of the external tool, when one ran and exited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Outcome of one run; built once and never changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Success { artifact: BuildArtifact },
    Failure(StageFailure),
}

impl RunOutcome {
    pub fn failure(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        RunOutcome::Failure(StageFailure {
            stage,
            kind,
            message: message.into(),
            exit_code: None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    pub fn artifact(&self) -> Option<&BuildArtifact> {
        match self {
            RunOutcome::Success { artifact } => Some(artifact),
            RunOutcome::Failure(_) => None,
        }
    }

    pub fn failure_detail(&self) -> Option<&StageFailure> {
        match self {
            RunOutcome::Success { .. } => None,
            RunOutcome::Failure(failure) => Some(failure),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            RunOutcome::Success { .. } => Status::Success,
            RunOutcome::Failure(f) if f.kind == FailureKind::Cancelled => Status::Cancelled,
            RunOutcome::Failure(_) => Status::Failed,
        }
    }

    /// Process exit code for this outcome
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunOutcome::Success { .. } => ExitCode::Success,
            RunOutcome::Failure(f) => ExitCode::for_failure(f.stage, f.kind),
        }
    }

    /// One-line description for terminals and logs
    pub fn describe(&self) -> String {
        match self {
            RunOutcome::Success { artifact } => {
                format!("built {} ({} bytes)", artifact.path.display(), artifact.size)
            }
            RunOutcome::Failure(f) => match f.exit_code {
                Some(code) => format!(
                    "{} failed ({}, exit {}): {}",
                    f.stage,
                    f.kind.description(),
                    code,
                    f.message
                ),
                None => format!("{} failed ({}): {}", f.stage, f.kind.description(), f.message),
            },
        }
    }
}
