//! Failure taxonomy and stable exit codes

use serde::{Deserialize, Serialize};

use crate::state::Stage;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Run produced a signed artifact
    Success,
    /// Run failed at some stage
    Failed,
    /// Run was cancelled
    Cancelled,
}

impl Status {
    /// Check if this is a failure state
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failed | Status::Cancelled)
    }
}

/// Failure kind - categorizes the cause of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// External tool exited nonzero or could not be started
    ExternalTool,
    /// External tool exceeded its time limit
    Timeout,
    /// Run was cancelled
    Cancelled,
    /// Manifest missing, malformed or without a package
    ManifestParse,
    /// Identifier already carries the inserted segment
    AlreadyRewritten,
    /// File system operation failed
    FileSystem,
    /// Archive could not be aligned
    ArchiveFormat,
    /// Another run for the same base name is in flight
    Busy,
    /// Invalid configuration
    Config,
    /// Pipeline state machine violation
    Internal,
}

impl FailureKind {
    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::ExternalTool => "External tool failed",
            FailureKind::Timeout => "External tool timed out",
            FailureKind::Cancelled => "Run cancelled",
            FailureKind::ManifestParse => "Package could not be read from the manifest",
            FailureKind::AlreadyRewritten => "Package identifier already rewritten",
            FailureKind::FileSystem => "File system error",
            FailureKind::ArchiveFormat => "Archive format error",
            FailureKind::Busy => "Another run for this archive is in progress",
            FailureKind::Config => "Invalid configuration",
            FailureKind::Internal => "Internal pipeline error",
        }
    }
}

/// Stable exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Usage or configuration error
    Usage = 1,
    /// Unpack stage failed
    UnpackFailed = 10,
    /// Rewrite stage failed
    RewriteFailed = 20,
    /// Repack stage failed
    RepackFailed = 30,
    /// Sign stage failed
    SignFailed = 40,
    /// External tool timed out
    Timeout = 50,
    /// Run was cancelled
    Cancelled = 80,
    /// Another run for the same archive is in flight
    Busy = 90,
}

impl ExitCode {
    /// Get the integer value of the exit code
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Create from integer value
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::Usage),
            10 => Some(ExitCode::UnpackFailed),
            20 => Some(ExitCode::RewriteFailed),
            30 => Some(ExitCode::RepackFailed),
            40 => Some(ExitCode::SignFailed),
            50 => Some(ExitCode::Timeout),
            80 => Some(ExitCode::Cancelled),
            90 => Some(ExitCode::Busy),
            _ => None,
        }
    }

    /// Exit code for a failure of `kind` during `stage`.
    ///
    /// Timeout, cancellation, busy and config failures have their own codes
    /// regardless of stage.
    pub fn for_failure(stage: Stage, kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => ExitCode::Timeout,
            FailureKind::Cancelled => ExitCode::Cancelled,
            FailureKind::Busy => ExitCode::Busy,
            FailureKind::Config => ExitCode::Usage,
            _ => match stage {
                Stage::Unpack => ExitCode::UnpackFailed,
                Stage::Rewrite => ExitCode::RewriteFailed,
                Stage::Repack => ExitCode::RepackFailed,
                Stage::Sign => ExitCode::SignFailed,
            },
        }
    }

    /// Check if this exit code indicates success
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

impl Default for ExitCode {
    fn default() -> Self {
        ExitCode::Success
    }
}
