//! Rewrite error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while rewriting a decompiled tree.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("cannot read package from manifest {}: {reason}", .path.display())]
    ManifestParse { path: PathBuf, reason: String },

    #[error("invalid package identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("package {identifier} already contains segment {segment:?} at index 1")]
    AlreadyRewritten { identifier: String, segment: String },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot move {} to {}: {reason}", .from.display(), .to.display())]
    Relocation {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },
}

/// Coarse classification used by callers that report failures by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteErrorKind {
    ManifestParse,
    AlreadyRewritten,
    FileSystem,
}

impl RewriteError {
    pub fn kind(&self) -> RewriteErrorKind {
        match self {
            RewriteError::ManifestParse { .. } | RewriteError::InvalidIdentifier { .. } => {
                RewriteErrorKind::ManifestParse
            }
            RewriteError::AlreadyRewritten { .. } => RewriteErrorKind::AlreadyRewritten,
            RewriteError::Io { .. } | RewriteError::Relocation { .. } => {
                RewriteErrorKind::FileSystem
            }
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RewriteError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for rewrite operations.
pub type RewriteResult<T> = Result<T, RewriteError>;
