//! Alignment errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for alignment operations.
pub type AlignResult<T> = Result<T, AlignError>;

/// Errors from aligning or verifying a container.
#[derive(Debug, Error)]
pub enum AlignError {
    #[error("input archive not found: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("invalid alignment {0}: must be a non-zero power of two")]
    InvalidAlignment(u16),

    #[error("archive format error: {0}")]
    Format(#[from] ArchiveFormatError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Structural problems in the zip container.
#[derive(Debug, Error)]
pub enum ArchiveFormatError {
    #[error("end of central directory record not found")]
    EndOfCentralDirectoryMissing,

    #[error("bad {what} signature at offset {offset}")]
    BadSignature { what: &'static str, offset: u64 },

    #[error("truncated {what}")]
    Truncated { what: &'static str },

    #[error("central directory declares {expected} entries, found {found}")]
    EntryCountMismatch { expected: usize, found: usize },

    #[error("entry {name:?} missing at offset {offset}")]
    EntryMissing { name: String, offset: u64 },

    #[error("extra field of {name:?} cannot hold {needed} padding bytes")]
    ExtraFieldOverflow { name: String, needed: usize },

    #[error("unsupported archive: {0}")]
    Unsupported(String),

    #[error("zip reader: {0}")]
    Zip(String),
}

impl From<zip::result::ZipError> for AlignError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => AlignError::Io(e),
            other => AlignError::Format(ArchiveFormatError::Zip(other.to_string())),
        }
    }
}

impl AlignError {
    /// Map an unexpected EOF to a truncation error for the given record.
    pub(crate) fn eof_as_truncated(err: io::Error, what: &'static str) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            AlignError::Format(ArchiveFormatError::Truncated { what })
        } else {
            AlignError::Io(err)
        }
    }
}
