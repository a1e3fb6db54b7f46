//! Zip entry alignment for APK containers.
//!
//! Rewrites a container so that the data of every stored entry starts on a
//! fixed byte boundary, which lets the platform map it directly. Entry order,
//! names, metadata and payload bytes are preserved.

mod align;
mod error;
mod format;
mod verify;

pub use align::{
    align_file, align_stream, AlignOptions, AlignReport, AlignedEntry, ALIGNMENT_EXTRA_ID,
    DEFAULT_ALIGNMENT, DEFAULT_PAGE_SIZE,
};
pub use error::{AlignError, AlignResult, ArchiveFormatError};
pub use format::{read_entries, ZipEntryRecord};
pub use verify::{verify_alignment, verify_reader, Misaligned};
