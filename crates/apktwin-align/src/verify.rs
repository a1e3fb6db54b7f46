//! Alignment check, independent of the writer.
//!
//! Reads the archive back with the `zip` crate so a bug in our own record
//! handling does not hide itself.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use serde::Serialize;
use zip::{CompressionMethod, ZipArchive};

use crate::align::AlignOptions;
use crate::error::{AlignError, AlignResult};

/// A stored entry whose data does not start on its alignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Misaligned {
    pub name: String,
    pub data_offset: u64,
    pub alignment: u16,
}

/// Check every stored entry of the archive at `path`.
pub fn verify_alignment(path: &Path, options: &AlignOptions) -> AlignResult<Vec<Misaligned>> {
    if !path.is_file() {
        return Err(AlignError::InputMissing(path.to_path_buf()));
    }
    verify_reader(BufReader::new(File::open(path)?), options)
}

/// Check every stored entry of an archive read from `reader`.
pub fn verify_reader<R: Read + Seek>(reader: R, options: &AlignOptions) -> AlignResult<Vec<Misaligned>> {
    options.validate()?;
    let mut archive = ZipArchive::new(reader)?;
    let mut misaligned = Vec::new();
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        if file.compression() != CompressionMethod::Stored {
            continue;
        }
        let alignment = options.alignment_for(file.name());
        if file.data_start() % alignment as u64 != 0 {
            misaligned.push(Misaligned {
                name: file.name().to_string(),
                data_offset: file.data_start(),
                alignment,
            });
        }
    }
    Ok(misaligned)
}
