//! Container alignment.
//!
//! Entries are copied in central directory order. Stored entries get an
//! alignment block (`0xD935`, the id Android tooling uses) appended to their
//! local extra field so that their data starts on a multiple of the
//! alignment. Entry data, including compressed data, is copied raw and never
//! recompressed. Anything between entries that is not referenced by the
//! central directory (old padding, an APK signing block) is dropped; the
//! archive is re-signed after alignment.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{AlignError, AlignResult, ArchiveFormatError};
use crate::format::{
    read_central_directory, LocalHeader, DATA_DESCRIPTOR_SIGNATURE, LOCAL_HEADER_LEN,
    METHOD_STORED,
};

/// Default alignment for stored entries.
pub const DEFAULT_ALIGNMENT: u16 = 4;

/// Page size used for shared libraries when page alignment is on.
pub const DEFAULT_PAGE_SIZE: u16 = 4096;

/// Extra field id of the alignment block.
pub const ALIGNMENT_EXTRA_ID: u16 = 0xD935;

/// Extra field id the `zip` crate writes for `start_file_aligned` padding.
const ZIP_CRATE_PADDING_ID: u16 = 0x617a;

/// Header, id and alignment value of an alignment block.
const ALIGNMENT_BLOCK_MIN: usize = 6;

/// Alignment settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignOptions {
    /// Alignment for stored entries, in bytes.
    pub alignment: u16,
    /// Align stored `lib/**/*.so` entries to `page_size` instead.
    pub page_align_libs: bool,
    pub page_size: u16,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            page_align_libs: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl AlignOptions {
    pub fn validate(&self) -> AlignResult<()> {
        for value in [self.alignment, self.page_size] {
            if value == 0 || !value.is_power_of_two() {
                return Err(AlignError::InvalidAlignment(value));
            }
        }
        Ok(())
    }

    /// Alignment that applies to a stored entry called `name`.
    pub fn alignment_for(&self, name: &str) -> u16 {
        if self.page_align_libs && name.starts_with("lib/") && name.ends_with(".so") {
            self.page_size
        } else {
            self.alignment
        }
    }
}

/// Where one entry ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlignedEntry {
    pub name: String,
    pub stored: bool,
    pub data_offset: u64,
    /// Alignment applied, `None` for compressed entries.
    pub alignment: Option<u16>,
    /// Bytes added to the local extra field.
    pub padding: usize,
}

/// Result of an alignment pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlignReport {
    pub entries: Vec<AlignedEntry>,
    pub output_size: u64,
}

impl AlignReport {
    pub fn stored_count(&self) -> usize {
        self.entries.iter().filter(|e| e.stored).count()
    }

    pub fn padded_count(&self) -> usize {
        self.entries.iter().filter(|e| e.padding > 0).count()
    }

    pub fn total_padding(&self) -> u64 {
        self.entries.iter().map(|e| e.padding as u64).sum()
    }
}

/// Align `input` into `output`.
///
/// The result is assembled in a temporary file next to `output` and
/// persisted over it only when complete. `input` and `output` may be the
/// same path.
pub fn align_file(input: &Path, output: &Path, options: &AlignOptions) -> AlignResult<AlignReport> {
    options.validate()?;
    if !input.is_file() {
        return Err(AlignError::InputMissing(input.to_path_buf()));
    }

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;

    let report = {
        let mut reader = BufReader::new(File::open(input)?);
        let mut writer = BufWriter::new(temp.as_file_mut());
        let report = align_stream(&mut reader, &mut writer, options)?;
        writer.flush()?;
        report
    };
    temp.as_file().sync_all()?;
    temp.persist(output).map_err(|e| AlignError::Io(e.error))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        entries = report.entries.len(),
        padded = report.padded_count(),
        "archive aligned"
    );
    Ok(report)
}

/// Align a container read from `reader` into `writer`.
pub fn align_stream<R, W>(reader: &mut R, writer: &mut W, options: &AlignOptions) -> AlignResult<AlignReport>
where
    R: Read + Seek,
    W: Write,
{
    options.validate()?;
    let (mut eocd, mut records) = read_central_directory(reader)?;
    let mut out = CountingWriter::new(writer);
    let mut entries = Vec::with_capacity(records.len());

    for record in records.iter_mut() {
        let name = record.name_lossy();
        let offset = record.local_header_offset() as u64;
        reader.seek(SeekFrom::Start(offset))?;
        let local = match LocalHeader::read(reader) {
            Ok(Some(local)) => local,
            Ok(None) => return Err(ArchiveFormatError::EntryMissing { name, offset }.into()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ArchiveFormatError::EntryMissing { name, offset }.into())
            }
            Err(e) => return Err(e.into()),
        };

        let stored = record.method() == METHOD_STORED;
        let header_start = out.position();
        let mut extra = strip_alignment_padding(&local.extra);
        let alignment = stored.then(|| options.alignment_for(&name));
        let mut padding = 0;
        if let Some(alignment) = alignment {
            let data_start =
                header_start + (LOCAL_HEADER_LEN + local.name.len() + extra.len()) as u64;
            padding = padding_for(data_start, alignment);
            if padding > 0 {
                if extra.len() + padding > u16::MAX as usize {
                    return Err(ArchiveFormatError::ExtraFieldOverflow {
                        name,
                        needed: padding,
                    }
                    .into());
                }
                push_alignment_block(&mut extra, alignment, padding);
            }
        }

        record.set_local_header_offset(to_u32(header_start)?);
        local.write_with_extra(&mut out, &extra)?;
        let data_offset = out.position();

        let data_len = record.compressed_size() as u64;
        let copied = io::copy(&mut reader.by_ref().take(data_len), &mut out)?;
        if copied != data_len {
            return Err(ArchiveFormatError::Truncated { what: "entry data" }.into());
        }
        if record.has_data_descriptor() {
            copy_data_descriptor(reader, &mut out)?;
        }

        if padding > 0 {
            debug!(entry = %name, padding, data_offset, "padded stored entry");
        }
        entries.push(AlignedEntry {
            name,
            stored,
            data_offset,
            alignment,
            padding,
        });
    }

    let cd_offset = out.position();
    for record in &records {
        record.write(&mut out)?;
    }
    let cd_size = out.position() - cd_offset;
    eocd.cd_offset = to_u32(cd_offset)?;
    eocd.cd_size = to_u32(cd_size)?;
    eocd.write(&mut out)?;

    Ok(AlignReport {
        entries,
        output_size: out.position(),
    })
}

/// Extra bytes needed so that data at `data_start` lands on `alignment`.
///
/// Zero when already aligned, otherwise at least the size of an alignment
/// block.
fn padding_for(data_start: u64, alignment: u16) -> usize {
    let alignment = alignment as u64;
    if data_start % alignment == 0 {
        return 0;
    }
    let min = ALIGNMENT_BLOCK_MIN as u64;
    (min + (alignment - (data_start + min) % alignment) % alignment) as usize
}

fn push_alignment_block(extra: &mut Vec<u8>, alignment: u16, padding: usize) {
    let mut header = [0u8; ALIGNMENT_BLOCK_MIN];
    LittleEndian::write_u16(&mut header[0..2], ALIGNMENT_EXTRA_ID);
    LittleEndian::write_u16(&mut header[2..4], (padding - 4) as u16);
    LittleEndian::write_u16(&mut header[4..6], alignment);
    extra.extend_from_slice(&header);
    extra.resize(extra.len() + padding - ALIGNMENT_BLOCK_MIN, 0);
}

/// Drop earlier alignment padding from a local extra field.
///
/// Well-formed blocks are kept except alignment blocks. A trailing run of
/// zero bytes (classic zipalign padding) is dropped; any other malformed
/// tail is kept verbatim.
fn strip_alignment_padding(extra: &[u8]) -> Vec<u8> {
    let mut kept = Vec::with_capacity(extra.len());
    let mut i = 0;
    while i + 4 <= extra.len() {
        let id = LittleEndian::read_u16(&extra[i..i + 2]);
        let size = LittleEndian::read_u16(&extra[i + 2..i + 4]) as usize;
        let end = i + 4 + size;
        if end > extra.len() {
            break;
        }
        if id != ALIGNMENT_EXTRA_ID && id != ZIP_CRATE_PADDING_ID && !(id == 0 && size == 0) {
            kept.extend_from_slice(&extra[i..end]);
        }
        i = end;
    }
    let tail = &extra[i..];
    if tail.iter().any(|b| *b != 0) {
        kept.extend_from_slice(tail);
    }
    kept
}

fn copy_data_descriptor<R: Read, W: Write>(reader: &mut R, out: &mut W) -> AlignResult<()> {
    let mut head = [0u8; 4];
    reader
        .read_exact(&mut head)
        .map_err(|e| AlignError::eof_as_truncated(e, "data descriptor"))?;
    // The descriptor signature is optional: crc + sizes are 12 bytes without it.
    let rest = if LittleEndian::read_u32(&head) == DATA_DESCRIPTOR_SIGNATURE {
        12
    } else {
        8
    };
    let mut body = vec![0u8; rest];
    reader
        .read_exact(&mut body)
        .map_err(|e| AlignError::eof_as_truncated(e, "data descriptor"))?;
    out.write_all(&head)?;
    out.write_all(&body)?;
    Ok(())
}

fn to_u32(value: u64) -> AlignResult<u32> {
    u32::try_from(value).map_err(|_| {
        ArchiveFormatError::Unsupported("output exceeds 4 GiB without zip64".to_string()).into()
    })
}

/// Tracks the output position without needing `Seek`.
struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    position: u64,
}

impl<'a, W: Write> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, position: 0 }
    }

    fn position(&self) -> u64 {
        self.position
    }
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
