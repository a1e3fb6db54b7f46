//! Raw zip records.
//!
//! Only the classic (non-zip64) layout is handled: local file headers,
//! central directory file headers and the end of central directory record.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::error::{AlignError, AlignResult, ArchiveFormatError};

pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
pub const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

pub const LOCAL_HEADER_LEN: usize = 30;
pub const CENTRAL_HEADER_LEN: usize = 46;
pub const END_OF_CENTRAL_DIRECTORY_LEN: usize = 22;

/// General purpose flag: sizes and CRC follow the data in a descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

/// Compression method 0.
pub const METHOD_STORED: u16 = 0;

/// Public summary of one entry, in central directory order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZipEntryRecord {
    pub name: String,
    pub method: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub local_header_offset: u64,
}

impl ZipEntryRecord {
    /// Stored (uncompressed) entries are the ones that get aligned.
    pub fn is_stored(&self) -> bool {
        self.method == METHOD_STORED
    }
}

/// A central directory file header, kept raw so it can be re-emitted.
#[derive(Debug, Clone)]
pub(crate) struct CentralRecord {
    fixed: [u8; CENTRAL_HEADER_LEN],
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralRecord {
    pub fn read<R: Read>(reader: &mut R, offset: u64) -> AlignResult<Self> {
        let mut fixed = [0u8; CENTRAL_HEADER_LEN];
        reader
            .read_exact(&mut fixed)
            .map_err(|e| AlignError::eof_as_truncated(e, "central directory"))?;
        if LittleEndian::read_u32(&fixed[0..4]) != CENTRAL_HEADER_SIGNATURE {
            return Err(ArchiveFormatError::BadSignature {
                what: "central directory header",
                offset,
            }
            .into());
        }
        let name_len = LittleEndian::read_u16(&fixed[28..30]) as usize;
        let extra_len = LittleEndian::read_u16(&fixed[30..32]) as usize;
        let comment_len = LittleEndian::read_u16(&fixed[32..34]) as usize;

        let mut name = vec![0u8; name_len];
        let mut extra = vec![0u8; extra_len];
        let mut comment = vec![0u8; comment_len];
        for buf in [&mut name, &mut extra, &mut comment] {
            reader
                .read_exact(buf)
                .map_err(|e| AlignError::eof_as_truncated(e, "central directory"))?;
        }

        let record = Self {
            fixed,
            name,
            extra,
            comment,
        };
        if record.compressed_size() == u32::MAX
            || record.uncompressed_size() == u32::MAX
            || record.local_header_offset() == u32::MAX
        {
            return Err(ArchiveFormatError::Unsupported(format!(
                "zip64 entry {:?}",
                record.name_lossy()
            ))
            .into());
        }
        Ok(record)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<u64> {
        writer.write_all(&self.fixed)?;
        writer.write_all(&self.name)?;
        writer.write_all(&self.extra)?;
        writer.write_all(&self.comment)?;
        Ok(self.len())
    }

    pub fn len(&self) -> u64 {
        (CENTRAL_HEADER_LEN + self.name.len() + self.extra.len() + self.comment.len()) as u64
    }

    pub fn flags(&self) -> u16 {
        LittleEndian::read_u16(&self.fixed[8..10])
    }

    pub fn method(&self) -> u16 {
        LittleEndian::read_u16(&self.fixed[10..12])
    }

    pub fn crc32(&self) -> u32 {
        LittleEndian::read_u32(&self.fixed[16..20])
    }

    pub fn compressed_size(&self) -> u32 {
        LittleEndian::read_u32(&self.fixed[20..24])
    }

    pub fn uncompressed_size(&self) -> u32 {
        LittleEndian::read_u32(&self.fixed[24..28])
    }

    pub fn local_header_offset(&self) -> u32 {
        LittleEndian::read_u32(&self.fixed[42..46])
    }

    pub fn set_local_header_offset(&mut self, offset: u32) {
        LittleEndian::write_u32(&mut self.fixed[42..46], offset);
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags() & FLAG_DATA_DESCRIPTOR != 0
    }

    pub fn summary(&self) -> ZipEntryRecord {
        ZipEntryRecord {
            name: self.name_lossy(),
            method: self.method(),
            compressed_size: self.compressed_size() as u64,
            uncompressed_size: self.uncompressed_size() as u64,
            crc32: self.crc32(),
            local_header_offset: self.local_header_offset() as u64,
        }
    }
}

/// A local file header with its name and extra field.
#[derive(Debug, Clone)]
pub(crate) struct LocalHeader {
    fixed: [u8; LOCAL_HEADER_LEN],
    pub name: Vec<u8>,
    pub extra: Vec<u8>,
}

impl LocalHeader {
    pub fn read<R: Read>(reader: &mut R) -> std::io::Result<Option<Self>> {
        let mut fixed = [0u8; LOCAL_HEADER_LEN];
        reader.read_exact(&mut fixed)?;
        if LittleEndian::read_u32(&fixed[0..4]) != LOCAL_HEADER_SIGNATURE {
            return Ok(None);
        }
        let name_len = LittleEndian::read_u16(&fixed[26..28]) as usize;
        let extra_len = LittleEndian::read_u16(&fixed[28..30]) as usize;
        let mut name = vec![0u8; name_len];
        let mut extra = vec![0u8; extra_len];
        reader.read_exact(&mut name)?;
        reader.read_exact(&mut extra)?;
        Ok(Some(Self { fixed, name, extra }))
    }

    /// Write the header with `extra` replacing the original extra field.
    pub fn write_with_extra<W: Write>(&self, writer: &mut W, extra: &[u8]) -> std::io::Result<u64> {
        let mut fixed = self.fixed;
        LittleEndian::write_u16(&mut fixed[28..30], extra.len() as u16);
        writer.write_all(&fixed)?;
        writer.write_all(&self.name)?;
        writer.write_all(extra)?;
        Ok((LOCAL_HEADER_LEN + self.name.len() + extra.len()) as u64)
    }
}

/// The end of central directory record.
#[derive(Debug, Clone)]
pub(crate) struct EndOfCentralDirectory {
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    /// Scan backwards from the end of the input for the record.
    pub fn find<R: Read + Seek>(reader: &mut R) -> AlignResult<(u64, Self)> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        if file_len < END_OF_CENTRAL_DIRECTORY_LEN as u64 {
            return Err(ArchiveFormatError::EndOfCentralDirectoryMissing.into());
        }
        let max_back = (END_OF_CENTRAL_DIRECTORY_LEN + u16::MAX as usize) as u64;
        let tail_start = file_len.saturating_sub(max_back);
        let mut tail = Vec::with_capacity((file_len - tail_start) as usize);
        reader.seek(SeekFrom::Start(tail_start))?;
        reader.by_ref().take(file_len - tail_start).read_to_end(&mut tail)?;

        let mut pos = tail.len() - END_OF_CENTRAL_DIRECTORY_LEN;
        loop {
            if LittleEndian::read_u32(&tail[pos..pos + 4]) == END_OF_CENTRAL_DIRECTORY_SIGNATURE {
                let comment_len = LittleEndian::read_u16(&tail[pos + 20..pos + 22]) as usize;
                let end = pos + END_OF_CENTRAL_DIRECTORY_LEN + comment_len;
                if end <= tail.len() {
                    let record = Self {
                        disk_entries: LittleEndian::read_u16(&tail[pos + 8..pos + 10]),
                        total_entries: LittleEndian::read_u16(&tail[pos + 10..pos + 12]),
                        cd_size: LittleEndian::read_u32(&tail[pos + 12..pos + 16]),
                        cd_offset: LittleEndian::read_u32(&tail[pos + 16..pos + 20]),
                        comment: tail[pos + END_OF_CENTRAL_DIRECTORY_LEN..end].to_vec(),
                    };
                    let eocd_offset = tail_start + pos as u64;
                    record.reject_zip64(reader, eocd_offset)?;
                    return Ok((eocd_offset, record));
                }
            }
            if pos == 0 {
                break;
            }
            pos -= 1;
        }
        Err(ArchiveFormatError::EndOfCentralDirectoryMissing.into())
    }

    fn reject_zip64<R: Read + Seek>(&self, reader: &mut R, eocd_offset: u64) -> AlignResult<()> {
        if self.total_entries == u16::MAX || self.cd_offset == u32::MAX || self.cd_size == u32::MAX
        {
            return Err(ArchiveFormatError::Unsupported("zip64 archive".to_string()).into());
        }
        if eocd_offset >= 20 {
            reader.seek(SeekFrom::Start(eocd_offset - 20))?;
            if reader.read_u32::<LittleEndian>()? == ZIP64_LOCATOR_SIGNATURE {
                return Err(ArchiveFormatError::Unsupported("zip64 archive".to_string()).into());
            }
        }
        Ok(())
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(END_OF_CENTRAL_DIRECTORY_SIGNATURE)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u16::<LittleEndian>(self.disk_entries)?;
        writer.write_u16::<LittleEndian>(self.total_entries)?;
        writer.write_u32::<LittleEndian>(self.cd_size)?;
        writer.write_u32::<LittleEndian>(self.cd_offset)?;
        writer.write_u16::<LittleEndian>(self.comment.len() as u16)?;
        writer.write_all(&self.comment)?;
        Ok(())
    }
}

/// Read the central directory in stored order.
pub(crate) fn read_central_directory<R: Read + Seek>(
    reader: &mut R,
) -> AlignResult<(EndOfCentralDirectory, Vec<CentralRecord>)> {
    let (_, eocd) = EndOfCentralDirectory::find(reader)?;
    reader.seek(SeekFrom::Start(eocd.cd_offset as u64))?;

    let mut cd = Vec::with_capacity(eocd.cd_size as usize);
    reader.by_ref().take(eocd.cd_size as u64).read_to_end(&mut cd)?;
    if cd.len() < eocd.cd_size as usize {
        return Err(ArchiveFormatError::Truncated {
            what: "central directory",
        }
        .into());
    }

    let expected = eocd.total_entries as usize;
    let mut records = Vec::with_capacity(expected);
    let mut cursor = std::io::Cursor::new(cd);
    while (cursor.position() as usize) < cursor.get_ref().len() && records.len() < expected {
        let offset = eocd.cd_offset as u64 + cursor.position();
        records.push(CentralRecord::read(&mut cursor, offset)?);
    }
    if records.len() != expected {
        return Err(ArchiveFormatError::EntryCountMismatch {
            expected,
            found: records.len(),
        }
        .into());
    }
    Ok((eocd, records))
}

/// List the entries of a container in stored order.
pub fn read_entries<R: Read + Seek>(reader: &mut R) -> AlignResult<Vec<ZipEntryRecord>> {
    let (_, records) = read_central_directory(reader)?;
    Ok(records.iter().map(CentralRecord::summary).collect())
}
