//! On-disk format of one epoch's log segment.
//!
//! ```text
//! +-------------+-------------+-----------+
//! | "LDBL" (4B) | version u32 | epoch u64 |   header
//! +-------------+-------------+-----------+
//! | 0x01 | klen u32 | key | vlen u32 | value |   write record, repeated
//! +------+----------+-----+----------+-------+
//! | 0xFF | epoch u64 | crc32 u32 |   end marker
//! +------+-----------+-----------+
//! ```
//!
//! Integers are little-endian. The CRC32 (Castagnoli) covers every byte from
//! the header through the end marker's epoch. A file without a valid end
//! marker was never durable and is discarded during recovery.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::hasher::{ChecksumWriter, CRC32};

pub const MAGIC: &[u8; 4] = b"LDBL";
pub const VERSION: u32 = 1;

pub const RECORD_WRITE: u8 = 0x01;
pub const RECORD_END: u8 = 0xFF;

pub const HEADER_SIZE: usize = 4 + 4 + 8;
pub const END_SIZE: usize = 1 + 8 + 4;

const FILE_PREFIX: &str = "epoch_";
const FILE_SUFFIX: &str = ".log";

pub fn file_name(epoch: u64) -> String {
    format!("{}{}{}", FILE_PREFIX, epoch, FILE_SUFFIX)
}

/// Epoch encoded in a segment file name, if `path` names a segment.
pub fn parse_file_name(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Appends the records of one epoch to its segment file.
///
/// Records are buffered; nothing is synced until [`SegmentWriter::finish`]
/// writes the end marker.
pub struct SegmentWriter {
    epoch: u64,
    writer: ChecksumWriter<BufWriter<File>>,
    records: u64,
}

impl SegmentWriter {
    pub fn create(dir: &Path, epoch: u64) -> Result<Self> {
        let path = dir.join(file_name(epoch));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = ChecksumWriter::new(BufWriter::new(file));
        writer.write_all(MAGIC)?;
        writer
            .write_u32::<LittleEndian>(VERSION)
            .map_err(|e| Error::Encode("segment version", e))?;
        writer
            .write_u64::<LittleEndian>(epoch)
            .map_err(|e| Error::Encode("segment epoch", e))?;

        tracing::trace!(epoch, path = %path.display(), "Opened log segment");
        Ok(Self {
            epoch,
            writer,
            records: 0,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writer.write_u8(RECORD_WRITE)?;
        write_bytes(&mut self.writer, key, "record key")?;
        write_bytes(&mut self.writer, value, "record value")?;
        self.records += 1;
        Ok(())
    }

    /// Writes the end marker and syncs the file. Returns the segment size.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.write_u8(RECORD_END)?;
        self.writer
            .write_u64::<LittleEndian>(self.epoch)
            .map_err(|e| Error::Encode("end epoch", e))?;

        let size = self.writer.written() + 4;
        let (mut buffered, checksum) = self.writer.into_parts();
        buffered
            .write_u32::<LittleEndian>(checksum)
            .map_err(|e| Error::Encode("segment checksum", e))?;

        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(size)
    }
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8], field: &'static str) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::InvalidState(format!("{} exceeds u32::MAX bytes", field)))?;
    writer
        .write_u32::<LittleEndian>(len)
        .map_err(|e| Error::Encode(field, e))?;
    writer.write_all(bytes).map_err(|e| Error::Encode(field, e))
}

/// A fully validated segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub epoch: u64,
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Segment {
    /// Decodes and validates a whole segment file image.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + END_SIZE {
            return Err(Error::CorruptedSegment(format!(
                "{} bytes is shorter than an empty segment",
                bytes.len()
            )));
        }

        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = LittleEndian::read_u32(trailer);
        let computed = CRC32.checksum(body);
        if stored != computed {
            return Err(Error::ChecksumMismatch { stored, computed });
        }

        let mut cursor = Cursor::new(body);
        let mut magic = [0u8; 4];
        cursor
            .read_exact(&mut magic)
            .map_err(|e| Error::Decode("segment magic", e))?;
        if &magic != MAGIC {
            return Err(Error::InvalidHeader);
        }
        let version = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Decode("segment version", e))?;
        if version != VERSION {
            return Err(Error::InvalidHeader);
        }
        let epoch = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("segment epoch", e))?;

        let mut records = Vec::new();
        loop {
            let kind = cursor
                .read_u8()
                .map_err(|e| Error::Decode("record type", e))?;
            match kind {
                RECORD_WRITE => {
                    let key = read_bytes(&mut cursor, "record key")?;
                    let value = read_bytes(&mut cursor, "record value")?;
                    records.push((key, value));
                }
                RECORD_END => {
                    let end_epoch = cursor
                        .read_u64::<LittleEndian>()
                        .map_err(|e| Error::Decode("end epoch", e))?;
                    if end_epoch != epoch {
                        return Err(Error::CorruptedSegment(format!(
                            "end marker epoch {} does not match header epoch {}",
                            end_epoch, epoch
                        )));
                    }
                    if cursor.position() != body.len() as u64 {
                        return Err(Error::CorruptedSegment(
                            "trailing bytes after end marker".to_string(),
                        ));
                    }
                    return Ok(Self { epoch, records });
                }
                other => {
                    return Err(Error::CorruptedSegment(format!(
                        "unknown record type {:#04x}",
                        other
                    )))
                }
            }
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::decode(&std::fs::read(path)?)
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| Error::Decode(field, e))? as usize;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len as u64 > remaining {
        return Err(Error::CorruptedSegment(format!(
            "{} of {} bytes overruns the segment",
            field, len
        )));
    }
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| Error::Decode(field, e))?;
    Ok(buf)
}

/// Syncs the directory entry of newly created segments.
pub fn sync_dir(dir: &Path) -> Result<()> {
    if cfg!(unix) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
