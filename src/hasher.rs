use std::fmt;
use std::io::{self, Write};

use crc::{Crc, Digest, CRC_32_ISCSI};

pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Incremental CRC32 over everything fed to it.
pub struct Hasher {
    digest: Digest<'static, u32>,
    len: u64,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher").field("len", &self.len).finish()
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A writer that checksums every byte on its way to the inner writer.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    /// Bytes written through this writer.
    pub fn written(&self) -> u64 {
        self.hasher.len()
    }

    /// Returns the inner writer and the checksum of everything written.
    pub fn into_parts(self) -> (W, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
