//! Binary header for a serialized full index blob.
//!
//! # Blob Layout
//!
//! ```text
//! [IndexHeader]                              32 bytes
//! [name_len: u16][name][ColumnIndex] x text_columns
//! [name_len: u16][name][Bsi]         x int_columns
//! ```

use std::io::{Read, Write};

use crate::error::{EngineError, Result};

/// Magic bytes for full index blobs.
pub const INDEX_MAGIC: [u8; 4] = *b"EVIX";

/// Full index format version.
pub const INDEX_VERSION: u32 = 1;

/// Size of [`IndexHeader`] on the wire.
pub const HEADER_SIZE: usize = 32;

/// Index blob header -- exactly 32 bytes.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"EVIX"
/// 4       4     version: u32 = 1
/// 8       4     row_count: u32
/// 12      4     text_columns: u32
/// 16      4     int_columns: u32
/// 20      12    _reserved: [u8; 12]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Rows in the batch the index was built from.
    pub row_count: u32,
    pub text_columns: u32,
    pub int_columns: u32,
    pub _reserved: [u8; 12],
}

impl IndexHeader {
    pub fn new(row_count: u32, text_columns: u32, int_columns: u32) -> Self {
        Self {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            row_count,
            text_columns,
            int_columns,
            _reserved: [0u8; 12],
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.magic)?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.row_count.to_le_bytes())?;
        w.write_all(&self.text_columns.to_le_bytes())?;
        w.write_all(&self.int_columns.to_le_bytes())?;
        w.write_all(&self._reserved)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        r.read_exact(&mut buf).map_err(|e| {
            EngineError::InvalidFormat(format!("Failed to read index header: {}", e))
        })?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != INDEX_MAGIC {
            return Err(EngineError::InvalidFormat(format!(
                "Not an index blob: expected EVIX, got {:?}",
                magic
            )));
        }

        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let version = word(4);
        if version != INDEX_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported index version: {}",
                version
            )));
        }

        let mut reserved = [0u8; 12];
        reserved.copy_from_slice(&buf[20..32]);

        Ok(Self {
            magic,
            version,
            row_count: word(8),
            text_columns: word(12),
            int_columns: word(16),
            _reserved: reserved,
        })
    }
}

/// Write a u16-length-prefixed column name.
pub(crate) fn write_name<W: Write>(name: &str, w: &mut W) -> Result<()> {
    let len = u16::try_from(name.len())
        .map_err(|_| EngineError::InvalidSchema(format!("Column name too long: {}", name)))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(name.as_bytes())?;
    Ok(())
}

pub(crate) fn read_name<R: Read>(r: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).map_err(|e| {
        EngineError::InvalidFormat(format!("Failed to read column name length: {}", e))
    })?;
    let mut buf = vec![0u8; u16::from_le_bytes(len_buf) as usize];
    r.read_exact(&mut buf)
        .map_err(|e| EngineError::InvalidFormat(format!("Column name truncated: {}", e)))?;
    String::from_utf8(buf)
        .map_err(|_| EngineError::InvalidFormat("Column name contains invalid UTF-8".into()))
}
