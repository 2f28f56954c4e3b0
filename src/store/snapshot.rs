//! Snapshot files for [`MemoryStore`](super::MemoryStore)
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (6 bytes)                                        │
//! │   Magic: "KKV1" (4) | Version: u16 (2)                  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Body (variable)                                         │
//! │   bincode Vec<(Table, Vec<(key, value)>)>               │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (4 bytes)                                        │
//! │   BodyCRC: u32                                          │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{DatastoreError, Result};

use super::Table;

const MAGIC: &[u8; 4] = b"KKV1";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 6;
const FOOTER_SIZE: usize = 4;

type Tables = Vec<(Table, Vec<(Vec<u8>, Vec<u8>)>)>;

/// Write a snapshot, replacing any existing file atomically
pub(super) fn write(path: &Path, tables: &Tables) -> Result<()> {
    let body = bincode::serialize(tables)?;
    let crc = crc32fast::hash(&body);

    let tmp_path = path.with_extension("tmp");
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&body)?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.flush()?;

        let file = writer
            .into_inner()
            .map_err(|e| DatastoreError::Backend(format!("Failed to flush snapshot: {}", e)))?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    tracing::debug!(path = %path.display(), bytes = body.len(), "snapshot written");
    Ok(())
}

/// Read and verify a snapshot
pub(super) fn read(path: &Path) -> Result<Tables> {
    let bytes = fs::read(path)?;
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(DatastoreError::Backend(format!(
            "Snapshot {} is truncated",
            path.display()
        )));
    }
    if &bytes[0..4] != MAGIC {
        return Err(DatastoreError::Backend(format!(
            "Invalid snapshot magic: expected KKV1, got {:?}",
            &bytes[0..4]
        )));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(DatastoreError::Backend(format!(
            "Unsupported snapshot version: {}",
            version
        )));
    }

    let footer_start = bytes.len() - FOOTER_SIZE;
    let body = &bytes[HEADER_SIZE..footer_start];
    let mut crc_bytes = [0u8; FOOTER_SIZE];
    crc_bytes.copy_from_slice(&bytes[footer_start..]);
    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(DatastoreError::Backend(format!(
            "Snapshot checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    Ok(bincode::deserialize(body)?)
}

