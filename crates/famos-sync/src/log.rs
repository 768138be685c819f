//! Durable per-space op log.
//!
//! The same framed format the bus WALs use (`u32 len LE | u32 crc32 LE |
//! bytes`), one file per space at `crdt/<space>/ops.log`. Ops are never
//! rewritten; tombstones are themselves ops.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::op::Op;
use crate::SyncError;

/// Append-only op log for one space.
#[derive(Debug)]
pub struct OpLog {
    path: PathBuf,
    file: File,
}

impl OpLog {
    /// Open (or create) the log and return it with all decodable ops.
    /// A torn tail from a crash is truncated.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<Op>), SyncError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut ops = Vec::new();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut good_end = 0u64;
        loop {
            match read_frame(&mut reader)? {
                Some(body) => {
                    match rmp_serde::from_slice::<Op>(&body) {
                        Ok(op) => ops.push(op),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping undecodable op");
                        }
                    }
                    good_end += 8 + body.len() as u64;
                }
                None => break,
            }
        }
        let actual = file.metadata()?.len();
        if actual > good_end {
            tracing::warn!(path = %path.display(), at = good_end, "truncating torn op log tail");
            file.set_len(good_end)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok((Self { path, file }, ops))
    }

    /// Append one op and fsync.
    pub fn append(&mut self, op: &Op) -> Result<(), SyncError> {
        let body = rmp_serde::to_vec_named(op).map_err(|e| SyncError::Codec(e.to_string()))?;
        let len = body.len() as u32;
        let crc = crc32fast::hash(&body);
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn read_frame<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, SyncError> {
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match r.read(&mut header[filled..])? {
            // Clean EOF or torn header; either way there is no next frame.
            0 => return Ok(None),
            n => filled += n,
        }
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > 4 * 1024 * 1024 {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match r.read(&mut body[filled..])? {
            0 => return Ok(None), // torn body
            n => filled += n,
        }
    }
    if crc32fast::hash(&body) != crc {
        return Ok(None);
    }
    Ok(Some(body))
}
