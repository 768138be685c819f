//! Per-topic append-only log with offset-addressed reads.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::frame::{read_frame, write_frame, ReadFrame};
use crate::BusError;

/// Append-only framed log. One exclusive writer per file; readers reopen the
/// file read-only at recorded positions.
///
/// The in-memory `positions` index maps record offset to file position and is
/// rebuilt by scanning on open, truncating any torn tail left by a crash.
#[derive(Debug)]
pub(crate) struct Wal {
    path: PathBuf,
    file: File,
    positions: Vec<u64>,
    end: u64,
}

impl Wal {
    /// Open (or create) a log, scan it, and truncate a torn tail if present.
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self, BusError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut positions = Vec::new();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut pos = 0u64;
        loop {
            match read_frame(&mut reader)? {
                ReadFrame::Ok(body) => {
                    positions.push(pos);
                    pos += 8 + body.len() as u64;
                }
                ReadFrame::Eof => break,
                ReadFrame::Torn => {
                    tracing::warn!(path = %path.display(), at = pos, "truncating torn wal tail");
                    file.set_len(pos)?;
                    break;
                }
            }
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path,
            file,
            positions,
            end: pos,
        })
    }

    /// Number of records in the log; the next append gets this offset.
    pub(crate) fn len(&self) -> u64 {
        self.positions.len() as u64
    }

    /// Append one record and fsync, returning its offset.
    pub(crate) fn append(&mut self, body: &[u8]) -> Result<u64, BusError> {
        let offset = self.positions.len() as u64;
        let written = write_frame(&mut self.file, body)?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.positions.push(self.end);
        self.end += written;
        Ok(offset)
    }

    /// Read up to `max` records starting at `from`, with their offsets.
    pub(crate) fn read_from(&self, from: u64, max: usize) -> Result<Vec<(u64, Vec<u8>)>, BusError> {
        let mut out = Vec::new();
        let start = from as usize;
        if start >= self.positions.len() || max == 0 {
            return Ok(out);
        }
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(self.positions[start]))?;
        for offset in start..self.positions.len().min(start + max) {
            match read_frame(&mut reader)? {
                ReadFrame::Ok(body) => out.push((offset as u64, body)),
                // The index said this record exists; anything else is corruption.
                _ => {
                    return Err(BusError::Corrupt {
                        path: self.path.display().to_string(),
                        offset: offset as u64,
                    })
                }
            }
        }
        Ok(out)
    }
}

/// Canonical WAL file path for a topic under the bus root.
pub(crate) fn topic_wal_path(root: &Path, topic: &str) -> PathBuf {
    root.join(format!("{topic}.wal"))
}

/// Canonical DLQ file path for a topic under the bus root.
pub(crate) fn topic_dlq_path(root: &Path, topic: &str) -> PathBuf {
    root.join(format!("{topic}.dlq"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_reads_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("t.wal")).unwrap();
        assert_eq!(wal.append(b"a").unwrap(), 0);
        assert_eq!(wal.append(b"bb").unwrap(), 1);
        assert_eq!(wal.append(b"ccc").unwrap(), 2);

        let records = wal.read_from(1, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (1, b"bb".to_vec()));
        assert_eq!(records[1], (2, b"ccc".to_vec()));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(b"a").unwrap();
            wal.append(b"b").unwrap();
        }
        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.len(), 2);
        assert_eq!(wal.read_from(0, 10).unwrap().len(), 2);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(b"alpha").unwrap();
            wal.append(b"beta").unwrap();
        }
        // Chop two bytes off the last frame to simulate a crash mid-append.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();
        drop(file);

        let mut wal = Wal::open(&path).unwrap();
        assert_eq!(wal.len(), 1);
        // The log stays appendable after truncation.
        assert_eq!(wal.append(b"gamma").unwrap(), 1);
        let records = wal.read_from(0, 10).unwrap();
        assert_eq!(records[1].1, b"gamma".to_vec());
    }
}
