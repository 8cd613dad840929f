//! Append log for raw segments
//!
//! Every insert and tombstone on a raw segment is written here before it is
//! acknowledged, so Count/Search reflect it even before the next build.
//!
//! ## Record Format
//!
//! ```text
//! [body_len u32 LE][body: MessagePack LogEntry][crc32(body) u32 LE]
//! ```
//!
//! Replay stops at the first incomplete or corrupt record. Such a tail can
//! only come from a crash mid-append (the record was never acknowledged), so
//! it is truncated away.
//!
//! A failed append is rolled back to the last acknowledged record before the
//! error is returned. If that rollback fails too, the log refuses every later
//! append instead of letting a rejected batch reach disk behind a good one.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tessera_core::{Error, Result, VectorId, VectorRecord};
use tracing::{debug, error, warn};

/// When appended records reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Flush to the OS on every append; survives process crashes
    #[default]
    Standard,
    /// fsync on every append; survives power loss
    Always,
}

/// One logged mutation of a raw segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// A whole insert batch (all-or-nothing)
    Insert {
        /// Records admitted by the batch
        records: Vec<VectorRecord>,
    },
    /// Ids logically deleted
    Tombstone {
        /// Ids tombstoned by a delete-by-range
        ids: Vec<VectorId>,
    },
}

/// Result of reading a log back
#[derive(Debug, Default)]
pub struct LogReplay {
    /// Entries in append order
    pub entries: Vec<LogEntry>,
    /// Bytes of valid records
    pub valid_len: u64,
    /// Whether a torn tail was cut off
    pub truncated: bool,
}

/// Writer side of a segment's append log
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    file: File,
    mode: DurabilityMode,
    bytes_written: u64,
    poisoned: bool,
    #[cfg(test)]
    fail_next_write: Option<usize>,
}

impl AppendLog {
    /// Open for appending, creating the file if needed
    pub fn open(path: impl AsRef<Path>, mode: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("create log directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io("open append log", e))?;
        let bytes_written = file
            .metadata()
            .map_err(|e| Error::io("stat append log", e))?
            .len();
        Ok(AppendLog {
            path,
            file,
            mode,
            bytes_written,
            poisoned: false,
            #[cfg(test)]
            fail_next_write: None,
        })
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length
    pub fn len(&self) -> u64 {
        self.bytes_written
    }

    /// Check if nothing has been logged
    pub fn is_empty(&self) -> bool {
        self.bytes_written == 0
    }

    /// Durably append one entry.
    ///
    /// On error nothing of `entry` remains in the file.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if self.poisoned {
            return Err(Error::io(
                "append log write",
                io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "{} could not be rolled back after a failed append",
                        self.path.display()
                    ),
                ),
            ));
        }
        let frame = encode_frame(entry)?;
        if let Err(e) = self.write_frame(&frame) {
            self.rollback();
            return Err(Error::io("append log write", e));
        }
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    /// Check if a failed rollback has disabled this log
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(partial) = self.fail_next_write.take() {
            self.file.write_all(&frame[..partial.min(frame.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.file.write_all(frame)?;
        if self.mode == DurabilityMode::Always {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cut the file back to the last acknowledged record
    fn rollback(&mut self) {
        let restored = self.file.set_len(self.bytes_written).and_then(|()| {
            if self.mode == DurabilityMode::Always {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        match restored {
            Ok(()) => warn!(
                target: "tessera::log",
                path = %self.path.display(),
                len = self.bytes_written,
                "Rolled back failed append"
            ),
            Err(e) => {
                error!(
                    target: "tessera::log",
                    path = %self.path.display(),
                    error = %e,
                    "Append log rollback failed; further appends rejected"
                );
                self.poisoned = true;
            }
        }
    }

    /// Delete the log once its contents are committed elsewhere
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("remove append log", e)),
        }
    }

    /// Read every complete entry, truncating a torn tail in place.
    pub fn replay(path: impl AsRef<Path>) -> Result<LogReplay> {
        let path = path.as_ref();
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogReplay::default()),
            Err(e) => return Err(Error::io("read append log", e)),
        };

        let mut replay = LogReplay::default();
        let mut pos = 0usize;
        while pos < data.len() {
            match decode_frame(&data[pos..]) {
                Some((entry, consumed)) => {
                    replay.entries.push(entry);
                    pos += consumed;
                }
                None => {
                    replay.truncated = true;
                    break;
                }
            }
        }
        replay.valid_len = pos as u64;

        if replay.truncated {
            warn!(
                target: "tessera::log",
                path = %path.display(),
                valid_len = replay.valid_len,
                file_len = data.len(),
                "Truncating torn append log tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| Error::io("open append log for truncation", e))?;
            file.set_len(replay.valid_len)
                .map_err(|e| Error::io("truncate append log", e))?;
            file.sync_all()
                .map_err(|e| Error::io("sync truncated append log", e))?;
        }

        debug!(
            target: "tessera::log",
            path = %path.display(),
            entries = replay.entries.len(),
            "Replayed append log"
        );
        Ok(replay)
    }
}

fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(entry)?;
    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Decode one frame; `None` for an incomplete or corrupt record
fn decode_frame(bytes: &[u8]) -> Option<(LogEntry, usize)> {
    if bytes.len() < 4 {
        return None;
    }
    let body_len = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    let total = 4 + body_len + 4;
    if body_len == 0 || bytes.len() < total {
        return None;
    }
    let body = &bytes[4..4 + body_len];
    let stored_crc = u32::from_le_bytes(bytes[4 + body_len..total].try_into().ok()?);
    if crc32fast::hash(body) != stored_crc {
        return None;
    }
    let entry = rmp_serde::from_slice(body).ok()?;
    Some((entry, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn insert(ids: &[u64]) -> LogEntry {
        LogEntry::Insert {
            records: ids
                .iter()
                .map(|&id| VectorRecord::new(id, vec![id as f32, 0.0]))
                .collect(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.log");
        let mut log = AppendLog::open(&path, DurabilityMode::Standard).unwrap();
        log.append(&insert(&[1, 2])).unwrap();
        log.append(&LogEntry::Tombstone {
            ids: vec![VectorId(1)],
        })
        .unwrap();
        assert!(!log.is_empty());
        drop(log);

        let replay = AppendLog::replay(&path).unwrap();
        assert!(!replay.truncated);
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[0], insert(&[1, 2]));
    }

    #[test]
    fn test_reopen_appends_after_existing_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.log");
        {
            let mut log = AppendLog::open(&path, DurabilityMode::Always).unwrap();
            log.append(&insert(&[1])).unwrap();
        }
        let mut log = AppendLog::open(&path, DurabilityMode::Always).unwrap();
        let before = log.len();
        log.append(&insert(&[2])).unwrap();
        assert!(log.len() > before);
        drop(log);
        assert_eq!(AppendLog::replay(&path).unwrap().entries.len(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.log");
        let mut log = AppendLog::open(&path, DurabilityMode::Standard).unwrap();
        log.append(&insert(&[1])).unwrap();
        let good_len = log.len();
        log.append(&insert(&[2])).unwrap();
        drop(log);

        // Chop the last record in half.
        let data = std::fs::read(&path).unwrap();
        let cut = good_len as usize + (data.len() - good_len as usize) / 2;
        std::fs::write(&path, &data[..cut]).unwrap();

        let replay = AppendLog::replay(&path).unwrap();
        assert!(replay.truncated);
        assert_eq!(replay.entries, vec![insert(&[1])]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.log");
        let mut log = AppendLog::open(&path, DurabilityMode::Standard).unwrap();
        log.append(&insert(&[1])).unwrap();
        log.append(&insert(&[2])).unwrap();
        drop(log);

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 6;
        data[last] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let replay = AppendLog::replay(&path).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert!(replay.truncated);
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let replay = AppendLog::replay(dir.path().join("absent.log")).unwrap();
        assert!(replay.entries.is_empty());
        assert!(!replay.truncated);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.log");
        let mut log = AppendLog::open(&path, DurabilityMode::Standard).unwrap();
        log.append(&insert(&[1])).unwrap();
        log.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.log");
        let mut log = AppendLog::open(&path, DurabilityMode::Always).unwrap();
        log.append(&insert(&[1])).unwrap();
        let good_len = log.len();

        // Half the frame reaches the file before the write fails.
        log.fail_next_write = Some(10);
        assert!(matches!(log.append(&insert(&[2])), Err(Error::Io { .. })));
        assert_eq!(log.len(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        assert!(!log.is_poisoned());

        // A retry of the rejected batch is logged exactly once.
        log.append(&insert(&[2])).unwrap();
        log.append(&insert(&[3])).unwrap();
        drop(log);
        let replay = AppendLog::replay(&path).unwrap();
        assert!(!replay.truncated);
        assert_eq!(replay.entries, vec![insert(&[1]), insert(&[2]), insert(&[3])]);
    }

    #[test]
    fn test_rejected_batch_never_reaches_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.log");
        let mut log = AppendLog::open(&path, DurabilityMode::Standard).unwrap();
        log.append(&insert(&[1])).unwrap();
        log.fail_next_write = Some(0);
        assert!(log.append(&insert(&[2])).is_err());
        log.append(&insert(&[3])).unwrap();
        drop(log);

        let replay = AppendLog::replay(&path).unwrap();
        assert_eq!(replay.entries, vec![insert(&[1]), insert(&[3])]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unrecoverable_log_rejects_appends() {
        // Every write to /dev/full fails and it cannot be truncated.
        let path = Path::new("/dev/full");
        let mut log = match AppendLog::open(path, DurabilityMode::Standard) {
            Ok(log) => log,
            Err(_) => return,
        };
        assert!(log.append(&insert(&[1])).is_err());
        assert!(log.is_poisoned());
        assert!(matches!(log.append(&insert(&[1])), Err(Error::Io { .. })));
        assert!(log.is_empty());
    }
}
