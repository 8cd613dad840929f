//! File-backed segment store
//!
//! Layout under a table directory:
//!
//! ```text
//! <root>/segments/<location>/segment.meta      committed metadata blob
//! <root>/segments/<location>/payload-<n>.bin   backend payload blobs
//! <root>/wal/<location>.log                    append log of a raw segment
//! ```
//!
//! `commit` writes payload files first and the metadata blob last, via
//! temp + fsync + rename. The rename is the single commit point: a directory
//! without `segment.meta` is an orphan left by an interrupted commit and is
//! removed by `sweep_orphans`.

use crate::meta::{PayloadEntry, SegmentMeta};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tessera_core::{Error, Result, SegmentLocation};
use tracing::{debug, warn};

/// Metadata file name inside a segment directory
pub const SEGMENT_META_FILE: &str = "segment.meta";

const SEGMENTS_DIR: &str = "segments";
const WAL_DIR: &str = "wal";
const LOG_EXTENSION: &str = "log";

/// Durable mapping from segment location to metadata + payload blobs
#[derive(Debug)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(SEGMENTS_DIR))
            .map_err(|e| Error::io("create segments directory", e))?;
        fs::create_dir_all(root.join(WAL_DIR)).map_err(|e| Error::io("create wal directory", e))?;
        Ok(SegmentStore { root })
    }

    /// Root directory of this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one segment's files
    pub fn segment_dir(&self, location: &SegmentLocation) -> PathBuf {
        self.root.join(SEGMENTS_DIR).join(location.as_str())
    }

    /// Append log path for a raw segment
    pub fn log_path(&self, location: &SegmentLocation) -> PathBuf {
        self.root
            .join(WAL_DIR)
            .join(format!("{}.{}", location.as_str(), LOG_EXTENSION))
    }

    /// Whether a committed version exists at `location`
    pub fn exists(&self, location: &SegmentLocation) -> bool {
        self.segment_dir(location).join(SEGMENT_META_FILE).is_file()
    }

    /// Atomically commit a new segment version.
    ///
    /// Payload entries in `meta` are replaced by the files written here.
    /// Fails if `location` already holds a committed version: committed
    /// segments are immutable apart from `update_meta`.
    pub fn commit(&self, meta: &SegmentMeta, payloads: &[&[u8]]) -> Result<SegmentMeta> {
        let location = &meta.location;
        if self.exists(location) {
            return Err(Error::invalid_input(format!(
                "segment {} is already committed",
                location
            )));
        }

        let dir = self.segment_dir(location);
        fs::create_dir_all(&dir).map_err(|e| Error::io("create segment directory", e))?;

        let mut committed = meta.clone();
        committed.payloads.clear();

        let written = (|| -> Result<()> {
            for (n, bytes) in payloads.iter().enumerate() {
                let file = format!("payload-{}.bin", n);
                write_synced(&dir.join(&file), bytes)
                    .map_err(|e| Error::io(format!("write payload {}", file), e))?;
                committed.payloads.push(PayloadEntry {
                    file,
                    len: bytes.len() as u64,
                    crc32: crc32fast::hash(bytes),
                });
            }
            self.write_meta(&committed)
        })();

        if let Err(e) = written {
            // Nothing visible yet: drop the partial directory.
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(
                    target: "tessera::store",
                    location = %location,
                    error = %cleanup,
                    "Failed to remove partial segment directory"
                );
            }
            return Err(e);
        }

        debug!(
            target: "tessera::store",
            location = %location,
            payload_bytes = committed.payload_bytes(),
            "Committed segment"
        );
        Ok(committed)
    }

    /// Atomically replace the metadata blob of a committed segment
    pub fn update_meta(&self, meta: &SegmentMeta) -> Result<()> {
        if !self.exists(&meta.location) {
            return Err(Error::not_ready(format!(
                "segment {} is not committed",
                meta.location
            )));
        }
        self.write_meta(meta)
    }

    fn write_meta(&self, meta: &SegmentMeta) -> Result<()> {
        let dir = self.segment_dir(&meta.location);
        let final_path = dir.join(SEGMENT_META_FILE);
        let temp_path = final_path.with_extension("meta.tmp");

        let bytes = meta.to_bytes()?;
        write_synced(&temp_path, &bytes).map_err(|e| Error::io("write segment metadata", e))?;
        fs::rename(&temp_path, &final_path)
            .map_err(|e| Error::io("rename segment metadata", e))?;
        sync_dir(&dir).map_err(|e| Error::io("sync segment directory", e))?;
        Ok(())
    }

    /// Read and validate the metadata blob
    pub fn read_meta(&self, location: &SegmentLocation) -> Result<SegmentMeta> {
        let path = self.segment_dir(location).join(SEGMENT_META_FILE);
        match fs::read(&path) {
            Ok(data) => SegmentMeta::from_bytes(location, &data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::not_ready(format!(
                "segment {} is not committed",
                location
            ))),
            Err(e) => Err(Error::io("read segment metadata", e)),
        }
    }

    /// Read one payload blob, validating length and checksum
    pub fn read_payload(&self, meta: &SegmentMeta, entry: &PayloadEntry) -> Result<Vec<u8>> {
        let path = self.segment_dir(&meta.location).join(&entry.file);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::corrupted(
                    &meta.location,
                    format!("missing payload file {}", entry.file),
                ))
            }
            Err(e) => return Err(Error::io("read segment payload", e)),
        };
        if data.len() as u64 != entry.len {
            return Err(Error::corrupted(
                &meta.location,
                format!(
                    "payload {} length {} != recorded {}",
                    entry.file,
                    data.len(),
                    entry.len
                ),
            ));
        }
        let crc = crc32fast::hash(&data);
        if crc != entry.crc32 {
            return Err(Error::corrupted(
                &meta.location,
                format!(
                    "payload {} checksum mismatch: stored {:08x}, computed {:08x}",
                    entry.file, entry.crc32, crc
                ),
            ));
        }
        Ok(data)
    }

    /// Remove every file for `location`. Deleting an absent location is not an error.
    pub fn delete(&self, location: &SegmentLocation) -> Result<()> {
        match fs::remove_dir_all(self.segment_dir(location)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("delete segment", e)),
        }
        match fs::remove_file(self.log_path(location)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("delete segment log", e)),
        }
        debug!(target: "tessera::store", location = %location, "Deleted segment");
        Ok(())
    }

    /// Remove only the append log of `location`, once its records are committed
    pub fn remove_log(&self, location: &SegmentLocation) -> Result<()> {
        match fs::remove_file(self.log_path(location)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("remove segment log", e)),
        }
    }

    /// Committed locations, sorted
    pub fn list(&self) -> Result<Vec<SegmentLocation>> {
        let mut out = Vec::new();
        for entry in read_dir_or_empty(&self.root.join(SEGMENTS_DIR))? {
            let path = entry.path();
            if path.join(SEGMENT_META_FILE).is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    out.push(SegmentLocation::new(name));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Locations that have an append log, sorted
    pub fn list_logs(&self) -> Result<Vec<SegmentLocation>> {
        let mut out = Vec::new();
        for entry in read_dir_or_empty(&self.root.join(WAL_DIR))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|n| n.to_str()) {
                out.push(SegmentLocation::new(stem));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Remove artifacts of interrupted commits. Returns how many were removed.
    pub fn sweep_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in read_dir_or_empty(&self.root.join(SEGMENTS_DIR))? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if path.join(SEGMENT_META_FILE).is_file() {
                let temp = path.join(SEGMENT_META_FILE).with_extension("meta.tmp");
                if temp.exists() {
                    fs::remove_file(&temp).map_err(|e| Error::io("remove temp metadata", e))?;
                    removed += 1;
                }
                continue;
            }
            warn!(
                target: "tessera::store",
                path = %path.display(),
                "Removing uncommitted segment directory"
            );
            fs::remove_dir_all(&path).map_err(|e| Error::io("remove orphan segment", e))?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| Error::io("list directory", e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io("list directory", e)),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    // Directory fsync is not supported on every platform.
    if cfg!(unix) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
