//! Recovery progress marker.
//!
//! The marker exists only while a run is in flight. Its presence alone
//! tells the trigger that a run was interrupted; the superblock head's
//! recovery cursor is what a resumed run actually trusts.
//!
//! On-disk format (20 bytes): next inode (u64 LE), end inode (u64 LE),
//! crc32c of the first 16 bytes (u32 LE).

use hcfs_error::{HcfsError, Result};
use hcfs_types::{InodeNumber, ParseError, read_le_u32, read_le_u64};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PROGRESS_FILE: &str = "recovery_progress";
const MARKER_LEN: usize = 20;

/// Where an interrupted run picks up: the next inode to scan and the last
/// inode of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub next: InodeNumber,
    pub end: InodeNumber,
}

impl Progress {
    #[must_use]
    pub fn encode(&self) -> [u8; MARKER_LEN] {
        let mut out = [0_u8; MARKER_LEN];
        out[0..8].copy_from_slice(&self.next.0.to_le_bytes());
        out[8..16].copy_from_slice(&self.end.0.to_le_bytes());
        let crc = crc32c::crc32c(&out[0..16]);
        out[16..20].copy_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MARKER_LEN {
            return Err(HcfsError::Format(format!(
                "progress marker is {} bytes, expected {MARKER_LEN}",
                bytes.len()
            )));
        }
        let parse = |e: ParseError| HcfsError::Parse(e.to_string());
        let stored = read_le_u32(bytes, 16).map_err(parse)?;
        let computed = crc32c::crc32c(&bytes[0..16]);
        if stored != computed {
            return Err(HcfsError::Format(format!(
                "progress marker checksum {stored:#010x} != {computed:#010x}"
            )));
        }
        Ok(Self {
            next: InodeNumber(read_le_u64(bytes, 0).map_err(parse)?),
            end: InodeNumber(read_le_u64(bytes, 8).map_err(parse)?),
        })
    }
}

/// Persistence for the progress marker.
pub trait ProgressStore: Send + Sync {
    fn load(&self) -> Result<Option<Progress>>;

    /// Replace the marker. Must be durable when it returns.
    fn store(&self, progress: Progress) -> Result<()>;

    /// Remove the marker. Removing a missing marker succeeds.
    fn clear(&self) -> Result<()>;
}

/// Marker file in the metadata directory, replaced atomically through a
/// temporary file and rename.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{PROGRESS_FILE}.tmp"))
    }
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

impl ProgressStore for FileProgressStore {
    fn load(&self) -> Result<Option<Progress>> {
        let bytes = match fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match Progress::decode(&bytes) {
            Ok(progress) => Ok(Some(progress)),
            Err(err) => {
                // Still an interrupted run; the head cursor decides where
                // to resume.
                warn!(
                    target: "hcfs::recovery",
                    event = "progress_marker_unreadable",
                    path = %self.path().display(),
                    error = %err
                );
                Ok(Some(Progress {
                    next: InodeNumber::NULL,
                    end: InodeNumber::NULL,
                }))
            }
        }
    }

    fn store(&self, progress: Progress) -> Result<()> {
        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&progress.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path())?;
        sync_dir(&self.dir)?;
        debug!(
            target: "hcfs::recovery",
            event = "progress_stored",
            next = progress.next.0,
            end = progress.end.0
        );
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(self.path()) {
            Ok(()) => sync_dir(&self.dir),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-process marker for in-memory superblocks and tests.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    marker: Mutex<Option<Progress>>,
}

impl MemoryProgressStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self) -> Result<Option<Progress>> {
        Ok(*self.marker.lock())
    }

    fn store(&self, progress: Progress) -> Result<()> {
        *self.marker.lock() = Some(progress);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.marker.lock() = None;
        Ok(())
    }
}
