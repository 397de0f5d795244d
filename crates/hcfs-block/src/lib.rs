#![forbid(unsafe_code)]
//! Positioned byte I/O for HCFS metadata files.
//!
//! Every persistent structure of the core (superblock index, unclaimed log,
//! per-inode block tables) is a flat file addressed by byte offset. The
//! `ByteDevice` trait is the single interface to that storage; which
//! strategy backs it is a construction-time choice:
//!
//! - [`FileByteDevice`]: `pread`/`pwrite` on a shared file descriptor. All
//!   threads and processes that open the same path see one view through the
//!   page cache.
//! - [`MemoryByteDevice`]: an in-process byte vector, for single-process use
//!   and tests that must not touch the filesystem.
//!
//! Reads never extend a device: a read that runs past the end is reported as
//! [`HcfsError::ShortIo`]. Writes past the end grow the device.

use hcfs_error::{HcfsError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Current length in bytes.
    fn len_bytes(&self) -> Result<u64>;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`, growing the device if needed.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Truncate or extend the device to exactly `len` bytes.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Type-erased device handle, shared between owners.
pub type SharedDevice = Arc<dyn ByteDevice>;

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> Result<u64> {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| HcfsError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| HcfsError::Format(format!("{what} range overflows u64")))
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    path: PathBuf,
}

impl FileByteDevice {
    /// Open an existing file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open read-write, creating an empty file when missing.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), "read")?;
        let mut done = 0_usize;
        while done < buf.len() {
            let at = offset + done as u64;
            match self.file.read_at(&mut buf[done..], at) {
                Ok(0) => {
                    return Err(HcfsError::ShortIo {
                        offset,
                        expected: buf.len(),
                        actual: done,
                    });
                }
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_end(offset, buf.len(), "write")?;
        let mut done = 0_usize;
        while done < buf.len() {
            let at = offset + done as u64;
            match self.file.write_at(&buf[done..], at) {
                Ok(0) => {
                    return Err(HcfsError::ShortIo {
                        offset,
                        expected: buf.len(),
                        actual: done,
                    });
                }
                Ok(n) => done += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-process byte device.
///
/// Clones share the same bytes, so a test can keep a handle, let the code
/// under test drop its own, and reopen over the surviving contents the way a
/// restarted process would reopen a file.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Overwrite a byte range in place, bypassing any caller's locking.
    /// Used to simulate torn or corrupted records.
    pub fn poke(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| HcfsError::Format("poke range overflows usize".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(HcfsError::Format(format!(
                "poke out of bounds: end={end} len={}",
                bytes.len()
            )));
        }
        bytes[offset..end].copy_from_slice(data);
        drop(bytes);
        Ok(())
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> Result<u64> {
        u64::try_from(self.bytes.lock().len())
            .map_err(|_| HcfsError::Format("device length overflows u64".to_owned()))
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| HcfsError::Format("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| HcfsError::Format("read range overflows usize".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            let actual = bytes.len().saturating_sub(start);
            drop(bytes);
            return Err(HcfsError::ShortIo {
                offset,
                expected: buf.len(),
                actual,
            });
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| HcfsError::Format("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| HcfsError::Format("write range overflows usize".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            let extra = end - bytes.len();
            bytes.try_reserve(extra).map_err(|_| HcfsError::NoMemory)?;
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| HcfsError::Format("length overflows usize".to_owned()))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
