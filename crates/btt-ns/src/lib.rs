#![forbid(unsafe_code)]
//! Namespace adapter for the BTT engine.
//!
//! A namespace is the linear byte range the BTT lays its metadata and
//! data blocks into: a file, a device, or a memory region. The engine
//! reaches it only through the [`Namespace`] trait, whose four
//! operations mirror the host callbacks of the original design:
//!
//! - `read_at` / `write_at`: positioned I/O; a completed `write_at` is
//!   durable (it survives power loss and is visible to any later read).
//! - `map_at`: borrow a window of the namespace for bulk access. The
//!   window may be shorter than requested; callers loop.
//! - `sync_range`: flush a window's bytes back durably.
//!
//! Every operation carries the caller's [`Lane`] so implementations may
//! shard file descriptors or buffers per concurrent thread; the
//! reference implementations here ignore it.

use btt_error::{BttError, Result};
use btt_types::{ByteOffset, Lane};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Largest window [`FileNamespace`] hands out from `map_at`.
const FILE_WINDOW_MAX: usize = 1 << 20;

/// A window of namespace bytes obtained from [`Namespace::map_at`].
///
/// The window is a snapshot: mutate it freely, then hand it to
/// [`Namespace::sync_range`] to make the bytes durable. A window that is
/// only read never needs a sync.
#[derive(Debug)]
pub struct MappedRange {
    off: ByteOffset,
    bytes: Vec<u8>,
}

impl MappedRange {
    #[must_use]
    pub fn new(off: ByteOffset, bytes: Vec<u8>) -> Self {
        Self { off, bytes }
    }

    #[must_use]
    pub fn offset(&self) -> ByteOffset {
        self.off
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Byte-addressed storage under the BTT, with pread/pwrite semantics.
pub trait Namespace: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `off` into `buf`.
    fn read_at(&self, lane: Lane, off: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `off`. Durable on return.
    fn write_at(&self, lane: Lane, off: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Borrow a window of up to `len` bytes starting at `off`.
    fn map_at(&self, lane: Lane, off: ByteOffset, len: usize) -> Result<MappedRange>;

    /// Durably flush a window previously obtained from `map_at`.
    fn sync_range(&self, lane: Lane, range: &MappedRange) -> Result<()>;
}

fn check_bounds(off: ByteOffset, len: usize, size: u64) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| off.0.checked_add(len));
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(BttError::OutOfBounds {
            offset: off.0,
            len,
            size,
        }),
    }
}

/// File-backed namespace using `pread`/`pwrite` style I/O.
///
/// `write_at` issues `fdatasync` after every write so the durability
/// contract holds on real storage; batch callers should prefer
/// `map_at` + `sync_range`, which pays one flush per window.
#[derive(Debug, Clone)]
pub struct FileNamespace {
    file: Arc<File>,
    len: u64,
}

impl FileNamespace {
    /// Open an existing file as a namespace, using its current length.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) a file of `len` bytes and open it.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl Namespace for FileNamespace {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, _lane: Lane, off: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_bounds(off, buf.len(), self.len)?;
        self.file.read_exact_at(buf, off.0)?;
        Ok(())
    }

    fn write_at(&self, _lane: Lane, off: ByteOffset, buf: &[u8]) -> Result<()> {
        check_bounds(off, buf.len(), self.len)?;
        self.file.write_all_at(buf, off.0)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn map_at(&self, lane: Lane, off: ByteOffset, len: usize) -> Result<MappedRange> {
        check_bounds(off, len.min(1), self.len)?;
        let avail = usize::try_from(self.len - off.0).unwrap_or(usize::MAX);
        let window = len.min(avail).min(FILE_WINDOW_MAX);
        trace!(
            target: "btt::ns",
            event = "map_window",
            off = off.0,
            requested = len,
            granted = window,
        );
        let mut bytes = vec![0_u8; window];
        self.read_at(lane, off, &mut bytes)?;
        Ok(MappedRange::new(off, bytes))
    }

    fn sync_range(&self, _lane: Lane, range: &MappedRange) -> Result<()> {
        check_bounds(range.offset(), range.len(), self.len)?;
        self.file.write_all_at(range.as_slice(), range.offset().0)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Memory-backed namespace for tests and embedders.
///
/// Writes are "durable" the moment they land in the vector, which makes
/// this the natural base for crash-simulation wrappers: clone the
/// contents at any point and reopen over the clone.
#[derive(Debug)]
pub struct MemNamespace {
    bytes: Mutex<Vec<u8>>,
}

impl MemNamespace {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Snapshot the full namespace contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl Namespace for MemNamespace {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_at(&self, _lane: Lane, off: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_bounds(off, buf.len(), bytes.len() as u64)?;
        let start = off.0 as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, _lane: Lane, off: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_bounds(off, buf.len(), bytes.len() as u64)?;
        let start = off.0 as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn map_at(&self, _lane: Lane, off: ByteOffset, len: usize) -> Result<MappedRange> {
        let bytes = self.bytes.lock();
        check_bounds(off, len.min(1), bytes.len() as u64)?;
        let start = off.0 as usize;
        let end = (start + len).min(bytes.len());
        Ok(MappedRange::new(off, bytes[start..end].to_vec()))
    }

    fn sync_range(&self, lane: Lane, range: &MappedRange) -> Result<()> {
        self.write_at(lane, range.offset(), range.as_slice())
    }
}
