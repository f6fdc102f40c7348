use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use memmap2::Mmap;

use crate::types::{Result, SealError};

/// Positioned file access used by every on-disk structure.
///
/// Tests wrap a real file behind this trait to count syncs or inject
/// failures without touching the engines.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from `off`; a short file yields `Truncated`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes `src` at `off`, growing the file as needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Forces data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Whether the file holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }
    /// Sets the file length, dropping or zero-filling the tail.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Read-only mapping of the whole file. Backends without mapping
    /// support return `None` and callers fall back to positioned reads.
    fn map_readonly(&self) -> Result<Option<Mmap>> {
        Ok(None)
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, off)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, off)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, off)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, off)
}

#[cfg(not(any(unix, windows)))]
fn pread(_file: &File, _buf: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(ErrorKind::Unsupported, "positioned reads unsupported"))
}

#[cfg(not(any(unix, windows)))]
fn pwrite(_file: &File, _buf: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(ErrorKind::Unsupported, "positioned writes unsupported"))
}

/// `FileIo` over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened handle.
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Opens `path` read-write, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    fn fill(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            match pread(&self.file, dst, off) {
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    dst = &mut dst[n..];
                    off += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn drain(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            match pwrite(&self.file, src, off) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    src = &src[n..];
                    off += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.fill(off, dst).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => SealError::Truncated("read past end of file"),
            _ => SealError::Io(err),
        })
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.drain(off, src).map_err(SealError::from_write)
    }

    fn sync_all(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(SealError::from_write)
    }

    #[allow(unsafe_code)]
    fn map_readonly(&self) -> Result<Option<Mmap>> {
        if self.is_empty()? {
            return Ok(None);
        }
        // SAFETY: callers only read the prefix that existed when the map was
        // taken; writers append past it and never shrink a mapped file.
        let map = unsafe { Mmap::map(&*self.file)? };
        Ok(Some(map))
    }
}
