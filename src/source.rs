//! Byte sources for MPO containers.
//!
//! A [`ByteSource`] hands out a fresh forward-only stream positioned at a
//! requested offset. Sources never rewind: callers that need to read the
//! same region twice (probe, then decode) open it twice. This lets plain
//! files, memory maps, in-memory buffers and non-seekable content streams
//! all sit behind the same interface.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use tracing::debug;

use crate::error::SourceError;

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A stream handed out by [`ByteSource::open_at`]. Dropping it closes it.
pub type SourceStream<'a> = Box<dyn Read + Send + 'a>;

/// A re-openable input holding one MPO container.
///
/// # Example
///
/// ```ignore
/// let source = FileSource::open("DSCF0005.MPO")?;
/// let mut stream = source.open_at(4096)?;
/// let mut header = [0u8; 4];
/// stream.read_exact(&mut header)?;
/// ```
pub trait ByteSource: Send + Sync {
    /// Opens a new stream whose first byte is the byte at `offset`.
    ///
    /// Opening past the end yields a stream that reads nothing, except for
    /// forward-only sources that must skip, which fail with
    /// [`SourceError::Skip`].
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>>;

    /// Display name used in logs and error messages.
    fn name(&self) -> &str;

    /// Total length in bytes, if known up front.
    fn size(&self) -> Option<u64>;
}

impl<S: ByteSource + ?Sized> ByteSource for &S {
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>> {
        (**self).open_at(offset)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>> {
        (**self).open_at(offset)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }
}

impl<S: ByteSource + ?Sized> ByteSource for std::sync::Arc<S> {
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>> {
        (**self).open_at(offset)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// A container on the local filesystem, reopened for every stream.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> SourceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let name = display_name(&path);
        let size = std::fs::metadata(&path)
            .map_err(|source| SourceError::Open {
                name: name.clone(),
                offset: 0,
                source,
            })?
            .len();

        Ok(Self { path, name, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(false)
            .open(&self.path)
            .map_err(|source| SourceError::Open {
                name: self.name.clone(),
                offset,
                source,
            })?;

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{Advice, fadvise};
            let _ = fadvise(&file, offset, None, Advice::Sequential);
        }

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|source| SourceError::Skip {
                    name: self.name.clone(),
                    offset,
                    source,
                })?;
        }

        Ok(Box::new(file))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// A memory-mapped container. Streams are cursors over the mapping.
pub struct MmapSource {
    mmap: Mmap,
    name: String,
}

impl MmapSource {
    pub fn open(path: impl AsRef<Path>) -> SourceResult<Self> {
        let path = path.as_ref();
        let name = display_name(path);
        let open_err = |source: io::Error| SourceError::Open {
            name: name.clone(),
            offset: 0,
            source,
        };

        let file = File::open(path).map_err(open_err)?;
        let size = file.metadata().map_err(open_err)?.len();
        if size == 0 {
            return Err(SourceError::Empty { name: name.clone() });
        }

        // The mapping is read-only and the file is not expected to be
        // truncated while a scan is running.
        let mmap = unsafe { Mmap::map(&file) }.map_err(open_err)?;
        if mmap.is_empty() {
            return Err(SourceError::Empty { name: name.clone() });
        }

        #[cfg(target_os = "linux")]
        {
            use memmap2::Advice;
            let _ = mmap.advise(Advice::Sequential);
        }

        Ok(Self { mmap, name })
    }

    #[inline]
    pub fn slice_from(&self, offset: u64) -> &[u8] {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.mmap.len());
        &self.mmap[start..]
    }
}

impl ByteSource for MmapSource {
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>> {
        Ok(Box::new(Cursor::new(self.slice_from(offset))))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.mmap.len() as u64)
    }
}

/// An in-memory container.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl ByteSource for MemorySource {
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        Ok(Box::new(Cursor::new(self.data.slice(start..))))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// A forward-only stream that can be reopened from the start, such as a
/// content handle that does not support seeking. Offsets are reached by
/// reading and discarding.
pub struct StreamSource<F> {
    name: String,
    size: Option<u64>,
    reopen: F,
}

impl<F, R> StreamSource<F>
where
    F: Fn() -> io::Result<R> + Send + Sync,
    R: Read + Send + 'static,
{
    pub fn new(name: impl Into<String>, reopen: F) -> Self {
        Self {
            name: name.into(),
            size: None,
            reopen,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl<F, R> ByteSource for StreamSource<F>
where
    F: Fn() -> io::Result<R> + Send + Sync,
    R: Read + Send + 'static,
{
    fn open_at(&self, offset: u64) -> SourceResult<SourceStream<'_>> {
        let mut stream = (self.reopen)().map_err(|source| SourceError::Open {
            name: self.name.clone(),
            offset,
            source,
        })?;

        let skipped = io::copy(&mut (&mut stream).take(offset), &mut io::sink()).map_err(
            |source| SourceError::Skip {
                name: self.name.clone(),
                offset,
                source,
            },
        )?;
        if skipped < offset {
            return Err(SourceError::Skip {
                name: self.name.clone(),
                offset,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {skipped} bytes"),
                ),
            });
        }

        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Option<u64> {
        self.size
    }
}

/// Opens `path` memory-mapped, falling back to plain file reads when the
/// mapping fails (empty files, special files).
pub fn open_source(path: impl AsRef<Path>) -> SourceResult<Box<dyn ByteSource>> {
    let path = path.as_ref();

    match MmapSource::open(path) {
        Ok(source) => Ok(Box::new(source)),
        Err(e) => {
            debug!("mmap unavailable for {}: {e}", path.display());
            Ok(Box::new(FileSource::open(path)?))
        }
    }
}

/// Reads until `buf` is full or the stream ends, retrying interrupted reads.
pub(crate) fn read_full(stream: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
