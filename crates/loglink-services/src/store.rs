//! Storage seams: where the responder reads logs from and where the
//! requester writes them to.
//!
//! The protocol only ever sees a byte stream with a known size and a byte
//! sink. Mounting filesystems and producing the log rows happen elsewhere.

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};

// ── Sources ──────────────────────────────────────────────────────────────────

/// An opened log, positioned at its first byte. Dropping it closes it.
pub struct OpenedResource {
    pub size: u32,
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for OpenedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedResource").field("size", &self.size).finish()
    }
}

/// Resolves logical names to readable resources.
pub trait ResourceStore: Send + Sync {
    /// Open `name` for reading and report its size.
    fn open(&self, name: &str) -> Result<OpenedResource, StoreError>;

    /// Truncate `name` to zero bytes once its contents are safely delivered.
    fn clear(&self, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid resource name: {0:?}")]
    InvalidName(String),

    #[error("resource {name} is {size} bytes, larger than a transfer can describe")]
    TooLarge { name: String, size: u64 },

    #[error("storage error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Reject names that would escape the store's root.
fn check_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Logs stored as plain files under one directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        check_name(name)?;
        Ok(self.root.join(name))
    }
}

impl ResourceStore for DirStore {
    fn open(&self, name: &str) -> Result<OpenedResource, StoreError> {
        let path = self.resolve(name)?;
        let io_err = |source| StoreError::Io {
            name: name.to_string(),
            source,
        };
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(io_err(e)),
        };
        let len = file.metadata().map_err(io_err)?.len();
        let size = u32::try_from(len).map_err(|_| StoreError::TooLarge {
            name: name.to_string(),
            size: len,
        })?;
        tracing::debug!(path = %path.display(), size, "resource opened");
        Ok(OpenedResource {
            size,
            reader: Box::new(file),
        })
    }

    fn clear(&self, name: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        File::create(&path).map_err(|source| StoreError::Io {
            name: name.to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "resource cleared");
        Ok(())
    }
}

/// In-memory store. Tracks how many readers are open so callers can check
/// that every opened resource is closed exactly once.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    files: Arc<DashMap<String, Bytes>>,
    broken: Arc<DashSet<String>>,
    open_readers: Arc<AtomicUsize>,
    closed_readers: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, data: impl Into<Bytes>) {
        self.files.insert(name.to_string(), data.into());
    }

    pub fn contents(&self, name: &str) -> Option<Bytes> {
        self.files.get(name).map(|e| e.value().clone())
    }

    /// Make every subsequent open of `name` fail with an I/O error.
    pub fn break_resource(&self, name: &str) {
        self.broken.insert(name.to_string());
    }

    /// Readers opened and not yet dropped.
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::SeqCst)
    }

    /// Readers dropped so far.
    pub fn closed_readers(&self) -> usize {
        self.closed_readers.load(Ordering::SeqCst)
    }
}

impl ResourceStore for MemoryStore {
    fn open(&self, name: &str) -> Result<OpenedResource, StoreError> {
        check_name(name)?;
        if self.broken.contains(name) {
            return Err(StoreError::Io {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "simulated storage fault"),
            });
        }
        let data = self
            .contents(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.open_readers.fetch_add(1, Ordering::SeqCst);
        Ok(OpenedResource {
            size: data.len() as u32,
            reader: Box::new(MemoryReader {
                cursor: Cursor::new(data),
                open: self.open_readers.clone(),
                closed: self.closed_readers.clone(),
            }),
        })
    }

    fn clear(&self, name: &str) -> Result<(), StoreError> {
        check_name(name)?;
        self.files.insert(name.to_string(), Bytes::new());
        Ok(())
    }
}

struct MemoryReader {
    cursor: Cursor<Bytes>,
    open: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Sinks ────────────────────────────────────────────────────────────────────

/// Destination for one received log. Nothing is visible under the final
/// name until `finish` succeeds.
pub trait LogSink: Send {
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flush and publish. Called once, after the last chunk.
    fn finish(&mut self) -> io::Result<()>;

    /// Throw away everything written so far. Called instead of `finish` when
    /// the transfer fails.
    fn discard(&mut self) -> io::Result<()>;
}

/// Creates a fresh sink per accepted transfer.
pub trait SinkFactory: Send + Sync {
    fn create(&self, name: &str) -> io::Result<Box<dyn LogSink>>;
}

/// Writes each received log to `<dir>/<name>`, replacing older copies.
///
/// Bytes land in `<dir>/.<name>.part` and are renamed over the final path on
/// `finish`, so a reader of the inbox never sees a partial log.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    dir: PathBuf,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(&self, name: &str) -> io::Result<Box<dyn LogSink>> {
        check_name(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let part = self.dir.join(format!(".{name}.part"));
        let file = File::create(&part)?;
        tracing::debug!(path = %part.display(), "sink created");
        Ok(Box::new(FileSink {
            writer: Some(BufWriter::new(file)),
            part,
            path,
        }))
    }
}

struct FileSink {
    /// `None` once finished or discarded.
    writer: Option<BufWriter<File>>,
    part: PathBuf,
    path: PathBuf,
}

impl FileSink {
    fn remove_part(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.part) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl LogSink for FileSink {
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(bytes),
            None => Err(io::Error::new(io::ErrorKind::Other, "sink already closed")),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Err(io::Error::new(io::ErrorKind::Other, "sink already closed"));
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        std::fs::rename(&self.part, &self.path)?;
        tracing::debug!(path = %self.path.display(), "sink finished");
        Ok(())
    }

    fn discard(&mut self) -> io::Result<()> {
        self.writer = None;
        self.remove_part()?;
        tracing::debug!(path = %self.part.display(), "sink discarded");
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            if let Err(e) = self.remove_part() {
                tracing::warn!(path = %self.part.display(), error = %e, "could not remove partial log");
            }
        }
    }
}

/// A received log held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    pub data: Vec<u8>,
    pub finished: bool,
}

/// Sinks that write into shared memory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    files: Arc<DashMap<String, MemoryFile>>,
    fail_writes: Arc<DashSet<String>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, name: &str) -> Option<MemoryFile> {
        self.files.get(name).map(|e| e.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|e| e.key().clone()).collect()
    }

    /// Make writes to sinks named `name` fail.
    pub fn fail_writes_to(&self, name: &str) {
        self.fail_writes.insert(name.to_string());
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create(&self, name: &str) -> io::Result<Box<dyn LogSink>> {
        self.files.insert(name.to_string(), MemoryFile::default());
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            files: self.files.clone(),
            fail: self.fail_writes.contains(name),
        }))
    }
}

struct MemorySink {
    name: String,
    files: Arc<DashMap<String, MemoryFile>>,
    fail: bool,
}

impl LogSink for MemorySink {
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated sink fault"));
        }
        self.files
            .entry(self.name.clone())
            .or_default()
            .data
            .extend_from_slice(bytes);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.files.entry(self.name.clone()).or_default().finished = true;
        Ok(())
    }

    fn discard(&mut self) -> io::Result<()> {
        self.files.remove(&self.name);
        Ok(())
    }
}
