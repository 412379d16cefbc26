//! Platform file interface. The transfer engine only ever touches local
//! bytes through [`FileSystem`]; the host picks one implementation at init.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use tempfile::NamedTempFile;
use tokio::{io::AsyncWrite, sync::mpsc};

use crate::error::{Error, Result};

pub trait FileHandle: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> FileHandle for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate for writing.
    Create,
}

pub trait FileSystem: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn size(&self, path: &Path) -> Result<u64>;

    fn load_progress(&self, id: &str) -> Result<Option<Vec<u8>>>;
    /// Atomically replaces the record. Returns once the bytes are as durable
    /// as the platform allows.
    fn save_progress(&self, id: &str, bytes: &[u8]) -> Result<()>;
    fn remove_progress(&self, id: &str) -> Result<()>;

    /// Whether progress survives the process. Uploads are only resumable
    /// across restarts when this is true.
    fn is_durable(&self) -> bool;
}

fn mutex_poisoned<T>(_: T) -> Error {
    Error::internal("file system lock poisoned")
}

#[derive(Debug, Clone)]
pub struct DiskFs {
    progress_dir: PathBuf,
}

impl DiskFs {
    pub fn new(progress_dir: impl Into<PathBuf>) -> Result<Self> {
        let progress_dir = progress_dir.into();
        fs::create_dir_all(&progress_dir)?;
        Ok(Self { progress_dir })
    }

    fn progress_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::invalid_parameter(format!("bad progress id: {}", id)));
        }
        Ok(self.progress_dir.join(format!("{}.progress", id)))
    }
}

impl FileSystem for DiskFs {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(path)?,
            OpenMode::Create => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?
            }
        };
        Ok(Box::new(file))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn load_progress(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.progress_path(id)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_progress(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.progress_path(id)?;
        let mut tmp = NamedTempFile::new_in(&self.progress_dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::from(e.error))?;
        #[cfg(unix)]
        File::open(&self.progress_dir)?.sync_all()?;
        Ok(())
    }

    fn remove_progress(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.progress_path(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}

type SharedBytes = Arc<Mutex<Vec<u8>>>;

/// Random-access file backed by a shared byte vector. Used for block-aligned
/// output where windows land at known offsets.
#[derive(Debug, Clone, Default)]
pub struct MemFile {
    data: SharedBytes,
    pos: u64,
}

impl MemFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes)),
            pos: 0,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

fn lock_io(data: &SharedBytes) -> io::Result<std::sync::MutexGuard<'_, Vec<u8>>> {
    data.lock()
        .map_err(|_| io::Error::other("memory file lock poisoned"))
}

impl Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = lock_io(&self.data)?;
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        drop(data);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = lock_io(&self.data)?;
        let start = self.pos as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        drop(data);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = lock_io(&self.data)?.len() as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(off) => len + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Process-memory file system. Progress does not outlive the process, so
/// uploads through it are not resumable across restarts.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    files: Arc<Mutex<HashMap<PathBuf, SharedBytes>>>,
    progress: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) -> Result<()> {
        self.files
            .lock()
            .map_err(mutex_poisoned)?
            .insert(path.into(), Arc::new(Mutex::new(bytes)));
        Ok(())
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self.files.lock().map_err(mutex_poisoned)?;
        let data = files
            .get(path)
            .ok_or_else(|| Error::file_not_found(path.display()))?;
        let bytes = data.lock().map_err(mutex_poisoned)?.clone();
        Ok(bytes)
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let mut files = self.files.lock().map_err(mutex_poisoned)?;
        let data = match mode {
            OpenMode::Read => files
                .get(path)
                .cloned()
                .ok_or_else(|| Error::file_not_found(path.display()))?,
            OpenMode::Create => {
                let data: SharedBytes = Arc::default();
                files.insert(path.to_path_buf(), data.clone());
                data
            }
        };
        Ok(Box::new(MemFile { data, pos: 0 }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .map_err(mutex_poisoned)?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::file_not_found(path.display()))
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Ok(self.read(path)?.len() as u64)
    }

    fn load_progress(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.progress.lock().map_err(mutex_poisoned)?.get(id).cloned())
    }

    fn save_progress(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.progress
            .lock()
            .map_err(mutex_poisoned)?
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove_progress(&self, id: &str) -> Result<()> {
        self.progress.lock().map_err(mutex_poisoned)?.remove(id);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Write-only handle that forwards every write as one message. Streaming
/// consumers read the receiver; only sequential output is supported.
pub struct ChannelFile {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    written: u64,
}

impl Read for ChannelFile {
    fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "channel files are write-only",
        ))
    }
}

impl Write for ChannelFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream receiver dropped"))?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ChannelFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.written),
            SeekFrom::Start(p) if p == self.written => Ok(self.written),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "channel files cannot seek",
            )),
        }
    }
}

/// Streams opened files into channels. Progress lives in memory.
#[derive(Clone, Default)]
pub struct ChannelFs {
    streams: Arc<Mutex<HashMap<PathBuf, mpsc::UnboundedSender<Vec<u8>>>>>,
    progress: MemFs,
}

impl ChannelFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream for `path`; the next `open(path, Create)` writes
    /// into the returned receiver.
    pub fn stream(&self, path: impl Into<PathBuf>) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .map_err(mutex_poisoned)?
            .insert(path.into(), tx);
        Ok(rx)
    }
}

impl FileSystem for ChannelFs {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        if mode == OpenMode::Read {
            return Err(Error::invalid_parameter("channel file system is write-only"));
        }
        let tx = self
            .streams
            .lock()
            .map_err(mutex_poisoned)?
            .remove(path)
            .ok_or_else(|| Error::file_not_found(path.display()))?;
        Ok(Box::new(ChannelFile { tx, written: 0 }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.streams.lock().map_err(mutex_poisoned)?.remove(path);
        Ok(())
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Err(Error::invalid_parameter(format!(
            "size of stream {} is unknown",
            path.display()
        )))
    }

    fn load_progress(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.progress.load_progress(id)
    }

    fn save_progress(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.progress.save_progress(id, bytes)
    }

    fn remove_progress(&self, id: &str) -> Result<()> {
        self.progress.remove_progress(id)
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Async sink over a synchronous handle. Handles from this module are local
/// disk, memory or an unbounded channel, none of which park the caller.
pub struct HandleWriter {
    handle: Box<dyn FileHandle>,
}

impl HandleWriter {
    pub fn new(handle: Box<dyn FileHandle>) -> Self {
        Self { handle }
    }
}

impl AsyncWrite for HandleWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.handle.write(buf))
    }

    fn poll_flush(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.handle.flush())
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.handle.flush())
    }
}
