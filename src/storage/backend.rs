//! Storage backend trait definition.
//!
//! Every backend and wrapper in this crate implements [`StorageBackend`]:
//! `open` for streaming reads, `create` for streaming writes that become
//! visible on close, `delete`, and `walk` over a key prefix.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

pub use super::error::{StorageError, StorageResult};

/// Boxed byte stream returned by backends
pub type ByteReader = Box<dyn AsyncRead + Unpin + Send>;

/// Boxed writer returned by `create`
pub type BoxWriter = Box<dyn FileWriter>;

/// Walk visitor. Receives each path relative to the walked store; an error
/// stops the walk and is returned from `walk` unchanged.
pub type WalkFn<'a> = dyn FnMut(&str) -> StorageResult<()> + Send + 'a;

/// An open object.
///
/// Dropping the file releases the underlying stream.
pub struct StorageFile {
    reader: ByteReader,
    name: String,
    size: u64,
    modified: Option<SystemTime>,
}

impl StorageFile {
    pub fn new(reader: ByteReader, name: impl Into<String>, size: u64) -> Self {
        Self {
            reader,
            name: name.into(),
            size,
            modified: None,
        }
    }

    /// Set the last-modified time, if the backend knows it
    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }

    /// Logical name (the path the caller opened)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last-modified time. `None` when the backend cannot tell.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub(crate) fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn into_reader(self) -> ByteReader {
        self.reader
    }

    /// Read the whole object into memory.
    pub async fn read_to_end(mut self) -> StorageResult<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let mut buf = Vec::with_capacity(self.size as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Debug for StorageFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("modified", &self.modified)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for StorageFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Incremental writer for a single object.
///
/// Nothing written is visible to readers until `close` returns `Ok`.
/// After any failure the same error is returned from every later call.
#[async_trait]
pub trait FileWriter: Send {
    /// Append bytes to the object
    async fn write(&mut self, buf: &[u8]) -> StorageResult<()>;

    /// Finalize the object and surface any deferred error
    async fn close(&mut self) -> StorageResult<()>;

    /// Discard everything written so far
    async fn abort(&mut self, reason: StorageError);
}

/// Storage backend trait for pluggable storage.
///
/// Paths are forward-slash separated keys. Every method takes the caller's
/// cancellation token; in-flight calls return `StorageError::Cancelled`
/// promptly once it fires.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open an object for streaming reads
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile>;

    /// Create (or replace) an object. The caller must `close` the writer.
    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter>;

    /// Delete an object
    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()>;

    /// Visit every object whose path starts with `prefix`
    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()>;
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        res = fut => res,
    }
}

/// Strip leading slashes so `/a/b` and `a/b` name the same object.
pub(crate) fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Write a whole buffer through a writer and close it.
pub async fn write_all(writer: &mut dyn FileWriter, data: &[u8]) -> StorageResult<()> {
    writer.write(data).await?;
    writer.close().await
}
