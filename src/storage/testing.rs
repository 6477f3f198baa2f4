//! Test doubles for exercising wrappers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::backend::{
    BoxWriter, FileWriter, StorageBackend, StorageError, StorageFile, StorageResult, WalkFn,
};
use super::MemoryStorage;

/// Memory store that counts `open` calls.
#[derive(Clone, Default)]
pub struct CountingStorage {
    inner: MemoryStorage,
    opens: Arc<AtomicUsize>,
}

impl CountingStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }
}

#[async_trait]
impl StorageBackend for CountingStorage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(path, cancel).await
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        self.inner.create(path, cancel).await
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        self.inner.delete(path, cancel).await
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        self.inner.walk(prefix, visit, cancel).await
    }
}

/// Memory store with injectable failures.
#[derive(Clone, Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    open_error: Option<StorageError>,
    create_error: Option<StorageError>,
    write_error: Option<StorageError>,
}

impl FailingStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn fail_open(mut self, err: StorageError) -> Self {
        self.open_error = Some(err);
        self
    }

    pub fn fail_create(mut self, err: StorageError) -> Self {
        self.create_error = Some(err);
        self
    }

    /// `create` succeeds but every write fails
    pub fn fail_writes(mut self, err: StorageError) -> Self {
        self.write_error = Some(err);
        self
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }
}

struct RejectingWriter(StorageError);

#[async_trait]
impl FileWriter for RejectingWriter {
    async fn write(&mut self, _buf: &[u8]) -> StorageResult<()> {
        Err(self.0.clone())
    }

    async fn close(&mut self) -> StorageResult<()> {
        Err(self.0.clone())
    }

    async fn abort(&mut self, _reason: StorageError) {}
}

#[async_trait]
impl StorageBackend for FailingStorage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        match &self.open_error {
            Some(err) => Err(err.clone()),
            None => self.inner.open(path, cancel).await,
        }
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        if let Some(err) = &self.create_error {
            return Err(err.clone());
        }
        if let Some(err) = &self.write_error {
            return Ok(Box::new(RejectingWriter(err.clone())));
        }
        self.inner.create(path, cancel).await
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        self.inner.delete(path, cancel).await
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        self.inner.walk(prefix, visit, cancel).await
    }
}

/// Empty store whose writers block until their token is cancelled.
pub struct StalledStorage;

struct StalledWriter(CancellationToken);

#[async_trait]
impl FileWriter for StalledWriter {
    async fn write(&mut self, _buf: &[u8]) -> StorageResult<()> {
        self.0.cancelled().await;
        Err(StorageError::Cancelled)
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.0.cancelled().await;
        Err(StorageError::Cancelled)
    }

    async fn abort(&mut self, _reason: StorageError) {}
}

#[async_trait]
impl StorageBackend for StalledStorage {
    async fn open(&self, path: &str, _cancel: &CancellationToken) -> StorageResult<StorageFile> {
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn create(&self, _path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        Ok(Box::new(StalledWriter(cancel.clone())))
    }

    async fn delete(&self, path: &str, _cancel: &CancellationToken) -> StorageResult<()> {
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn walk(
        &self,
        _prefix: &str,
        _visit: &mut WalkFn<'_>,
        _cancel: &CancellationToken,
    ) -> StorageResult<()> {
        Ok(())
    }
}

/// Store whose objects stream `data` in small chunks and then fail.
///
/// `open` advertises twice the real length, as an origin would before the
/// connection dropped.
pub struct BrokenStreamStorage {
    data: Vec<u8>,
    chunk: usize,
    error: StorageError,
}

impl BrokenStreamStorage {
    pub fn new(data: Vec<u8>, chunk: usize, error: StorageError) -> Self {
        Self {
            data,
            chunk: chunk.max(1),
            error,
        }
    }
}

#[async_trait]
impl StorageBackend for BrokenStreamStorage {
    async fn open(&self, path: &str, _cancel: &CancellationToken) -> StorageResult<StorageFile> {
        let mut items: Vec<std::io::Result<Bytes>> = self
            .data
            .chunks(self.chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        items.push(Err(self.error.clone().into_io()));
        let reader = StreamReader::new(futures::stream::iter(items));
        Ok(StorageFile::new(Box::new(reader), path, self.data.len() as u64 * 2))
    }

    async fn create(&self, path: &str, _cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        Err(StorageError::InvalidPath(path.to_string()))
    }

    async fn delete(&self, path: &str, _cancel: &CancellationToken) -> StorageResult<()> {
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn walk(
        &self,
        _prefix: &str,
        _visit: &mut WalkFn<'_>,
        _cancel: &CancellationToken,
    ) -> StorageResult<()> {
        Ok(())
    }
}
