//! In-memory storage backend.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::backend::{
    normalize_path, BoxWriter, FileWriter, StorageBackend, StorageError, StorageFile,
    StorageResult, WalkFn,
};

#[derive(Clone)]
struct MemoryObject {
    data: Bytes,
    modified: SystemTime,
}

type ObjectMap = Arc<RwLock<BTreeMap<String, MemoryObject>>>;

/// Storage backed by an ordered map. Useful as the fastest cache tier and
/// in tests.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: ObjectMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing the writer protocol
    pub fn put(&self, path: &str, data: impl Into<Bytes>) {
        let object = MemoryObject {
            data: data.into(),
            modified: SystemTime::now(),
        };
        self.objects
            .write()
            .insert(normalize_path(path).to_string(), object);
    }

    /// Current contents of an object, if present
    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects
            .read()
            .get(normalize_path(path))
            .map(|o| o.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().contains_key(normalize_path(path))
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let object = self
            .objects
            .read()
            .get(normalize_path(path))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;

        let size = object.data.len() as u64;
        Ok(StorageFile::new(Box::new(Cursor::new(object.data)), path, size)
            .with_modified(Some(object.modified)))
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(Box::new(MemoryWriter {
            key: normalize_path(path).to_string(),
            buf: Some(Vec::new()),
            objects: self.objects.clone(),
            cancel: cancel.clone(),
            error: None,
        }))
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match self.objects.write().remove(normalize_path(path)) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let prefix = normalize_path(prefix);
        // Snapshot so the visitor may call back into this store.
        let keys: Vec<String> = self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            visit(&key)?;
        }
        Ok(())
    }
}

/// Buffers writes and publishes the object on close.
struct MemoryWriter {
    key: String,
    buf: Option<Vec<u8>>,
    objects: ObjectMap,
    cancel: CancellationToken,
    error: Option<StorageError>,
}

#[async_trait]
impl FileWriter for MemoryWriter {
    async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.cancel.is_cancelled() {
            self.buf = None;
            self.error = Some(StorageError::Cancelled);
            return Err(StorageError::Cancelled);
        }
        match self.buf.as_mut() {
            Some(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            None => Err(StorageError::Closed(self.key.clone())),
        }
    }

    async fn close(&mut self) -> StorageResult<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.cancel.is_cancelled() {
            self.buf = None;
            self.error = Some(StorageError::Cancelled);
            return Err(StorageError::Cancelled);
        }
        let buf = self
            .buf
            .take()
            .ok_or_else(|| StorageError::Closed(self.key.clone()))?;
        let object = MemoryObject {
            data: Bytes::from(buf),
            modified: SystemTime::now(),
        };
        self.objects.write().insert(self.key.clone(), object);
        Ok(())
    }

    async fn abort(&mut self, reason: StorageError) {
        if self.buf.take().is_some() && self.error.is_none() {
            self.error = Some(reason);
        }
    }
}
