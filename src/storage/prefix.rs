//! Path-prefix isolation wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::backend::{
    normalize_path, BoxWriter, StorageBackend, StorageFile, StorageResult, WalkFn,
};

/// Confines every operation to `prefix/` inside the inner store.
///
/// Callers see paths relative to the prefix: `open("a.txt")` reads
/// `prefix/a.txt`, and `walk` reports `a.txt` rather than `prefix/a.txt`.
pub struct PrefixedStorage {
    inner: Arc<dyn StorageBackend>,
    /// Normalized prefix including its trailing `/`, or empty
    prefix: String,
}

impl PrefixedStorage {
    pub fn new(inner: Arc<dyn StorageBackend>, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Self { inner, prefix }
    }

    /// The prefix as applied to inner paths, e.g. `tenant-a/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_path(&self, path: &str) -> String {
        format!("{}{}", self.prefix, normalize_path(path))
    }
}

#[async_trait]
impl StorageBackend for PrefixedStorage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        let file = self
            .inner
            .open(&self.full_path(path), cancel)
            .await
            .map_err(|e| e.with_path(path))?;
        Ok(file.rename(path))
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        self.inner
            .create(&self.full_path(path), cancel)
            .await
            .map_err(|e| e.with_path(path))
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        self.inner
            .delete(&self.full_path(path), cancel)
            .await
            .map_err(|e| e.with_path(path))
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let own_prefix = self.prefix.as_str();
        let mut strip = |name: &str| match name.strip_prefix(own_prefix) {
            Some(relative) => visit(relative),
            None => {
                tracing::debug!(
                    name,
                    prefix = own_prefix,
                    "walk returned a name outside the prefix"
                );
                Ok(())
            }
        };
        self.inner
            .walk(&self.full_path(prefix), &mut strip, cancel)
            .await
    }
}
