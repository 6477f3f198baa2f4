//! Local filesystem storage backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::backend::{
    cancellable, normalize_path, BoxWriter, FileWriter, StorageBackend, StorageError,
    StorageFile, StorageResult, WalkFn,
};
use super::pipe::CancellableReader;

const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem storage backend.
///
/// Objects map to files under the base directory, with `/` in a path
/// mapping to subdirectories:
/// ```text
/// {base_path}/
///   a/
///     b.txt        # path "a/b.txt"
///     .b.txt.{uuid}.tmp   # in-progress write, renamed on close
/// ```
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the full path for a key, rejecting keys that escape the base
    fn key_path(&self, path: &str) -> StorageResult<PathBuf> {
        let key = normalize_path(path);
        if key.is_empty()
            || key
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.base_path.join(key))
    }

    /// Ensure parent directory exists
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        let full = self.key_path(path)?;
        let (file, metadata) = cancellable(cancel, async {
            let file = fs::File::open(&full)
                .await
                .map_err(|e| StorageError::from_io(e, path))?;
            let metadata = file.metadata().await?;
            Ok((file, metadata))
        })
        .await?;

        if !metadata.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }

        let reader = CancellableReader::new(file, cancel.clone());
        Ok(StorageFile::new(Box::new(reader), path, metadata.len())
            .with_modified(metadata.modified().ok()))
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        let target = self.key_path(path)?;
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        let temp = target.with_file_name(format!(
            ".{}.{}{}",
            file_name,
            uuid::Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));

        let file = cancellable(cancel, async {
            self.ensure_parent(&target).await?;
            Ok(fs::File::create(&temp).await?)
        })
        .await?;

        Ok(Box::new(LocalWriter {
            path: path.to_string(),
            target,
            temp,
            file: Some(file),
            cancel: cancel.clone(),
            error: None,
        }))
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let full = self.key_path(path)?;
        cancellable(cancel, async {
            fs::remove_file(&full)
                .await
                .map_err(|e| StorageError::from_io(e, path))
        })
        .await
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        enum Entry {
            File(String),
            Dir(PathBuf, String),
        }

        let prefix = normalize_path(prefix);
        // Start at the deepest directory the prefix fully names.
        let start_rel = match prefix.rfind('/') {
            Some(idx) => &prefix[..=idx],
            None => "",
        };
        let start = self.base_path.join(start_rel.trim_end_matches('/'));
        match fs::metadata(&start).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let mut stack = vec![Entry::Dir(start, start_rel.to_string())];
        while let Some(entry) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            match entry {
                Entry::File(rel) => visit(&rel)?,
                Entry::Dir(dir, rel_dir) => {
                    let mut children = Vec::new();
                    let mut entries = fs::read_dir(&dir).await?;
                    while let Some(child) = entries.next_entry().await? {
                        let Some(name) = child.file_name().to_str().map(str::to_string) else {
                            tracing::debug!(path = ?child.path(), "skipping non-UTF-8 file name");
                            continue;
                        };
                        let rel = format!("{}{}", rel_dir, name);
                        let file_type = child.file_type().await?;
                        if file_type.is_dir() {
                            let rel_sub = format!("{}/", rel);
                            if rel_sub.starts_with(prefix) || prefix.starts_with(&rel_sub) {
                                children.push((name, Entry::Dir(child.path(), rel_sub)));
                            }
                        } else if file_type.is_file()
                            && !is_temp_file(&name)
                            && rel.starts_with(prefix)
                        {
                            children.push((name, Entry::File(rel)));
                        }
                    }
                    // Sorted by name, pushed in reverse so the smallest pops first.
                    children.sort_by(|a, b| a.0.cmp(&b.0));
                    stack.extend(children.into_iter().rev().map(|(_, e)| e));
                }
            }
        }
        Ok(())
    }
}

/// Writes into a temp file beside the target and renames it into place on
/// close, so readers never observe a partial object.
struct LocalWriter {
    path: String,
    target: PathBuf,
    temp: PathBuf,
    file: Option<fs::File>,
    cancel: CancellationToken,
    error: Option<StorageError>,
}

impl LocalWriter {
    async fn discard(&mut self, err: StorageError) -> StorageError {
        self.file = None;
        if let Err(e) = fs::remove_file(&self.temp).await {
            tracing::debug!(temp = ?self.temp, error = %e, "failed to remove temp file");
        }
        let err = match err {
            e @ (StorageError::Cancelled | StorageError::WriteFailure { .. }) => e,
            e => StorageError::WriteFailure {
                path: self.path.clone(),
                source: Box::new(e),
            },
        };
        self.error = Some(err.clone());
        err
    }
}

#[async_trait]
impl FileWriter for LocalWriter {
    async fn write(&mut self, buf: &[u8]) -> StorageResult<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let Some(file) = self.file.as_mut() else {
            return Err(StorageError::Closed(self.path.clone()));
        };
        let res = cancellable(&self.cancel, async {
            file.write_all(buf).await.map_err(StorageError::from)
        })
        .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(self.discard(e).await),
        }
    }

    async fn close(&mut self) -> StorageResult<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let Some(mut file) = self.file.take() else {
            return Err(StorageError::Closed(self.path.clone()));
        };
        let res = cancellable(&self.cancel, async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&self.temp, &self.target).await?;
            Ok(())
        })
        .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(self.discard(e).await),
        }
    }

    async fn abort(&mut self, reason: StorageError) {
        if self.file.is_some() && self.error.is_none() {
            self.discard(StorageError::Cancelled).await;
            self.error = Some(reason);
        }
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}
