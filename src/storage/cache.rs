//! Multi-tier read-through cache.
//!
//! A [`CachedStorage`] holds an ordered chain of stores, fastest first. Reads
//! fall back along the chain; when an object is found in a slower tier it is
//! streamed to the caller and copied into every faster tier at the same time.
//!
//! Writes, deletes and walks only touch the fastest tier. In particular
//! `walk` does not merge listings: objects that exist only upstream are not
//! enumerated until a read has pulled them into tier 0.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::backend::{
    BoxWriter, StorageBackend, StorageError, StorageFile, StorageResult, WalkFn,
};
use super::tee::{tee, TeeItem, TeeOptions, TeeReceiver};

/// A failed attempt to copy an object into a faster tier.
///
/// Never returned to the reader; delivered to the backfill hook instead.
#[derive(Debug, Clone)]
pub struct BackfillError {
    pub path: String,
    /// Index of the tier that could not be populated
    pub tier: usize,
    pub error: StorageError,
}

impl fmt::Display for BackfillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backfill of {} into tier {} failed: {}", self.path, self.tier, self.error)
    }
}

impl std::error::Error for BackfillError {}

/// Receives backfill failures
pub type BackfillHook = Arc<dyn Fn(&BackfillError) + Send + Sync>;

fn log_backfill_error(err: &BackfillError) {
    tracing::warn!(path = %err.path, tier = err.tier, error = %err.error, "cache backfill failed");
}

/// Read-through cache over an ordered chain of stores.
pub struct CachedStorage {
    tiers: Vec<Arc<dyn StorageBackend>>,
    hook: BackfillHook,
    options: TeeOptions,
    tasks: TaskTracker,
}

impl CachedStorage {
    /// Build a cache over `tiers`, fastest first. At least two tiers are
    /// required.
    pub fn new(tiers: Vec<Arc<dyn StorageBackend>>) -> StorageResult<Self> {
        if tiers.len() < 2 {
            return Err(StorageError::InvalidConfig(format!(
                "cache needs at least 2 tiers, got {}",
                tiers.len()
            )));
        }
        Ok(Self {
            tiers,
            hook: Arc::new(log_backfill_error),
            options: TeeOptions::default(),
            tasks: TaskTracker::new(),
        })
    }

    /// Replace the default hook, which logs failures at `warn`.
    pub fn with_backfill_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BackfillError) + Send + Sync + 'static,
    {
        self.hook = Arc::new(hook);
        self
    }

    pub fn with_tee_options(mut self, options: TeeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tiers(&self) -> &[Arc<dyn StorageBackend>] {
        &self.tiers
    }

    /// Wait until every backfill started so far has finished.
    pub async fn wait_for_backfills(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stream `source` (found at tier `found_at`) to the caller while copying
    /// it into tiers `0..found_at`.
    async fn backfill(
        &self,
        path: &str,
        source: StorageFile,
        found_at: usize,
        cancel: &CancellationToken,
    ) -> StorageFile {
        let size = source.size();
        let modified = source.modified();

        let mut targets = Vec::with_capacity(found_at);
        for (tier, store) in self.tiers[..found_at].iter().enumerate() {
            let token = cancel.child_token();
            match store.create(path, &token).await {
                Ok(writer) => targets.push((tier, writer, token)),
                Err(error) => (self.hook)(&BackfillError {
                    path: path.to_string(),
                    tier,
                    error,
                }),
            }
        }
        if targets.is_empty() {
            return source.rename(path);
        }

        let tokens = targets.iter().map(|(_, _, token)| token.clone()).collect();
        let (tee, primary, branches) = tee(source.into_reader(), tokens, self.options);

        let tee_cancel = cancel.clone();
        let tee_path = path.to_string();
        self.tasks.spawn(async move {
            if let Err(e) = tee.run(&tee_cancel).await {
                tracing::debug!(path = %tee_path, error = %e, "backfill source stopped");
            }
        });

        let stall = self.options.stall_timeout;
        for ((tier, writer, token), rx) in targets.into_iter().zip(branches) {
            let hook = self.hook.clone();
            let parent = cancel.clone();
            let path = path.to_string();
            self.tasks.spawn(async move {
                match fill_tier(rx, writer, size).await {
                    Ok(bytes) => {
                        tracing::info!(path = %path, tier, bytes, "cache backfill complete")
                    }
                    Err(error) => {
                        let error = if token.is_cancelled() && !parent.is_cancelled() {
                            StorageError::Transport(format!(
                                "tier stalled for more than {:?} and was dropped",
                                stall
                            ))
                        } else {
                            error
                        };
                        hook(&BackfillError { path, tier, error });
                    }
                }
            });
        }

        StorageFile::new(primary.into_reader(), path, size).with_modified(modified)
    }
}

/// Drain one tee branch into a writer. The object is only committed when the
/// whole source arrived.
async fn fill_tier(
    mut rx: TeeReceiver,
    mut writer: BoxWriter,
    expected: u64,
) -> StorageResult<u64> {
    let mut written = 0u64;
    let result = loop {
        match rx.recv().await {
            Some(TeeItem::Data(chunk)) => {
                if let Err(e) = writer.write(&chunk).await {
                    break Err(e);
                }
                written += chunk.len() as u64;
            }
            Some(TeeItem::End) if written != expected => {
                break Err(StorageError::Transport(format!(
                    "source ended after {} of {} bytes",
                    written, expected
                )));
            }
            Some(TeeItem::End) => break writer.close().await.map(|()| written),
            Some(TeeItem::Failed(e)) => break Err(e),
            None => break Err(StorageError::Cancelled),
        }
    };
    if let Err(e) = &result {
        writer.abort(e.clone()).await;
    }
    result
}

#[async_trait]
impl StorageBackend for CachedStorage {
    async fn open(&self, path: &str, cancel: &CancellationToken) -> StorageResult<StorageFile> {
        for (tier, store) in self.tiers.iter().enumerate() {
            match store.open(path, cancel).await {
                Ok(file) if tier == 0 => {
                    tracing::debug!(path, "cache hit");
                    return Ok(file);
                }
                Ok(file) => {
                    tracing::debug!(path, tier, "found in slower tier, backfilling");
                    return Ok(self.backfill(path, file, tier, cancel).await);
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(path, tier, "cache miss");
                }
                Err(e) => {
                    // The object might exist at this tier; don't guess.
                    tracing::debug!(path, tier, error = %e, "tier failed, aborting lookup");
                    return Err(e);
                }
            }
        }
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn create(&self, path: &str, cancel: &CancellationToken) -> StorageResult<BoxWriter> {
        self.tiers[0].create(path, cancel).await
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StorageResult<()> {
        self.tiers[0].delete(path, cancel).await
    }

    async fn walk(
        &self,
        prefix: &str,
        visit: &mut WalkFn<'_>,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        self.tiers[0].walk(prefix, visit, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::write_all;
    use crate::storage::testing::{
        BrokenStreamStorage, CountingStorage, FailingStorage, StalledStorage,
    };
    use crate::storage::MemoryStorage;
    use parking_lot::Mutex;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    type Reports = Arc<Mutex<Vec<BackfillError>>>;

    fn recording(cache: CachedStorage) -> (CachedStorage, Reports) {
        let reports: Reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let cache = cache.with_backfill_hook(move |err| sink.lock().push(err.clone()));
        (cache, reports)
    }

    fn digest(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_requires_two_tiers() {
        let only: Vec<Arc<dyn StorageBackend>> = vec![Arc::new(MemoryStorage::new())];
        assert!(matches!(
            CachedStorage::new(only),
            Err(StorageError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_hit_at_fast_tier_skips_slower_tiers() {
        let fast = MemoryStorage::new();
        fast.put("k", "fast copy");
        let slow = CountingStorage::new(MemoryStorage::new());
        let cache = CachedStorage::new(vec![Arc::new(fast), Arc::new(slow.clone())]).unwrap();
        let cancel = CancellationToken::new();

        let data = cache.open("k", &cancel).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(data, b"fast copy");
        assert_eq!(slow.opens(), 0);
    }

    #[tokio::test]
    async fn test_miss_populates_fast_tier() {
        let fast = MemoryStorage::new();
        let origin = MemoryStorage::new();
        let body = payload(300_000);
        origin.put("models/weights.bin", body.clone());
        let slow = CountingStorage::new(origin);
        let cache =
            CachedStorage::new(vec![Arc::new(fast.clone()), Arc::new(slow.clone())]).unwrap();
        let cancel = CancellationToken::new();

        let file = cache.open("models/weights.bin", &cancel).await.unwrap();
        assert_eq!(file.name(), "models/weights.bin");
        assert_eq!(file.size(), body.len() as u64);
        assert_eq!(file.read_to_end().await.unwrap(), body);
        assert_eq!(slow.opens(), 1);

        cache.wait_for_backfills().await;
        assert_eq!(fast.get("models/weights.bin").unwrap().as_ref(), &body[..]);

        let again = cache.open("models/weights.bin", &cancel).await.unwrap();
        assert_eq!(again.read_to_end().await.unwrap(), body);
        assert_eq!(slow.opens(), 1, "second read must be served by tier 0");
    }

    #[tokio::test]
    async fn test_hit_at_last_tier_populates_every_faster_tier() {
        let t0 = MemoryStorage::new();
        let t1 = CountingStorage::new(MemoryStorage::new());
        let origin = MemoryStorage::new();
        origin.put("deep", "from the origin");
        let t2 = CountingStorage::new(origin);
        let cache = CachedStorage::new(vec![
            Arc::new(t0.clone()),
            Arc::new(t1.clone()),
            Arc::new(t2.clone()),
        ])
        .unwrap();
        let cancel = CancellationToken::new();

        let data = cache.open("deep", &cancel).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(data, b"from the origin");
        cache.wait_for_backfills().await;

        assert_eq!(t0.get("deep").unwrap().as_ref(), b"from the origin");
        assert_eq!(t1.inner().get("deep").unwrap().as_ref(), b"from the origin");
        assert_eq!((t1.opens(), t2.opens()), (1, 1));
    }

    #[tokio::test]
    async fn test_missing_everywhere_reports_requested_path() {
        let cache = CachedStorage::new(vec![
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        ])
        .unwrap();
        let cancel = CancellationToken::new();

        let err = cache.open("no/such/object", &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(p) if p == "no/such/object"));
    }

    #[tokio::test]
    async fn test_transport_error_aborts_lookup() {
        let broken = FailingStorage::new(MemoryStorage::new())
            .fail_open(StorageError::Transport("connection reset".into()));
        let origin = MemoryStorage::new();
        origin.put("k", "v");
        let slow = CountingStorage::new(origin);
        let cache = CachedStorage::new(vec![Arc::new(broken), Arc::new(slow.clone())]).unwrap();
        let cancel = CancellationToken::new();

        let err = cache.open("k", &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Transport(m) if m == "connection reset"));
        assert_eq!(slow.opens(), 0);
    }

    #[tokio::test]
    async fn test_failed_backfill_still_serves_reader() {
        let read_only = FailingStorage::new(MemoryStorage::new())
            .fail_writes(StorageError::Transport("read-only tier".into()));
        let origin = MemoryStorage::new();
        origin.put("k", "authoritative bytes");
        let (cache, reports) = recording(
            CachedStorage::new(vec![Arc::new(read_only.clone()), Arc::new(origin)]).unwrap(),
        );
        let cancel = CancellationToken::new();

        let data = cache.open("k", &cancel).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(data, b"authoritative bytes");

        cache.wait_for_backfills().await;
        assert!(!read_only.inner().contains("k"));
        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tier, 0);
        assert_eq!(reports[0].path, "k");
    }

    #[tokio::test]
    async fn test_failed_create_is_reported() {
        let no_create = FailingStorage::new(MemoryStorage::new())
            .fail_create(StorageError::Transport("bucket gone".into()));
        let origin = MemoryStorage::new();
        origin.put("k", "v");
        let (cache, reports) = recording(
            CachedStorage::new(vec![Arc::new(no_create), Arc::new(origin)]).unwrap(),
        );
        let cancel = CancellationToken::new();

        let data = cache.open("k", &cancel).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(data, b"v");
        assert!(matches!(
            reports.lock()[0].error,
            StorageError::Transport(ref m) if m == "bucket gone"
        ));
    }

    #[tokio::test]
    async fn test_repeated_backfill_is_idempotent() {
        let fast = MemoryStorage::new();
        let origin = MemoryStorage::new();
        let body = payload(100_000);
        origin.put("blob", body.clone());
        let cache = CachedStorage::new(vec![Arc::new(fast.clone()), Arc::new(origin)]).unwrap();
        let cancel = CancellationToken::new();

        cache.open("blob", &cancel).await.unwrap().read_to_end().await.unwrap();
        cache.wait_for_backfills().await;
        let first = digest(&fast.get("blob").unwrap());

        fast.delete("blob", &cancel).await.unwrap();
        cache.open("blob", &cancel).await.unwrap().read_to_end().await.unwrap();
        cache.wait_for_backfills().await;
        let second = digest(&fast.get("blob").unwrap());

        assert_eq!(first, second);
        assert_eq!(first, digest(&body));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_both_succeed() {
        let fast = MemoryStorage::new();
        let origin = MemoryStorage::new();
        let body = payload(500_000);
        origin.put("shared", body.clone());
        let cache = Arc::new(
            CachedStorage::new(vec![Arc::new(fast.clone()), Arc::new(origin)]).unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                cache.open("shared", &cancel).await.unwrap().read_to_end().await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(digest(&handle.await.unwrap()), digest(&body));
        }

        cache.wait_for_backfills().await;
        assert_eq!(digest(&fast.get("shared").unwrap()), digest(&body));
    }

    #[tokio::test]
    async fn test_dropped_reader_still_populates_cache() {
        let fast = MemoryStorage::new();
        let origin = MemoryStorage::new();
        let body = payload(200_000);
        origin.put("k", body.clone());
        let cache = CachedStorage::new(vec![Arc::new(fast.clone()), Arc::new(origin)]).unwrap();
        let cancel = CancellationToken::new();

        let mut file = cache.open("k", &cancel).await.unwrap();
        let mut head = [0u8; 16];
        file.read_exact(&mut head).await.unwrap();
        drop(file);

        cache.wait_for_backfills().await;
        assert_eq!(fast.get("k").unwrap().as_ref(), &body[..]);
    }

    #[tokio::test]
    async fn test_stalled_tier_does_not_block_reader() {
        let origin = MemoryStorage::new();
        let body = payload(256);
        origin.put("k", body.clone());
        let (cache, reports) = recording(
            CachedStorage::new(vec![Arc::new(StalledStorage), Arc::new(origin)])
                .unwrap()
                .with_tee_options(TeeOptions {
                    chunk_size: 4,
                    buffer_chunks: 2,
                    stall_timeout: Duration::from_millis(50),
                }),
        );
        let cancel = CancellationToken::new();

        let data = cache.open("k", &cancel).await.unwrap().read_to_end().await.unwrap();
        assert_eq!(data, body);

        cache.wait_for_backfills().await;
        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].error.to_string().contains("stalled"));
    }

    #[tokio::test]
    async fn test_origin_failure_midway_reaches_reader_and_hook() {
        let fast = MemoryStorage::new();
        let origin = BrokenStreamStorage::new(
            payload(64),
            4,
            StorageError::Transport("disk on fire".into()),
        );
        let (cache, reports) = recording(
            CachedStorage::new(vec![Arc::new(fast.clone()), Arc::new(origin)])
                .unwrap()
                .with_tee_options(TeeOptions {
                    chunk_size: 4,
                    buffer_chunks: 2,
                    stall_timeout: Duration::from_secs(5),
                }),
        );
        let cancel = CancellationToken::new();

        let mut reader = cache.open("flaky", &cancel).await.unwrap().into_reader();
        // Let the source run ahead and fail while the reader's queue is full.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(
            StorageError::from(err),
            StorageError::Transport(m) if m == "disk on fire"
        ));

        cache.wait_for_backfills().await;
        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tier, 0);
        assert!(matches!(&reports[0].error, StorageError::Transport(m) if m == "disk on fire"));
        assert!(!fast.contains("flaky"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_reader_and_backfill() {
        let fast = MemoryStorage::new();
        let origin = MemoryStorage::new();
        origin.put("k", payload(4096));
        let (cache, reports) = recording(
            CachedStorage::new(vec![Arc::new(fast.clone()), Arc::new(origin)])
                .unwrap()
                .with_tee_options(TeeOptions {
                    chunk_size: 4,
                    buffer_chunks: 1,
                    stall_timeout: Duration::from_secs(5),
                }),
        );
        let cancel = CancellationToken::new();

        let file = cache.open("k", &cancel).await.unwrap();
        cancel.cancel();

        let mut out = Vec::new();
        let err = file.into_reader().read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(StorageError::from(err), StorageError::Cancelled));

        cache.wait_for_backfills().await;
        assert!(!fast.contains("k"));
        assert_eq!(reports.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_writes_deletes_and_walks_use_fast_tier_only() {
        let fast = MemoryStorage::new();
        let origin = MemoryStorage::new();
        origin.put("upstream-only", "x");
        let cache =
            CachedStorage::new(vec![Arc::new(fast.clone()), Arc::new(origin.clone())]).unwrap();
        let cancel = CancellationToken::new();

        let mut writer = cache.create("local", &cancel).await.unwrap();
        write_all(writer.as_mut(), b"y").await.unwrap();
        assert!(fast.contains("local"));
        assert!(!origin.contains("local"));

        let mut seen = Vec::new();
        cache
            .walk(
                "",
                &mut |p: &str| {
                    seen.push(p.to_string());
                    Ok(())
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(seen, vec!["local"]);

        origin.put("local", "upstream copy");
        cache.delete("local", &cancel).await.unwrap();
        assert!(!fast.contains("local"));
        assert!(origin.contains("local"));
    }
}
