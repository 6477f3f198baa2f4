//! Fan one byte stream out to several independent consumers.
//!
//! The tee reads its source once. Every consumer owns a bounded channel of
//! chunks and drains it at its own pace. The primary consumer (the caller's
//! reader) is always waited for; a branch that stays full for longer than
//! the stall timeout is dropped so it cannot hold the primary back forever.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::backend::{ByteReader, StorageError, StorageResult};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_BUFFER_CHUNKS: usize = 16;
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tee tuning
#[derive(Debug, Clone, Copy)]
pub struct TeeOptions {
    /// Bytes read from the source per step
    pub chunk_size: usize,
    /// Chunks each consumer may have queued
    pub buffer_chunks: usize,
    /// How long a full branch may block the source before it is dropped
    pub stall_timeout: Duration,
}

impl Default for TeeOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_chunks: DEFAULT_BUFFER_CHUNKS,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// One message on a consumer channel
#[derive(Debug, Clone)]
pub enum TeeItem {
    Data(Bytes),
    /// Source reached EOF; everything has been delivered
    End,
    /// Source failed or the tee was cancelled
    Failed(StorageError),
}

/// Consumer end of a tee.
///
/// A closed channel without a preceding `End` or `Failed` means the
/// consumer was abandoned and must discard what it received.
pub struct TeeReceiver {
    rx: mpsc::Receiver<TeeItem>,
    failure: FailureSlot,
}

/// First source error, shared so a consumer whose queue was full when the
/// source failed still learns why.
type FailureSlot = Arc<Mutex<Option<StorageError>>>;

impl TeeReceiver {
    pub async fn recv(&mut self) -> Option<TeeItem> {
        match self.rx.recv().await {
            Some(item) => Some(item),
            None => self.failure.lock().clone().map(TeeItem::Failed),
        }
    }

    /// Turn the receiver into a plain byte stream.
    pub fn into_reader(self) -> ByteReader {
        let stream = futures::stream::unfold(Some(self), |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Some(TeeItem::Data(chunk)) => Some((Ok(chunk), Some(rx))),
                Some(TeeItem::End) => None,
                Some(TeeItem::Failed(e)) => Some((Err(e.into_io()), None)),
                None => Some((Err(StorageError::Cancelled.into_io()), None)),
            }
        });
        Box::new(StreamReader::new(Box::pin(stream)))
    }
}

struct Branch {
    tx: mpsc::Sender<TeeItem>,
    abandon: CancellationToken,
}

/// Producer side. Drive it with [`Tee::run`].
pub struct Tee<R> {
    source: R,
    primary: Option<mpsc::Sender<TeeItem>>,
    branches: Vec<Option<Branch>>,
    options: TeeOptions,
    failure: FailureSlot,
}

/// Build a tee with one primary consumer and one branch per token.
///
/// A branch's token is cancelled when the tee gives up on it for stalling.
pub fn tee<R>(
    source: R,
    branch_tokens: Vec<CancellationToken>,
    options: TeeOptions,
) -> (Tee<R>, TeeReceiver, Vec<TeeReceiver>)
where
    R: AsyncRead + Unpin + Send,
{
    let capacity = options.buffer_chunks.max(1);
    let failure = FailureSlot::default();
    let (primary_tx, primary_rx) = mpsc::channel(capacity);

    let mut branches = Vec::with_capacity(branch_tokens.len());
    let mut receivers = Vec::with_capacity(branch_tokens.len());
    for abandon in branch_tokens {
        let (tx, rx) = mpsc::channel(capacity);
        branches.push(Some(Branch { tx, abandon }));
        receivers.push(TeeReceiver {
            rx,
            failure: failure.clone(),
        });
    }

    let tee = Tee {
        source,
        primary: Some(primary_tx),
        branches,
        options,
        failure: failure.clone(),
    };
    let primary = TeeReceiver {
        rx: primary_rx,
        failure,
    };
    (tee, primary, receivers)
}

impl<R> Tee<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Copy the source to every consumer. Returns the number of bytes read.
    ///
    /// Stops early, successfully, once no consumer is left.
    pub async fn run(mut self, cancel: &CancellationToken) -> StorageResult<u64> {
        let mut total = 0u64;
        let mut buf = BytesMut::new();

        loop {
            if self.is_idle() {
                tracing::debug!(bytes = total, "all tee consumers gone, stopping");
                return Ok(total);
            }

            buf.reserve(self.options.chunk_size);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StorageError::Cancelled),
                res = self.source.read_buf(&mut buf) => res.map_err(StorageError::from),
            };

            let finished = match read {
                Ok(0) => self.deliver(TeeItem::End, cancel).await.map(|()| true),
                Ok(n) => {
                    total += n as u64;
                    let chunk = buf.split().freeze();
                    self.deliver(TeeItem::Data(chunk), cancel).await.map(|()| false)
                }
                Err(e) => Err(e),
            };

            match finished {
                Ok(true) => return Ok(total),
                Ok(false) => {}
                Err(e) => {
                    self.fail_all(e.clone());
                    return Err(e);
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.primary.is_none() && self.branches.iter().all(Option::is_none)
    }

    async fn deliver(&mut self, item: TeeItem, cancel: &CancellationToken) -> StorageResult<()> {
        if let Some(tx) = &self.primary {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                res = tx.send(item.clone()) => res,
            };
            if sent.is_err() {
                tracing::debug!("primary reader dropped, continuing for branches");
                self.primary = None;
            }
        }

        let stall = self.options.stall_timeout;
        for (idx, slot) in self.branches.iter_mut().enumerate() {
            let Some(branch) = slot.as_mut() else {
                continue;
            };
            let keep = match branch.tx.try_send(item.clone()) {
                Ok(()) => true,
                Err(TrySendError::Closed(_)) => false,
                Err(TrySendError::Full(item)) => {
                    let waited = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                        res = tokio::time::timeout(stall, branch.tx.send(item)) => res,
                    };
                    match waited {
                        Ok(Ok(())) => true,
                        Ok(Err(_)) => false,
                        Err(_) => {
                            tracing::warn!(
                                branch = idx,
                                timeout = ?stall,
                                "tee branch stalled, dropping it"
                            );
                            branch.abandon.cancel();
                            false
                        }
                    }
                }
            };
            if !keep {
                *slot = None;
            }
        }
        Ok(())
    }

    /// Record the failure, then close every channel. Consumers with room
    /// get it in-band; the rest read it from the slot once their queue drains.
    fn fail_all(&mut self, err: StorageError) {
        self.failure.lock().get_or_insert_with(|| err.clone());
        if let Some(tx) = self.primary.take() {
            let _ = tx.try_send(TeeItem::Failed(err.clone()));
        }
        for branch in self.branches.iter_mut().filter_map(Option::take) {
            let _ = branch.tx.try_send(TeeItem::Failed(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn small_options() -> TeeOptions {
        TeeOptions {
            chunk_size: 4,
            buffer_chunks: 2,
            stall_timeout: Duration::from_millis(50),
        }
    }

    async fn drain(mut rx: TeeReceiver) -> (Vec<u8>, Option<TeeItem>) {
        let mut data = Vec::new();
        loop {
            match rx.recv().await {
                Some(TeeItem::Data(chunk)) => data.extend_from_slice(&chunk),
                other => return (data, other),
            }
        }
    }

    #[tokio::test]
    async fn test_every_consumer_sees_every_byte() {
        let payload: Vec<u8> = (0..200u8).collect();
        let cancel = CancellationToken::new();
        let tokens = vec![CancellationToken::new(), CancellationToken::new()];
        let (tee, primary, branches) = tee(Cursor::new(payload.clone()), tokens, small_options());

        let runner = tokio::spawn({
            let cancel = cancel.clone();
            async move { tee.run(&cancel).await }
        });
        let mut handles = Vec::new();
        for rx in branches {
            handles.push(tokio::spawn(drain(rx)));
        }

        let mut reader = primary.into_reader();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);

        for handle in handles {
            let (data, last) = handle.await.unwrap();
            assert_eq!(data, payload);
            assert!(matches!(last, Some(TeeItem::End)));
        }
        assert_eq!(runner.await.unwrap().unwrap(), 200);
    }

    #[tokio::test]
    async fn test_dropped_primary_keeps_branches_going() {
        let payload = vec![7u8; 100];
        let cancel = CancellationToken::new();
        let (tee, primary, mut branches) =
            tee(Cursor::new(payload.clone()), vec![CancellationToken::new()], small_options());
        drop(primary);

        let branch = tokio::spawn(drain(branches.remove(0)));
        tee.run(&cancel).await.unwrap();

        let (data, last) = branch.await.unwrap();
        assert_eq!(data, payload);
        assert!(matches!(last, Some(TeeItem::End)));
    }

    #[tokio::test]
    async fn test_stalled_branch_is_dropped() {
        let payload = vec![1u8; 64];
        let cancel = CancellationToken::new();
        let abandon = CancellationToken::new();
        let (tee, primary, mut branches) =
            tee(Cursor::new(payload.clone()), vec![abandon.clone()], small_options());
        // Hold the branch receiver without ever reading it.
        let stalled = branches.remove(0);

        let runner = tokio::spawn({
            let cancel = cancel.clone();
            async move { tee.run(&cancel).await }
        });
        let mut out = Vec::new();
        primary.into_reader().read_to_end(&mut out).await.unwrap();

        assert_eq!(out, payload);
        assert!(runner.await.unwrap().is_ok());
        assert!(abandon.is_cancelled());

        let (_, last) = drain(stalled).await;
        assert!(last.is_none(), "abandoned branch must not see End");
    }

    #[tokio::test]
    async fn test_source_error_reaches_full_consumers() {
        let chunks = vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"efgh")),
            Err(StorageError::Transport("origin reset".into()).into_io()),
        ];
        let source = StreamReader::new(futures::stream::iter(chunks));
        let cancel = CancellationToken::new();
        let (tee, primary, mut branches) =
            tee(source, vec![CancellationToken::new()], small_options());

        // Nobody reads until the source has failed, so both queues are full.
        let err = tee.run(&cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Transport(_)));

        let (data, last) = drain(branches.remove(0)).await;
        assert_eq!(data, b"abcdefgh");
        assert!(matches!(last, Some(TeeItem::Failed(StorageError::Transport(_)))));

        let mut out = Vec::new();
        let err = primary.into_reader().read_to_end(&mut out).await.unwrap_err();
        assert_eq!(out, b"abcdefgh");
        assert!(matches!(
            StorageError::from(err),
            StorageError::Transport(m) if m == "origin reset"
        ));
    }

    #[tokio::test]
    async fn test_cancellation_fails_reader() {
        let cancel = CancellationToken::new();
        // A source that never produces anything.
        let (_keep, source) = tokio::io::duplex(8);
        let (tee, primary, _) = tee(source, Vec::new(), small_options());

        let runner = tokio::spawn({
            let cancel = cancel.clone();
            async move { tee.run(&cancel).await }
        });
        cancel.cancel();

        let mut out = Vec::new();
        let err = primary.into_reader().read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(StorageError::from(err), StorageError::Cancelled));
        assert!(matches!(runner.await.unwrap(), Err(StorageError::Cancelled)));
    }
}
