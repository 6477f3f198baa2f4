//! Streaming writer adapter.
//!
//! Cloud upload APIs want a complete body (or a part protocol) while callers
//! want to push bytes incrementally. [`StreamingWriter`] connects the two
//! through an in-memory pipe: `write` pushes into the pipe, a background task
//! runs the upload future and pulls from the other end.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::backend::{cancellable, FileWriter, StorageError, StorageResult};

/// Default pipe buffer between `write` and the upload task
pub const DEFAULT_PIPE_CAPACITY: usize = 1024 * 1024;

type AbortReason = Arc<Mutex<Option<StorageError>>>;

type UploadFn = Box<
    dyn FnOnce(PipeReader, CancellationToken) -> BoxFuture<'static, StorageResult<()>> + Send,
>;

/// Reader that fails once its token fires.
///
/// Wraps the pipe handed to upload futures and the streams returned by
/// `open`, so a blocked read always wakes up on abort or cancellation.
pub struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    reason: Option<AbortReason>,
}

/// Read side of a [`StreamingWriter`]'s pipe
pub type PipeReader = CancellableReader<DuplexStream>;

impl<R> CancellableReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Self {
            inner,
            cancel,
            cancelled,
            reason: None,
        }
    }

    fn with_reason(mut self, reason: AbortReason) -> Self {
        self.reason = Some(reason);
        self
    }

    fn abort_error(&self) -> std::io::Error {
        self.reason
            .as_ref()
            .and_then(|r| r.lock().clone())
            .unwrap_or(StorageError::Cancelled)
            .into_io()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.cancel.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(self.abort_error()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

enum WriterState {
    Idle(UploadFn),
    Running {
        pipe: DuplexStream,
        task: JoinHandle<StorageResult<()>>,
    },
    Closed,
}

/// Writer that feeds a background upload through a pipe.
///
/// The upload starts on the first `write` or `close`. The first error is
/// kept and returned from every later call.
pub struct StreamingWriter {
    path: String,
    capacity: usize,
    state: WriterState,
    cancel: CancellationToken,
    reason: AbortReason,
    error: Option<StorageError>,
}

impl StreamingWriter {
    /// `upload` must consume the reader until EOF and finalize the object,
    /// or return an error. It receives the writer's own cancellation token.
    pub fn new<F, Fut>(path: impl Into<String>, cancel: &CancellationToken, upload: F) -> Self
    where
        F: FnOnce(PipeReader, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<()>> + Send + 'static,
    {
        let upload: UploadFn = Box::new(move |reader, token| Box::pin(upload(reader, token)));
        Self {
            path: path.into(),
            capacity: DEFAULT_PIPE_CAPACITY,
            state: WriterState::Idle(upload),
            cancel: cancel.child_token(),
            reason: Arc::new(Mutex::new(None)),
            error: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn start(&mut self) {
        let state = std::mem::replace(&mut self.state, WriterState::Closed);
        self.state = match state {
            WriterState::Idle(upload) => {
                let (pipe, far) = tokio::io::duplex(self.capacity);
                let reader = CancellableReader::new(far, self.cancel.clone())
                    .with_reason(self.reason.clone());
                tracing::debug!(path = %self.path, "starting upload task");
                let task = tokio::spawn(upload(reader, self.cancel.clone()));
                WriterState::Running { pipe, task }
            }
            other => other,
        };
    }

    /// Close the pipe and wait for the upload task.
    async fn join(&mut self) -> StorageResult<()> {
        match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Running { pipe, task } => {
                drop(pipe);
                match task.await {
                    Ok(res) => res,
                    Err(e) => Err(StorageError::Transport(format!("upload task failed: {e}"))),
                }
            }
            WriterState::Idle(_) | WriterState::Closed => Ok(()),
        }
    }

    fn fail(&mut self, err: StorageError) -> StorageError {
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
impl FileWriter for StreamingWriter {
    async fn write(&mut self, buf: &[u8]) -> StorageResult<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.cancel.is_cancelled() {
            self.join().await.ok();
            return Err(self.fail(StorageError::Cancelled));
        }
        self.start();

        let cancel = self.cancel.clone();
        let WriterState::Running { pipe, .. } = &mut self.state else {
            return Err(StorageError::Closed(self.path.clone()));
        };
        let res = cancellable(&cancel, async {
            pipe.write_all(buf).await.map_err(StorageError::from)
        })
        .await;

        if let Err(pipe_err) = res {
            // The upload ended before we did; its result is the real error.
            let err = match self.join().await {
                Err(upload_err) => upload_err,
                Ok(()) => pipe_err,
            };
            return Err(self.fail(err));
        }
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if matches!(self.state, WriterState::Closed) {
            return Err(StorageError::Closed(self.path.clone()));
        }
        self.start();

        if let WriterState::Running { pipe, .. } = &mut self.state {
            // A failed shutdown means the reader is already gone; join reports why.
            pipe.shutdown().await.ok();
        }
        match self.join().await {
            Ok(()) => {
                tracing::debug!(path = %self.path, "upload finalized");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn abort(&mut self, reason: StorageError) {
        if matches!(self.state, WriterState::Closed) && self.error.is_none() {
            return;
        }
        *self.reason.lock() = Some(reason.clone());
        self.cancel.cancel();
        if let Err(e) = self.join().await {
            tracing::debug!(path = %self.path, error = %e, "upload aborted");
        }
        if self.error.is_none() {
            self.error = Some(reason);
        }
    }
}

impl Drop for StreamingWriter {
    fn drop(&mut self) {
        if let WriterState::Running { .. } = self.state {
            tracing::debug!(path = %self.path, "writer dropped before close, cancelling upload");
            self.cancel.cancel();
        }
    }
}
