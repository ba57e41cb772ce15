//! Bounded response buffering.
//!
//! # Responsibilities
//! - Hold a per-session pool of at most `count` buffers
//! - Re-chunk upstream body data into buffers of at most `size` bytes
//!   (`initial_size` for the first chunk of each response)
//! - Return buffers to the pool once the client side has written them
//!
//! # Design Decisions
//! - A buffer is handed to hyper as `Bytes` that owns the pooled buffer;
//!   dropping the `Bytes` after the write returns it to the pool
//! - An exhausted pool suspends the body until a buffer comes back, so
//!   memory is bounded while content is never dropped or truncated

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use axum::BoxError;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::BufferConfig;

struct PoolInner {
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
    count: usize,
    size: usize,
    initial_size: usize,
}

/// A bounded pool of fixed-size buffers, one per session.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.count)),
                free: Mutex::new(Vec::with_capacity(config.count)),
                count: config.count,
                size: config.size,
                initial_size: config.initial_size,
            }),
        }
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.count - self.inner.permits.available_permits()
    }

    /// Copy `data` into a pooled buffer held by `permit`.
    fn fill(&self, permit: OwnedSemaphorePermit, data: &[u8]) -> PooledBuffer {
        let capacity = self.inner.size.max(self.inner.initial_size);
        let mut buf = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Vec::with_capacity(capacity));
        buf.extend_from_slice(data);

        PooledBuffer {
            data: buf,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("count", &self.inner.count)
            .field("size", &self.inner.size)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A filled buffer on its way to the client.
struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        data.clear();
        if let Ok(mut free) = self.pool.free.lock() {
            free.push(data);
        }
        // The permit is released after the buffer is back on the free list.
    }
}

type AcquireFuture =
    Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

/// A response body that relays `inner` through a [`BufferPool`].
pub struct PooledBody<B> {
    inner: B,
    pool: BufferPool,
    pending: Bytes,
    acquiring: Option<AcquireFuture>,
    first: bool,
    inner_done: bool,
}

impl<B> PooledBody<B> {
    pub fn new(inner: B, pool: BufferPool) -> Self {
        Self {
            inner,
            pool,
            pending: Bytes::new(),
            acquiring: None,
            first: true,
            inner_done: false,
        }
    }

    fn poll_permit(&mut self, cx: &mut Context<'_>) -> Poll<Result<OwnedSemaphorePermit, AcquireError>> {
        if self.acquiring.is_none() {
            match Arc::clone(&self.pool.inner.permits).try_acquire_owned() {
                Ok(permit) => return Poll::Ready(Ok(permit)),
                // A closed semaphore surfaces its AcquireError through the async path.
                Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                    let permits = Arc::clone(&self.pool.inner.permits);
                    self.acquiring = Some(Box::pin(permits.acquire_owned()));
                }
            }
        }

        match self.acquiring.as_mut() {
            Some(fut) => {
                let result = ready!(fut.as_mut().poll(cx));
                self.acquiring = None;
                Poll::Ready(result)
            }
            None => Poll::Pending,
        }
    }

    fn next_chunk_limit(&mut self) -> usize {
        if std::mem::replace(&mut self.first, false) {
            self.pool.inner.initial_size
        } else {
            self.pool.inner.size
        }
    }
}

impl<B> Body for PooledBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let permit = match ready!(this.poll_permit(cx)) {
                    Ok(permit) => permit,
                    Err(e) => return Poll::Ready(Some(Err(e.into()))),
                };
                let limit = this.next_chunk_limit();
                let chunk = this.pending.split_to(limit.min(this.pending.len()));
                let buffer = this.pool.fill(permit, &chunk);
                return Poll::Ready(Some(Ok(Frame::data(Bytes::from_owner(buffer)))));
            }

            if this.inner_done {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => this.pending = data,
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                },
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => {
                    this.inner_done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_empty() && (self.inner_done || self.inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        let inner = self.inner.size_hint();
        let pending = self.pending.len() as u64;

        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + pending);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + pending);
        }
        hint
    }
}
