//! Prefetching range reader
//!
//! [`AsyncRangeReader`] turns ranged GETs into one sequential
//! [`AsyncRead`]. A background task keeps up to `buffer_count` filled buffers
//! ahead of the consumer:
//!
//! - a semaphore with `buffer_count` permits bounds buffers in flight; each
//!   permit travels with its buffer and is released when the consumer has
//!   drained it
//! - buffers start at `initial_buffer_size` and double per fill up to
//!   `max_buffer_size`
//! - a body that ends early is re-opened at the cursor; every fetch must start
//!   at the cursor and carry the session ETag
//!
//! Bytes are delivered in strict offset order. After an integrity failure no
//! further bytes are delivered.

use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::buffer_pool::{BufferPool, SharedBufferPool};
use super::range::RangeGetter;
use super::{DEFAULT_INITIAL_BUFFER_SIZE, DEFAULT_MAX_BUFFER_SIZE};
use crate::checksum::Crc64Hasher;
use crate::error::{IntegrityError, Result, TransferCause, TransferError};
use crate::executor::{BodyStream, GetRangeOutput, HttpRange};

/// Tuning and shared resources for one reader
#[derive(Clone)]
pub struct ReaderOptions {
    /// Object path used in errors
    pub path: String,
    pub initial_buffer_size: usize,
    pub max_buffer_size: usize,
    pub pool: Arc<dyn BufferPool>,
    /// Cancelling this token fails pending and later reads
    pub cancel: CancellationToken,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            pool: Arc::new(SharedBufferPool::new(super::DEFAULT_BUFFER_COUNT)),
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("path", &self.path)
            .field("initial_buffer_size", &self.initial_buffer_size)
            .field("max_buffer_size", &self.max_buffer_size)
            .finish_non_exhaustive()
    }
}

/// A filled buffer and the permit that admitted it
struct Filled {
    buf: BytesMut,
    pos: usize,
    _permit: OwnedSemaphorePermit,
}

enum Chunk {
    Data(Filled),
    Failed(TransferCause),
}

/// Position of the next fetch within the requested range
#[derive(Debug)]
struct RangeCursor {
    requested: HttpRange,
    next_offset: u64,
    /// Exclusive end, clamped to the object size once known
    end: Option<u64>,
    etag: Option<String>,
}

impl RangeCursor {
    fn new(requested: HttpRange, etag: Option<String>) -> Self {
        Self {
            requested,
            next_offset: requested.offset,
            end: requested.end(),
            etag,
        }
    }

    fn remaining(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.next_offset))
    }

    fn is_done(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Range still to fetch
    fn pending_range(&self) -> HttpRange {
        HttpRange::new(self.next_offset, self.remaining())
    }

    /// Check a fresh response against the cursor and adopt its metadata
    fn accept(&mut self, response: &GetRangeOutput) -> std::result::Result<(), IntegrityError> {
        if response.start != self.next_offset {
            return Err(IntegrityError::OffsetMismatch {
                expected: self.next_offset,
                actual: response.start,
            });
        }

        match &self.etag {
            Some(etag) if *etag != response.etag => {
                return Err(IntegrityError::EtagMismatch {
                    expected: etag.clone(),
                    actual: response.etag.clone(),
                })
            }
            Some(_) => {}
            None => self.etag = Some(response.etag.clone()),
        }

        let object_end = response.object_size;
        self.end = Some(match self.requested.end() {
            Some(end) => end.min(object_end),
            None => object_end,
        });
        Ok(())
    }
}

/// Background producer feeding the ready channel
struct Prefetcher {
    getter: Arc<dyn RangeGetter>,
    pool: Arc<dyn BufferPool>,
    permits: Arc<Semaphore>,
    ready: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
    cursor: RangeCursor,
    /// First response, handed over by the caller that already issued it
    initial: Option<GetRangeOutput>,
    body: Option<BodyStream>,
    /// Buffer being filled; owned here so it survives a dropped fill
    filling: Option<BytesMut>,
    session_etag: Arc<OnceLock<String>>,
    buffer_size: usize,
    max_buffer_size: usize,
}

impl Prefetcher {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferCause::Cancelled),
            result = self.fill_loop() => result,
        };

        if let Err(cause) = outcome {
            if !cause.is_cancelled() {
                warn!(offset = self.cursor.next_offset, error = %cause, "Prefetch failed");
            }
            // Capacity is reserved for this message
            let _ = self.ready.try_send(Chunk::Failed(cause));
        }
        if let Some(buf) = self.filling.take() {
            self.pool.release(buf);
        }
        // The active body is dropped here, once
    }

    async fn fill_loop(&mut self) -> std::result::Result<(), TransferCause> {
        loop {
            if self.cursor.is_done() {
                trace!(offset = self.cursor.next_offset, "Range complete");
                return Ok(());
            }

            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TransferCause::Internal("prefetch semaphore closed".to_string()))?;

            let want = match self.cursor.remaining() {
                Some(remaining) => (remaining.min(self.buffer_size as u64)) as usize,
                None => self.buffer_size,
            };
            self.filling = Some(self.pool.acquire(want));

            // Bytes verified before a failure are still delivered
            let filled = self.fill(want).await;
            let empty = match &self.filling {
                Some(buf) => buf.is_empty(),
                None => true,
            };
            if empty {
                if let Some(buf) = self.filling.take() {
                    self.pool.release(buf);
                }
                return filled;
            }

            let slot = match self.ready.reserve().await {
                Ok(slot) => slot,
                // Reader is gone
                Err(_) => return Ok(()),
            };
            let buf = self.filling.take().unwrap_or_default();
            trace!(len = buf.len(), next = self.cursor.next_offset, "Buffer ready");
            slot.send(Chunk::Data(Filled {
                buf,
                pos: 0,
                _permit: permit,
            }));
            filled?;

            self.buffer_size = (self.buffer_size * 2).min(self.max_buffer_size);
        }
    }

    async fn fill(&mut self, want: usize) -> std::result::Result<(), TransferCause> {
        loop {
            let have = self.filling.as_ref().map_or(0, BytesMut::len);
            if have >= want || self.cursor.is_done() {
                break;
            }

            let fresh = self.body.is_none();
            if fresh {
                self.open().await?;
                if self.cursor.is_done() {
                    break;
                }
            }

            let mut limit = (want - have) as u64;
            if let Some(remaining) = self.cursor.remaining() {
                limit = limit.min(remaining);
            }

            let (body, buf) = match (self.body.as_mut(), self.filling.as_mut()) {
                (Some(body), Some(buf)) => (body, buf),
                _ => break,
            };
            let n = body.take(limit).read_buf(buf).await?;

            if n == 0 {
                self.body = None;
                if fresh {
                    return Err(IntegrityError::UnexpectedEof {
                        offset: self.cursor.next_offset,
                    }
                    .into());
                }
                debug!(offset = self.cursor.next_offset, "Body ended early, reopening");
                continue;
            }
            self.cursor.next_offset += n as u64;
        }
        Ok(())
    }

    async fn open(&mut self) -> std::result::Result<(), TransferCause> {
        let response = match self.initial.take() {
            Some(response) => response,
            None => {
                let range = self.cursor.pending_range();
                debug!(range = %range, "Fetching range");
                self.getter.get_range(range).await?
            }
        };

        self.cursor.accept(&response)?;
        if let Some(etag) = &self.cursor.etag {
            let _ = self.session_etag.set(etag.clone());
        }
        self.body = Some(response.body);
        Ok(())
    }
}

/// Sequential reader over a byte range with background look-ahead
pub struct AsyncRangeReader {
    path: String,
    requested: HttpRange,
    ready: mpsc::Receiver<Chunk>,
    current: Option<Filled>,
    pool: Arc<dyn BufferPool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    session_etag: Arc<OnceLock<String>>,
    delivered: u64,
    hasher: Crc64Hasher,
    failed: Option<TransferCause>,
    closed: bool,
}

impl AsyncRangeReader {
    /// Start prefetching `range` through `getter`
    ///
    /// `expected_etag`, when set, must match every response; otherwise the
    /// first response fixes the session ETag. Must be called within a tokio
    /// runtime.
    pub fn new(
        getter: Arc<dyn RangeGetter>,
        range: HttpRange,
        expected_etag: Option<String>,
        buffer_count: usize,
        opts: ReaderOptions,
    ) -> Result<Self> {
        Self::start(getter, range, expected_etag, buffer_count, opts, None)
    }

    /// Like [`new`](Self::new), reusing an already issued first response
    pub fn with_response(
        getter: Arc<dyn RangeGetter>,
        range: HttpRange,
        expected_etag: Option<String>,
        buffer_count: usize,
        opts: ReaderOptions,
        response: GetRangeOutput,
    ) -> Result<Self> {
        Self::start(getter, range, expected_etag, buffer_count, opts, Some(response))
    }

    fn start(
        getter: Arc<dyn RangeGetter>,
        range: HttpRange,
        expected_etag: Option<String>,
        buffer_count: usize,
        opts: ReaderOptions,
        initial: Option<GetRangeOutput>,
    ) -> Result<Self> {
        if buffer_count == 0 {
            return Err(TransferError::new(
                &opts.path,
                TransferCause::Parameter("buffer count must be at least 1".to_string()),
            ));
        }
        if opts.initial_buffer_size == 0 || opts.max_buffer_size < opts.initial_buffer_size {
            return Err(TransferError::new(
                &opts.path,
                TransferCause::Parameter(format!(
                    "buffer sizes must satisfy 0 < initial ({}) <= max ({})",
                    opts.initial_buffer_size, opts.max_buffer_size
                )),
            ));
        }

        let cancel = opts.cancel.child_token();
        let session_etag = Arc::new(OnceLock::new());
        if let Some(etag) = &expected_etag {
            let _ = session_etag.set(etag.clone());
        }

        // One extra slot for the failure message
        let (tx, rx) = mpsc::channel(buffer_count + 1);
        let prefetcher = Prefetcher {
            getter,
            pool: opts.pool.clone(),
            permits: Arc::new(Semaphore::new(buffer_count)),
            ready: tx,
            cancel: cancel.clone(),
            cursor: RangeCursor::new(range, expected_etag),
            initial,
            body: None,
            filling: None,
            session_etag: session_etag.clone(),
            buffer_size: opts.initial_buffer_size,
            max_buffer_size: opts.max_buffer_size,
        };

        debug!(path = %opts.path, range = %range, buffer_count, "Starting range reader");
        let task = tokio::spawn(prefetcher.run());

        Ok(Self {
            path: opts.path,
            requested: range,
            ready: rx,
            current: None,
            pool: opts.pool,
            cancel,
            task: Some(task),
            session_etag,
            delivered: 0,
            hasher: Crc64Hasher::new(),
            failed: None,
            closed: false,
        })
    }

    /// Bytes delivered to the consumer so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Running CRC-64 of the delivered bytes
    pub fn crc64(&self) -> u64 {
        self.hasher.value()
    }

    /// Session ETag, once known
    pub fn etag(&self) -> Option<&str> {
        self.session_etag.get().map(String::as_str)
    }

    pub fn range(&self) -> HttpRange {
        self.requested
    }

    /// Stop prefetching, return buffers to the pool and wait for the
    /// background task so the active body is released. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.shutdown();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    return Err(self.error(TransferCause::Internal(format!(
                        "prefetch task panicked: {}",
                        e
                    ))));
                }
            }
            // Anything sent before the task exited
            self.drain();
        }
        Ok(())
    }

    /// Stop prefetching and release buffers without waiting for the task
    pub fn abandon(&mut self) {
        if !self.closed {
            self.shutdown();
        }
        self.task = None;
    }

    fn shutdown(&mut self) {
        self.closed = true;
        self.cancel.cancel();
        self.ready.close();
        self.recycle_current();
        self.drain();
    }

    fn drain(&mut self) {
        while let Ok(chunk) = self.ready.try_recv() {
            if let Chunk::Data(filled) = chunk {
                self.pool.release(filled.buf);
            }
        }
    }

    fn recycle_current(&mut self) {
        if let Some(filled) = self.current.take() {
            self.pool.release(filled.buf);
        }
    }

    fn error(&self, cause: TransferCause) -> TransferError {
        TransferError::new(&self.path, cause)
    }

    fn requested_complete(&self) -> bool {
        self.requested
            .count
            .is_some_and(|count| self.delivered >= count)
    }
}

impl AsyncRead for AsyncRangeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Some(cause) = &this.failed {
            return Poll::Ready(Err(this.error(cause.clone()).into()));
        }
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "range reader is closed",
            )));
        }
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some(filled) = this.current.as_mut() {
                let available = filled.buf.len() - filled.pos;
                if available > 0 {
                    let n = available.min(out.remaining());
                    let chunk = &filled.buf[filled.pos..filled.pos + n];
                    out.put_slice(chunk);
                    this.hasher.update(chunk);
                    filled.pos += n;
                    this.delivered += n as u64;

                    if filled.pos == filled.buf.len() {
                        this.recycle_current();
                    }
                    return Poll::Ready(Ok(()));
                }
                this.recycle_current();
            }

            // EOF once the requested count is delivered
            if this.requested_complete() {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.ready.poll_recv(cx)) {
                Some(Chunk::Data(filled)) => this.current = Some(filled),
                Some(Chunk::Failed(cause)) => {
                    this.failed = Some(cause.clone());
                    this.abandon();
                    return Poll::Ready(Err(this.error(cause).into()));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl Drop for AsyncRangeReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AsyncRangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRangeReader")
            .field("path", &self.path)
            .field("requested", &self.requested)
            .field("delivered", &self.delivered)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecResult;
    use crate::executor::{GetRangeOutput, HttpRange};
    use crate::memory::MemoryStore;
    use crate::download::ObjectRangeGetter;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_opts() -> ReaderOptions {
        ReaderOptions {
            initial_buffer_size: 16,
            max_buffer_size: 64,
            ..Default::default()
        }
    }

    fn object(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    /// Getter that records requested ranges
    struct Recording {
        data: Vec<u8>,
        ranges: parking_lot::Mutex<Vec<HttpRange>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RangeGetter for Recording {
        async fn get_range(&self, range: HttpRange) -> ExecResult<GetRangeOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ranges.lock().push(range);
            let size = self.data.len() as u64;
            let end = range.end().unwrap_or(size).min(size);
            let body = self.data[range.offset as usize..end as usize].to_vec();
            Ok(GetRangeOutput {
                start: range.offset,
                content_length: body.len() as u64,
                object_size: size,
                etag: "\"e1\"".to_string(),
                version_id: None,
                hash_crc64: None,
                body: Box::new(Cursor::new(body)),
            })
        }
    }

    /// Pool that records acquire sizes and counts releases
    #[derive(Default)]
    struct CountingPool {
        acquired: parking_lot::Mutex<Vec<usize>>,
        released: AtomicUsize,
    }

    impl BufferPool for CountingPool {
        fn acquire(&self, size: usize) -> BytesMut {
            self.acquired.lock().push(size);
            BytesMut::with_capacity(size)
        }

        fn release(&self, _buffer: BytesMut) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Body that yields its head and then never completes
    struct StallingBody {
        head: Option<Vec<u8>>,
        drops: Arc<AtomicUsize>,
    }

    impl AsyncRead for StallingBody {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            out: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.head.take() {
                Some(head) => {
                    out.put_slice(&head);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Pending,
            }
        }
    }

    impl Drop for StallingBody {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Stalling {
        drops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RangeGetter for Stalling {
        async fn get_range(&self, range: HttpRange) -> ExecResult<GetRangeOutput> {
            Ok(GetRangeOutput {
                start: range.offset,
                content_length: 1000,
                object_size: 1000,
                etag: "\"e1\"".to_string(),
                version_id: None,
                hash_crc64: None,
                body: Box::new(StallingBody {
                    head: Some(vec![7u8; 8]),
                    drops: self.drops.clone(),
                }),
            })
        }
    }

    fn recording(data: Vec<u8>) -> Arc<Recording> {
        Arc::new(Recording {
            data,
            ranges: Default::default(),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_buffers_double_up_to_max_and_respect_buffer_count() {
        let pool = Arc::new(CountingPool::default());
        let data = object(1000);
        let opts = ReaderOptions {
            pool: pool.clone(),
            ..small_opts()
        };

        let mut reader =
            AsyncRangeReader::new(recording(data.clone()), HttpRange::full(), None, 2, opts).unwrap();

        // Without a consumer the prefetcher stops at buffer_count buffers
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*pool.acquired.lock(), vec![16, 32]);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(pool.acquired.lock()[..4], [16, 32, 64, 64]);

        reader.close().await.unwrap();
        assert_eq!(
            pool.released.load(Ordering::SeqCst),
            pool.acquired.lock().len()
        );
    }

    #[tokio::test]
    async fn test_abandon_returns_buffers_and_fails_reads() {
        let pool = Arc::new(SharedBufferPool::new(8));
        let opts = ReaderOptions {
            pool: pool.clone(),
            ..small_opts()
        };

        let mut reader =
            AsyncRangeReader::new(recording(object(4096)), HttpRange::full(), None, 4, opts).unwrap();
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        reader.abandon();
        // The partly read buffer plus three queued ones
        assert_eq!(pool.available(), 4);

        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_close_drops_body_once_and_recycles_partial_buffer() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(CountingPool::default());
        let opts = ReaderOptions {
            pool: pool.clone(),
            ..small_opts()
        };

        let getter = Arc::new(Stalling {
            drops: drops.clone(),
        });
        let mut reader = AsyncRangeReader::new(getter, HttpRange::full(), None, 1, opts).unwrap();

        // Let the prefetcher stall halfway through its first buffer
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*pool.acquired.lock(), vec![16]);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        reader.close().await.unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(pool.released.load(Ordering::SeqCst), 1);

        reader.close().await.unwrap();
        drop(reader);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_buffer_count_rejected() {
        let getter = Arc::new(Recording {
            data: object(10),
            ranges: Default::default(),
            calls: AtomicUsize::new(0),
        });
        let err = AsyncRangeReader::new(getter.clone(), HttpRange::full(), None, 0, small_opts())
            .unwrap_err();
        assert!(matches!(err.cause(), TransferCause::Parameter(_)));
        assert_eq!(getter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reads_whole_range_with_one_fetch() {
        let data = object(1000);
        let getter = Arc::new(Recording {
            data: data.clone(),
            ranges: Default::default(),
            calls: AtomicUsize::new(0),
        });

        let mut reader =
            AsyncRangeReader::new(getter.clone(), HttpRange::new(10, Some(500)), None, 2, small_opts())
                .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, &data[10..510]);
        assert_eq!(reader.delivered(), 500);
        assert_eq!(reader.crc64(), crate::checksum::crc64(&data[10..510]));
        assert_eq!(reader.etag(), Some("\"e1\""));
        assert_eq!(getter.calls.load(Ordering::SeqCst), 1);
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_range_past_object_end_is_clamped() {
        let data = object(100);
        let getter = Arc::new(Recording {
            data: data.clone(),
            ranges: Default::default(),
            calls: AtomicUsize::new(0),
        });

        let mut reader =
            AsyncRangeReader::new(getter, HttpRange::new(90, Some(50)), None, 1, small_opts())
                .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[90..]);
    }

    #[tokio::test]
    async fn test_short_bodies_are_reopened_at_cursor() {
        let store = Arc::new(MemoryStore::new());
        let data = object(300);
        store.insert_object("b", "k", data.clone());
        store.short_bodies(40);

        let getter = Arc::new(ObjectRangeGetter::new(store.clone(), "b", "k", None));
        let mut reader =
            AsyncRangeReader::new(getter, HttpRange::full(), None, 4, small_opts()).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        // 300 bytes in 40-byte bodies
        assert_eq!(store.calls().get_range, 8);
    }

    #[tokio::test]
    async fn test_offset_mismatch_stops_delivery() {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("b", "k", object(200));
        store.short_bodies(50);
        store.skew_range_start(3);

        let getter = Arc::new(ObjectRangeGetter::new(store, "b", "k", None));
        let mut reader =
            AsyncRangeReader::new(getter, HttpRange::full(), None, 1, small_opts()).unwrap();

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        let transfer = TransferError::from_io(&err).unwrap();
        assert!(matches!(
            transfer.integrity_error(),
            Some(IntegrityError::OffsetMismatch {
                expected: 50,
                actual: 53
            })
        ));
        assert_eq!(out.len(), 50);

        // Sticky failure
        let mut more = [0u8; 8];
        assert!(reader.read(&mut more).await.is_err());
    }

    #[tokio::test]
    async fn test_expected_etag_enforced_on_first_fetch() {
        let getter = Arc::new(Recording {
            data: object(10),
            ranges: Default::default(),
            calls: AtomicUsize::new(0),
        });
        let mut reader = AsyncRangeReader::new(
            getter,
            HttpRange::full(),
            Some("\"other\"".to_string()),
            2,
            small_opts(),
        )
        .unwrap();

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_empty_object_reads_eof() {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("b", "k", Vec::new());

        let getter = Arc::new(ObjectRangeGetter::new(store, "b", "k", None));
        let mut reader =
            AsyncRangeReader::new(getter, HttpRange::full(), None, 2, small_opts()).unwrap();
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_returns_buffers() {
        let pool = Arc::new(SharedBufferPool::new(8));
        let getter = Arc::new(Recording {
            data: object(4096),
            ranges: Default::default(),
            calls: AtomicUsize::new(0),
        });
        let opts = ReaderOptions {
            pool: pool.clone(),
            ..small_opts()
        };

        let mut reader = AsyncRangeReader::new(getter, HttpRange::full(), None, 4, opts).unwrap();
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.unwrap();

        reader.close().await.unwrap();
        reader.close().await.unwrap();
        assert!(pool.available() > 0);
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_fails_reads() {
        let getter = Arc::new(Recording {
            data: object(4096),
            ranges: Default::default(),
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let opts = ReaderOptions {
            cancel: cancel.clone(),
            initial_buffer_size: 16,
            max_buffer_size: 16,
            ..Default::default()
        };

        let mut reader = AsyncRangeReader::new(getter, HttpRange::full(), None, 1, opts).unwrap();
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(TransferError::from_io(&err).unwrap().is_cancelled());
    }
}
