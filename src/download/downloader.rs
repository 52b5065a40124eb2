//! Object downloads over the prefetching range reader

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{debug, error, info};

use super::buffer_pool::{BufferPool, SharedBufferPool};
use super::range::{ObjectRangeGetter, RangeGetter};
use super::reader::{AsyncRangeReader, ReaderOptions};
use super::DownloadOptions;
use crate::config::TransferConfig;
use crate::error::{IntegrityError, ObjectPath, Result, TransferCause, TransferError};
use crate::executor::{cancellable, ContentRange, HttpRange, RequestExecutor};
use crate::progress::{ProgressReporter, TransferDirection};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata learned from the first ranged GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub etag: String,
    pub version_id: Option<String>,
    pub object_size: u64,
    /// `None` for an empty range
    pub content_range: Option<ContentRange>,
    /// Whole-object CRC-64 published by the service
    pub hash_crc64: Option<u64>,
}

/// Sequential reader over one object range
pub struct ObjectReader {
    path: String,
    info: ObjectInfo,
    reader: AsyncRangeReader,
}

impl ObjectReader {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// `bytes start-end/total` of the first response
    pub fn content_range(&self) -> Option<ContentRange> {
        self.info.content_range
    }

    pub fn etag(&self) -> &str {
        &self.info.etag
    }

    /// Running CRC-64 of the bytes read so far
    pub fn crc64(&self) -> u64 {
        self.reader.crc64()
    }

    pub fn delivered(&self) -> u64 {
        self.reader.delivered()
    }

    pub async fn close(&mut self) -> Result<()> {
        self.reader.close().await
    }

    pub fn abandon(&mut self) {
        self.reader.abandon()
    }

    pub fn into_inner(self) -> AsyncRangeReader {
        self.reader
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("path", &self.path)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`Downloader::download_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub size: u64,
    /// CRC-64 of the bytes written
    pub hash_crc64: u64,
    pub etag: String,
    pub version_id: Option<String>,
}

/// Opens prefetching readers over objects; readers share one buffer pool
#[derive(Clone)]
pub struct Downloader {
    executor: Arc<dyn RequestExecutor>,
    config: TransferConfig,
    pool: Arc<dyn BufferPool>,
}

impl Downloader {
    pub fn new(executor: Arc<dyn RequestExecutor>, config: TransferConfig) -> Self {
        let pool = Arc::new(SharedBufferPool::new(config.prefetch_buffers * 2));
        Self {
            executor,
            config,
            pool,
        }
    }

    /// Replace the buffer pool
    pub fn with_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Issue the first ranged GET and return a reader over `range`
    #[tracing::instrument(skip_all, fields(bucket = %bucket, key = %key, range = %range))]
    pub async fn open(
        &self,
        bucket: &str,
        key: &str,
        range: HttpRange,
        opts: DownloadOptions,
    ) -> Result<ObjectReader> {
        let path = ObjectPath::new(&self.config.scheme, bucket, key)
            .with_version(opts.version_id.clone());
        if bucket.is_empty() || key.is_empty() {
            return Err(TransferError::new(
                &path,
                TransferCause::Parameter("bucket and key must not be empty".to_string()),
            ));
        }

        let buffer_count = opts.buffer_count.unwrap_or(self.config.prefetch_buffers);
        if buffer_count == 0 {
            return Err(TransferError::new(
                &path,
                TransferCause::Parameter("buffer count must be at least 1".to_string()),
            ));
        }

        let getter = ObjectRangeGetter::new(
            self.executor.clone(),
            bucket,
            key,
            opts.version_id.clone(),
        );
        let first = cancellable(&opts.cancel, getter.get_range(range))
            .await
            .map_err(|e| TransferError::new(&path, e))?;

        if first.start != range.offset {
            return Err(TransferError::new(
                &path,
                IntegrityError::OffsetMismatch {
                    expected: range.offset,
                    actual: first.start,
                },
            ));
        }
        if let Some(expected) = &opts.expected_etag {
            if *expected != first.etag {
                return Err(TransferError::new(
                    &path,
                    IntegrityError::EtagMismatch {
                        expected: expected.clone(),
                        actual: first.etag.clone(),
                    },
                ));
            }
        }

        let info = ObjectInfo {
            etag: first.etag.clone(),
            version_id: first.version_id.clone(),
            object_size: first.object_size,
            content_range: first.content_range(),
            hash_crc64: first.hash_crc64,
        };
        debug!(
            path = %path,
            etag = %info.etag,
            size = info.object_size,
            content_range = ?info.content_range.map(|r| r.to_string()),
            "Opened object"
        );

        // Later fetches must see the same version
        let getter = getter.with_version(info.version_id.clone().or(opts.version_id.clone()));
        let reader_opts = ReaderOptions {
            path: path.to_string(),
            initial_buffer_size: opts
                .initial_buffer_size
                .unwrap_or(self.config.initial_buffer_size),
            max_buffer_size: opts.max_buffer_size.unwrap_or(self.config.max_buffer_size),
            pool: self.pool.clone(),
            cancel: opts.cancel.clone(),
        };
        let reader = AsyncRangeReader::with_response(
            Arc::new(getter),
            range,
            Some(info.etag.clone()),
            buffer_count,
            reader_opts,
            first,
        )?;

        Ok(ObjectReader {
            path: path.to_string(),
            info,
            reader,
        })
    }

    /// Download a whole object into `dest`
    ///
    /// Bytes go to a temporary file beside `dest`, which replaces `dest` only
    /// after the size and CRC-64 check out.
    pub async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        dest: impl AsRef<Path>,
        opts: DownloadOptions,
    ) -> Result<DownloadResult> {
        let dest = dest.as_ref();
        let progress = opts.progress.clone();
        let started = Instant::now();

        let tmp = temp_path(dest).ok_or_else(|| {
            TransferError::new(
                dest.display(),
                TransferCause::Parameter("destination has no file name".to_string()),
            )
        })?;

        let mut reader = self.open(bucket, key, HttpRange::full(), opts).await?;
        let path = reader.path().to_string();
        let size = reader.info().object_size;
        if let Some(progress) = &progress {
            progress.transfer_started(&path, Some(size), TransferDirection::Download);
        }

        let written = write_object(&mut reader, &tmp, progress.as_ref()).await;
        let closed = reader.close().await;

        let outcome = written
            .and_then(|written| {
                closed.map_err(|e| e.cause().clone())?;
                self.verify(&reader, written)
            });

        let written = match outcome {
            Ok(written) => written,
            Err(cause) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                let err = TransferError::new(&path, cause);
                error!(path = %path, error = %err, "Download failed");
                if let Some(progress) = &progress {
                    progress.transfer_failed(&path, err.to_string(), reader.delivered());
                }
                return Err(err);
            }
        };

        if let Err(e) = tokio::fs::rename(&tmp, dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(TransferError::new(&path, e));
        }

        info!(
            path = %path,
            dest = %dest.display(),
            size = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Download completed"
        );
        if let Some(progress) = &progress {
            progress.transfer_completed(&path, written, started.elapsed());
        }

        Ok(DownloadResult {
            size: written,
            hash_crc64: reader.crc64(),
            etag: reader.etag().to_string(),
            version_id: reader.info().version_id.clone(),
        })
    }

    fn verify(&self, reader: &ObjectReader, written: u64) -> std::result::Result<u64, TransferCause> {
        let info = reader.info();
        if written != info.object_size {
            return Err(IntegrityError::UnexpectedEof { offset: written }.into());
        }
        if self.config.verify_crc64 {
            if let Some(server) = info.hash_crc64 {
                let client = reader.crc64();
                if client != server {
                    return Err(IntegrityError::Crc64Mismatch { client, server }.into());
                }
            }
        }
        Ok(written)
    }
}

fn temp_path(dest: &Path) -> Option<PathBuf> {
    let name = dest.file_name()?.to_string_lossy();
    Some(dest.with_file_name(format!(".{}.orbit-part", name)))
}

async fn write_object(
    reader: &mut ObjectReader,
    tmp: &Path,
    progress: Option<&ProgressReporter>,
) -> std::result::Result<u64, TransferCause> {
    let mut file = tokio::fs::File::create(tmp).await?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let total = Some(reader.info().object_size);
    let mut written = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => return Err(cause_from_io(e)),
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        written += n as u64;
        if let Some(progress) = progress {
            progress.progress(reader.path(), written, total);
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Unwrap a transfer failure carried through `io::Error`
fn cause_from_io(err: io::Error) -> TransferCause {
    if let Some(inner) = TransferError::from_io(&err) {
        return inner.cause().clone();
    }
    TransferCause::from(err)
}
