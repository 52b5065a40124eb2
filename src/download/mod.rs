//! Prefetching ranged downloads

mod buffer_pool;
mod downloader;
mod range;
mod reader;

pub use buffer_pool::{BufferPool, SharedBufferPool};
pub use downloader::{DownloadResult, Downloader, ObjectInfo, ObjectReader};
pub use range::{ObjectRangeGetter, RangeGetter};
pub use reader::{AsyncRangeReader, ReaderOptions};

use tokio_util::sync::CancellationToken;

use crate::progress::ProgressReporter;

/// Buffers in flight per reader
pub const DEFAULT_BUFFER_COUNT: usize = 4;

/// First prefetch buffer size
pub const DEFAULT_INITIAL_BUFFER_SIZE: usize = 512 * 1024;

/// Prefetch buffer size cap
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Per-call download options. Unset values fall back to [`TransferConfig`](crate::config::TransferConfig).
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub buffer_count: Option<usize>,
    pub initial_buffer_size: Option<usize>,
    pub max_buffer_size: Option<usize>,
    /// Read this version instead of the current one
    pub version_id: Option<String>,
    /// Fail unless the object carries this ETag
    pub expected_etag: Option<String>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressReporter>,
}

impl DownloadOptions {
    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = Some(buffer_count);
        self
    }

    pub fn with_buffer_sizes(mut self, initial: usize, max: usize) -> Self {
        self.initial_buffer_size = Some(initial);
        self.max_buffer_size = Some(max);
        self
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_expected_etag(mut self, etag: impl Into<String>) -> Self {
        self.expected_etag = Some(etag.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }
}
