//! Multipart and single-PUT uploads
//!
//! [`Uploader`] plans the transfer with [`PartPlanner`], then either issues
//! one PUT or drives a multipart session through a bounded worker pool.
//!
//! ```no_run
//! use std::sync::Arc;
//! use orbit_transfer::config::TransferConfig;
//! use orbit_transfer::memory::MemoryStore;
//! use orbit_transfer::upload::{UploadOptions, UploadSource, Uploader};
//!
//! # async fn example() -> orbit_transfer::Result<()> {
//! let uploader = Uploader::new(Arc::new(MemoryStore::new()), TransferConfig::default());
//! let result = uploader
//!     .upload("bucket", "key", UploadSource::bytes(vec![0u8; 1024]), UploadOptions::default())
//!     .await?;
//! println!("crc64 {:x}", result.hash_crc64);
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod planner;
mod pool;
mod source;

pub use coordinator::{UploadState, Uploader};
pub use planner::{PartJob, PartPlanner, SourceDescriptor, TransferPlan};
pub use source::{SeekableRead, UploadSource};

use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressReporter;

/// Most parts a multipart upload may have
pub const MAX_PARTS: u32 = 10_000;

/// Smallest part size the planner scales to
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part the service accepts
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

pub const DEFAULT_PART_SIZE: u64 = MIN_PART_SIZE;

pub const DEFAULT_PARALLELISM: usize = 3;

/// Per-call upload options. Unset values fall back to [`TransferConfig`](crate::config::TransferConfig).
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub part_size: Option<u64>,
    pub parallelism: Option<usize>,
    /// Inferred from the file extension by `upload_file` when unset
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub leave_parts_on_error: Option<bool>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressReporter>,
}

impl UploadOptions {
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_leave_parts_on_error(mut self, leave: bool) -> Self {
        self.leave_parts_on_error = Some(leave);
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

/// Outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    /// Multipart upload id, `None` for the single-PUT path
    pub upload_id: Option<String>,
    pub etag: String,
    /// Whole-object CRC-64 computed on the client
    pub hash_crc64: u64,
    /// CRC-64 echoed by the service, if any
    pub server_crc64: Option<u64>,
    pub version_id: Option<String>,
    /// Bytes uploaded
    pub size: u64,
    /// Parts stored; 1 for the single-PUT path
    pub part_count: u32,
}
