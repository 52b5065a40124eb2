/*!
 * Orbit Transfer - concurrent large-object transfer engine
 *
 * Moves large objects to and from object storage:
 * - Multipart uploads with bounded parallelism and first-error-wins abort
 * - Single-PUT fast path for objects that fit in one part
 * - Prefetching ranged reads with soft-start buffer sizing
 * - End-to-end CRC-64 verification across independently issued requests
 *
 * Network calls go through a [`RequestExecutor`], which owns signing,
 * marshaling and transport retry.
 */

pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod executor;
pub mod logging;
pub mod memory;
pub mod progress;
pub mod upload;

// Re-export commonly used types
pub use checksum::{crc64, crc64_combine, ChecksumAccumulator, Crc64Hasher};
pub use config::{LogConfig, LogLevel, TransferConfig};
pub use download::{AsyncRangeReader, DownloadOptions, Downloader, ObjectReader};
pub use error::{
    ExecError, IntegrityError, ObjectPath, Result, ServiceError, TransferCause, TransferError,
};
pub use executor::{ContentRange, HttpRange, RequestExecutor};
pub use memory::MemoryStore;
pub use upload::{UploadOptions, UploadResult, UploadSource, Uploader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
