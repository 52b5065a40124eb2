/*!
 * Request executor seam
 *
 * The engine never builds HTTP requests itself. Every network call goes
 * through a [`RequestExecutor`], which owns signing, marshaling, endpoint
 * resolution and transport-level retry. Implementations return typed
 * outputs and classify failures as [`ExecError`].
 */

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecError, ExecResult};

/// Response body of a ranged GET
pub type BodyStream = Box<dyn AsyncRead + Send + Unpin>;

/// Byte range `[offset, offset + count)`; `count == None` reads to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HttpRange {
    pub offset: u64,
    pub count: Option<u64>,
}

impl HttpRange {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }

    /// The whole object
    pub fn full() -> Self {
        Self::default()
    }

    /// Exclusive end offset, if bounded
    pub fn end(&self) -> Option<u64> {
        self.count.map(|c| self.offset + c)
    }

    /// `Range` header value, `None` when the whole object is requested
    pub fn header_value(&self) -> Option<String> {
        match self.count {
            None if self.offset == 0 => None,
            None => Some(format!("bytes={}-", self.offset)),
            Some(0) => Some(format!("bytes={}-{}", self.offset, self.offset)),
            Some(count) => Some(format!("bytes={}-{}", self.offset, self.offset + count - 1)),
        }
    }
}

impl fmt::Display for HttpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.count {
            Some(count) => write!(f, "[{}, {})", self.offset, self.offset + count),
            None => write!(f, "[{}, end)", self.offset),
        }
    }
}

/// Parsed `Content-Range` value, `bytes start-end/total` with an inclusive end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// Object size, `None` when the service answered `*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Range covering `len` bytes from `start`; `None` for an empty range
    pub fn from_len(start: u64, len: u64, total: Option<u64>) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            start,
            end: start + len - 1,
            total,
        })
    }

    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes ")?;
        let (span, total) = rest.split_once('/')?;
        let (start, end) = span.split_once('-')?;

        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if end < start {
            return None;
        }

        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };

        Some(Self { start, end, total })
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.start, self.end, total),
            None => write!(f, "bytes {}-{}/*", self.start, self.end),
        }
    }
}

/// Single PUT of a whole object
#[derive(Debug, Clone, Default)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Client-side CRC-64 of `body`
    pub content_crc64: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub etag: String,
    pub version_id: Option<String>,
    /// CRC-64 echoed by the service
    pub hash_crc64: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct InitiateMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadPartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// 1-based part number
    pub part_number: u32,
    pub body: Bytes,
    pub content_crc64: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPartOutput {
    pub etag: String,
    pub hash_crc64: Option<u64>,
}

/// A stored part, as listed in the Complete request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    /// Client-side CRC-64 of the part payload
    pub crc64: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// Sorted ascending by part number
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteMultipartOutput {
    pub etag: String,
    pub version_id: Option<String>,
    pub hash_crc64: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct AbortMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct GetRangeRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub range: HttpRange,
}

/// Headers and body of a ranged GET
pub struct GetRangeOutput {
    /// First byte offset actually returned
    pub start: u64,
    /// Bytes in this response body
    pub content_length: u64,
    /// Size of the whole object
    pub object_size: u64,
    pub etag: String,
    pub version_id: Option<String>,
    /// Whole-object CRC-64 published by the service
    pub hash_crc64: Option<u64>,
    pub body: BodyStream,
}

impl GetRangeOutput {
    /// `Content-Range` equivalent of this response
    pub fn content_range(&self) -> Option<ContentRange> {
        ContentRange::from_len(self.start, self.content_length, Some(self.object_size))
    }
}

impl fmt::Debug for GetRangeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetRangeOutput")
            .field("start", &self.start)
            .field("content_length", &self.content_length)
            .field("object_size", &self.object_size)
            .field("etag", &self.etag)
            .field("version_id", &self.version_id)
            .field("hash_crc64", &self.hash_crc64)
            .finish_non_exhaustive()
    }
}

/// Signed request executor
///
/// Calls may be cancelled by dropping the returned future; implementations
/// must tolerate that at any await point.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn put_object(&self, request: PutObjectRequest) -> ExecResult<PutObjectOutput>;

    /// Returns the new upload id
    async fn initiate_multipart_upload(
        &self,
        request: InitiateMultipartRequest,
    ) -> ExecResult<String>;

    async fn upload_part(&self, request: UploadPartRequest) -> ExecResult<UploadPartOutput>;

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartRequest,
    ) -> ExecResult<CompleteMultipartOutput>;

    async fn abort_multipart_upload(&self, request: AbortMultipartRequest) -> ExecResult<()>;

    async fn get_range(&self, request: GetRangeRequest) -> ExecResult<GetRangeOutput>;
}

/// Race `fut` against `cancel`; the losing call is dropped
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> ExecResult<T>
where
    F: Future<Output = ExecResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecError::Cancelled),
        result = fut => result,
    }
}
