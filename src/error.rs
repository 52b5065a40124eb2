/*!
 * Error types for transfer operations
 *
 * Every failure surfaced by the uploader or the range reader is a
 * [`TransferError`]: the logical object path, the multipart upload id when one
 * is known, and the primary [`TransferCause`]. The cause chain ends in typed
 * errors ([`ServiceError`], [`IntegrityError`]) so callers can inspect status
 * and error codes with `downcast_ref` instead of matching on strings.
 */

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Result type alias for calls made through a [`RequestExecutor`](crate::executor::RequestExecutor)
pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Non-2xx response with a parsed error code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("service error {status} ({code}): {message}")]
pub struct ServiceError {
    /// HTTP status code
    pub status: u16,

    /// Service error code (e.g. `NoSuchUpload`)
    pub code: String,

    /// Human readable message returned by the service
    pub message: String,

    /// Request id echoed by the service, if any
    pub request_id: Option<String>,
}

impl ServiceError {
    /// Create a service error without a request id
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach the request id echoed by the service
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Data consistency violations. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// A ranged fetch did not start where the previous one ended
    #[error("range starts at offset {actual}, expected {expected}")]
    OffsetMismatch { expected: u64, actual: u64 },

    /// The object was replaced between two fetches of the same read session
    #[error("object changed during read: ETag {actual}, expected {expected}")]
    EtagMismatch { expected: String, actual: String },

    /// The source needs more parts than a multipart upload allows
    #[error("source needs more than {max} parts")]
    PartCountExceeded { max: u32 },

    /// Client computed checksum differs from the one echoed by the service
    #[error("CRC64 mismatch: client {client}, server {server}")]
    Crc64Mismatch { client: u64, server: u64 },

    /// Fewer parts completed than the plan dispatched
    #[error("{actual} of {expected} parts completed")]
    PartsIncomplete { expected: u32, actual: u32 },

    /// A source or body ended before the announced length
    #[error("unexpected end of data at offset {offset}")]
    UnexpectedEof { offset: u64 },
}

/// Errors returned by the request executor seam
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Transport failure after the executor exhausted its retry budget
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-2xx status
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The executor observed cancellation of the call
    #[error("request cancelled")]
    Cancelled,
}

/// Primary cause of a failed transfer
#[derive(Debug, Clone, Error)]
pub enum TransferCause {
    /// Bad arguments, detected before any network call
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// Transport failure surfaced by the executor
    #[error("transport error: {0}")]
    Transport(String),

    /// Service rejected a request
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Offset, ETag, checksum or part count violation
    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    /// The caller cancelled the transfer
    #[error("transfer cancelled")]
    Cancelled,

    /// Reading the upload source or writing a download target failed
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A worker task panicked
    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferCause {
    /// The service error behind this cause, if any
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            TransferCause::Service(e) => Some(e),
            _ => None,
        }
    }

    /// The integrity violation behind this cause, if any
    pub fn integrity_error(&self) -> Option<&IntegrityError> {
        match self {
            TransferCause::Integrity(e) => Some(e),
            _ => None,
        }
    }

    /// True if the caller cancelled the transfer
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferCause::Cancelled)
    }
}

impl From<ExecError> for TransferCause {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Transport(msg) => TransferCause::Transport(msg),
            ExecError::Service(e) => TransferCause::Service(e),
            ExecError::Cancelled => TransferCause::Cancelled,
        }
    }
}

impl From<io::Error> for TransferCause {
    fn from(err: io::Error) -> Self {
        TransferCause::Io(Arc::new(err))
    }
}

/// Logical name of an object: `scheme://bucket/key[?versionId=..]`
///
/// Only used to label errors and log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl ObjectPath {
    pub fn new(scheme: impl Into<String>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
        }
    }

    pub fn with_version(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)?;
        if let Some(version) = &self.version_id {
            write!(f, "?versionId={}", version)?;
        }
        Ok(())
    }
}

/// Error returned by every upload and download entry point
#[derive(Debug, Error)]
#[error("transfer of {path}{} failed: {cause}", upload_suffix(.upload_id))]
pub struct TransferError {
    path: String,
    upload_id: Option<String>,
    #[source]
    cause: TransferCause,
    abort_error: Option<TransferCause>,
}

fn upload_suffix(upload_id: &Option<String>) -> String {
    match upload_id {
        Some(id) => format!(" (upload id {})", id),
        None => String::new(),
    }
}

impl TransferError {
    pub fn new(path: impl ToString, cause: impl Into<TransferCause>) -> Self {
        Self {
            path: path.to_string(),
            upload_id: None,
            cause: cause.into(),
            abort_error: None,
        }
    }

    /// Record the multipart upload id known at the time of failure
    pub fn with_upload_id(mut self, upload_id: Option<String>) -> Self {
        self.upload_id = upload_id;
        self
    }

    /// Attach the failure of a compensating abort. The primary cause is kept.
    pub fn with_abort_error(mut self, abort_error: TransferCause) -> Self {
        self.abort_error = Some(abort_error);
        self
    }

    /// Logical object path, `scheme://bucket/key`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Multipart upload id, empty for the single-PUT path or an Initiate failure
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn cause(&self) -> &TransferCause {
        &self.cause
    }

    /// Failure of the best-effort abort issued after a part failure
    pub fn abort_error(&self) -> Option<&TransferCause> {
        self.abort_error.as_ref()
    }

    pub fn service_error(&self) -> Option<&ServiceError> {
        self.cause.service_error()
    }

    pub fn integrity_error(&self) -> Option<&IntegrityError> {
        self.cause.integrity_error()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause.is_cancelled()
    }

    /// Recover a `TransferError` carried inside an `io::Error` returned by a reader
    pub fn from_io(err: &io::Error) -> Option<&TransferError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<TransferError>())
    }
}

impl From<TransferError> for io::Error {
    fn from(err: TransferError) -> Self {
        let kind = match err.cause() {
            TransferCause::Cancelled => io::ErrorKind::Interrupted,
            TransferCause::Integrity(_) => io::ErrorKind::InvalidData,
            TransferCause::Parameter(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_object_path_display() {
        let path = ObjectPath::new("oss", "bucket", "dir/key.bin");
        assert_eq!(path.to_string(), "oss://bucket/dir/key.bin");

        let versioned = path.with_version(Some("v1".to_string()));
        assert_eq!(versioned.to_string(), "oss://bucket/dir/key.bin?versionId=v1");
    }

    #[test]
    fn test_error_display_includes_upload_id() {
        let err = TransferError::new("oss://b/k", TransferCause::Cancelled)
            .with_upload_id(Some("abc".to_string()));
        assert_eq!(
            err.to_string(),
            "transfer of oss://b/k (upload id abc) failed: transfer cancelled"
        );

        let err = TransferError::new("oss://b/k", TransferCause::Parameter("bucket".into()));
        assert_eq!(
            err.to_string(),
            "transfer of oss://b/k failed: invalid parameter: bucket"
        );
    }

    #[test]
    fn test_service_error_reachable_through_source_chain() {
        let service = ServiceError::new(403, "AccessDenied", "denied").with_request_id("req-1");
        let err = TransferError::new(
            "oss://b/k",
            TransferCause::from(ExecError::Service(service.clone())),
        );

        // Walk the standard chain without string matching
        let mut found = None;
        let mut current: Option<&(dyn std::error::Error + 'static)> = err.source();
        while let Some(e) = current {
            if let Some(s) = e.downcast_ref::<ServiceError>() {
                found = Some(s.clone());
                break;
            }
            current = e.source();
        }

        assert_eq!(found, Some(service.clone()));
        assert_eq!(err.service_error(), Some(&service));
    }

    #[test]
    fn test_abort_error_does_not_replace_cause() {
        let err = TransferError::new(
            "oss://b/k",
            TransferCause::Service(ServiceError::new(500, "InternalError", "boom")),
        )
        .with_upload_id(Some("u1".to_string()))
        .with_abort_error(TransferCause::Transport("connection reset".into()));

        assert_eq!(err.service_error().map(|e| e.code.as_str()), Some("InternalError"));
        assert!(matches!(err.abort_error(), Some(TransferCause::Transport(_))));
        assert_eq!(err.upload_id(), Some("u1"));
    }

    #[test]
    fn test_exec_error_conversion() {
        assert!(TransferCause::from(ExecError::Cancelled).is_cancelled());
        assert!(matches!(
            TransferCause::from(ExecError::Transport("reset".into())),
            TransferCause::Transport(_)
        ));
    }

    #[test]
    fn test_io_roundtrip_keeps_transfer_error() {
        let err = TransferError::new(
            "oss://b/k",
            IntegrityError::EtagMismatch {
                expected: "a".into(),
                actual: "b".into(),
            },
        );
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let inner = TransferError::from_io(&io_err).expect("transfer error inside");
        assert!(matches!(
            inner.integrity_error(),
            Some(IntegrityError::EtagMismatch { .. })
        ));
    }
}
