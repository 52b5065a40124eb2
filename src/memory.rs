/*!
 * In-memory request executor
 *
 * `MemoryStore` implements the multipart protocol over objects held in
 * process memory. It records every call and can inject faults (failing
 * requests, per-part delays, ETag rotation, truncated bodies), which makes it
 * the executor of choice for tests and demos.
 */

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::time::Duration;

use crate::checksum::{crc64, ChecksumAccumulator};
use crate::error::{ExecError, ExecResult, ServiceError};
use crate::executor::{
    AbortMultipartRequest, CompleteMultipartOutput, CompleteMultipartRequest, GetRangeOutput,
    GetRangeRequest, InitiateMultipartRequest, PutObjectOutput, PutObjectRequest,
    RequestExecutor, UploadPartOutput, UploadPartRequest,
};

/// Number of calls made per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub put_object: usize,
    pub initiate: usize,
    pub upload_part: usize,
    pub complete: usize,
    pub abort: usize,
    pub get_range: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.put_object
            + self.initiate
            + self.upload_part
            + self.complete
            + self.abort
            + self.get_range
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    /// Payloads of the parts the object was assembled from
    parts: Vec<Bytes>,
    etag: String,
    version_id: String,
    content_type: Option<String>,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    metadata: BTreeMap<String, String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    initiate: Option<ExecError>,
    complete: Option<ExecError>,
    abort: Option<ExecError>,
    parts: HashMap<u32, ExecError>,
    part_delays: HashMap<u32, Duration>,
    /// Serve a different ETag once this many ranged GETs have been answered
    rotate_etag_after: Option<usize>,
    /// Added to the reported start offset of every ranged GET after the first
    start_skew: u64,
    /// Truncate every response body to this many bytes
    short_body: Option<usize>,
    corrupt_crc64: bool,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    calls: CallCounts,
    completed_part_numbers: Vec<Vec<u32>>,
    upload_ids: Vec<String>,
    next_id: u64,
    faults: Faults,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory object store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing the executor. Returns its ETag.
    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let mut state = self.state.lock();
        let id = state.next_id();
        let etag = format!("\"{:016x}-{}\"", crc64(&data), id);
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                parts: vec![data.clone()],
                data,
                etag: etag.clone(),
                version_id: format!("v{}", id),
                content_type: None,
                metadata: BTreeMap::new(),
            },
        );
        etag
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.with_object(bucket, key, |o| o.data.to_vec())
    }

    /// Part payloads of a completed object, in part order
    pub fn object_parts(&self, bucket: &str, key: &str) -> Option<Vec<Bytes>> {
        self.with_object(bucket, key, |o| o.parts.clone())
    }

    pub fn object_etag(&self, bucket: &str, key: &str) -> Option<String> {
        self.with_object(bucket, key, |o| o.etag.clone())
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.with_object(bucket, key, |o| o.content_type.clone())
            .flatten()
    }

    pub fn metadata(&self, bucket: &str, key: &str) -> Option<BTreeMap<String, String>> {
        self.with_object(bucket, key, |o| o.metadata.clone())
    }

    fn with_object<T>(&self, bucket: &str, key: &str, f: impl FnOnce(&StoredObject) -> T) -> Option<T> {
        let state = self.state.lock();
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(f)
    }

    /// Multipart uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// Every upload id handed out, in order
    pub fn upload_ids(&self) -> Vec<String> {
        self.state.lock().upload_ids.clone()
    }

    /// Part numbers of every Complete request, in the order received
    pub fn completed_part_numbers(&self) -> Vec<Vec<u32>> {
        self.state.lock().completed_part_numbers.clone()
    }

    pub fn fail_initiate(&self, error: impl Into<ExecError>) {
        self.state.lock().faults.initiate = Some(error.into());
    }

    pub fn fail_complete(&self, error: impl Into<ExecError>) {
        self.state.lock().faults.complete = Some(error.into());
    }

    pub fn fail_abort(&self, error: impl Into<ExecError>) {
        self.state.lock().faults.abort = Some(error.into());
    }

    /// Fail every upload of `part_number`
    pub fn fail_part(&self, part_number: u32, error: impl Into<ExecError>) {
        self.state.lock().faults.parts.insert(part_number, error.into());
    }

    /// Hold `part_number` for `delay` before storing it
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state.lock().faults.part_delays.insert(part_number, delay);
    }

    /// Change the served ETag after `gets` ranged GETs
    pub fn rotate_etag_after(&self, gets: usize) {
        self.state.lock().faults.rotate_etag_after = Some(gets);
    }

    /// Misreport the start offset of every ranged GET after the first
    pub fn skew_range_start(&self, delta: u64) {
        self.state.lock().faults.start_skew = delta;
    }

    /// Truncate response bodies to `limit` bytes
    pub fn short_bodies(&self, limit: usize) {
        self.state.lock().faults.short_body = Some(limit);
    }

    /// Echo wrong CRC-64 values
    pub fn corrupt_crc64(&self, corrupt: bool) {
        self.state.lock().faults.corrupt_crc64 = corrupt;
    }

    fn echo_crc(faults: &Faults, crc: u64) -> Option<u64> {
        Some(if faults.corrupt_crc64 { !crc } else { crc })
    }
}

fn check_digest(expected: Option<u64>, body: &[u8]) -> ExecResult<u64> {
    let actual = crc64(body);
    match expected {
        Some(expected) if expected != actual => Err(ServiceError::new(
            400,
            "InvalidDigest",
            format!("content CRC64 {} does not match {}", expected, actual),
        )
        .into()),
        _ => Ok(actual),
    }
}

fn no_such_upload(upload_id: &str) -> ExecError {
    ServiceError::new(
        404,
        "NoSuchUpload",
        format!("upload {} does not exist", upload_id),
    )
    .into()
}

#[async_trait]
impl RequestExecutor for MemoryStore {
    async fn put_object(&self, request: PutObjectRequest) -> ExecResult<PutObjectOutput> {
        let mut state = self.state.lock();
        state.calls.put_object += 1;

        let crc = check_digest(request.content_crc64, &request.body)?;
        let id = state.next_id();
        let etag = format!("\"{:016x}-{}\"", crc, id);
        let version_id = format!("v{}", id);

        state.objects.insert(
            (request.bucket, request.key),
            StoredObject {
                parts: vec![request.body.clone()],
                data: request.body,
                etag: etag.clone(),
                version_id: version_id.clone(),
                content_type: request.content_type,
                metadata: request.metadata,
            },
        );

        Ok(PutObjectOutput {
            etag,
            version_id: Some(version_id),
            hash_crc64: Self::echo_crc(&state.faults, crc),
        })
    }

    async fn initiate_multipart_upload(
        &self,
        request: InitiateMultipartRequest,
    ) -> ExecResult<String> {
        let mut state = self.state.lock();
        state.calls.initiate += 1;
        if let Some(err) = state.faults.initiate.clone() {
            return Err(err);
        }

        let upload_id = format!("upload-{}", state.next_id());
        state.upload_ids.push(upload_id.clone());
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: request.bucket,
                key: request.key,
                content_type: request.content_type,
                metadata: request.metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> ExecResult<UploadPartOutput> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.upload_part += 1;
            if let Some(err) = state.faults.parts.get(&request.part_number).cloned() {
                return Err(err);
            }
            state.faults.part_delays.get(&request.part_number).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let crc = check_digest(request.content_crc64, &request.body)?;
        let etag = format!("\"{:016x}\"", crc);
        let echoed = Self::echo_crc(&state.faults, crc);

        let upload = state
            .uploads
            .get_mut(&request.upload_id)
            .ok_or_else(|| no_such_upload(&request.upload_id))?;
        upload
            .parts
            .insert(request.part_number, (etag.clone(), request.body));

        Ok(UploadPartOutput {
            etag,
            hash_crc64: echoed,
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartRequest,
    ) -> ExecResult<CompleteMultipartOutput> {
        let mut state = self.state.lock();
        state.calls.complete += 1;
        state
            .completed_part_numbers
            .push(request.parts.iter().map(|p| p.part_number).collect());
        if let Some(err) = state.faults.complete.clone() {
            return Err(err);
        }

        let upload = state
            .uploads
            .remove(&request.upload_id)
            .ok_or_else(|| no_such_upload(&request.upload_id))?;

        let mut parts = Vec::with_capacity(request.parts.len());
        let mut checksum = ChecksumAccumulator::new();
        for part in &request.parts {
            let stored = upload
                .parts
                .get(&part.part_number)
                .filter(|(etag, _)| *etag == part.etag)
                .map(|(_, body)| body.clone());
            match stored {
                Some(body) => {
                    checksum.push(crc64(&body), body.len() as u64);
                    parts.push(body);
                }
                None => {
                    let err = ServiceError::new(
                        400,
                        "InvalidPart",
                        format!("part {} was not uploaded", part.part_number),
                    );
                    state.uploads.insert(request.upload_id.clone(), upload);
                    return Err(err.into());
                }
            }
        }

        let data: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
        let id = state.next_id();
        let etag = format!("\"{:016x}-{}\"", checksum.value(), parts.len());
        let version_id = format!("v{}", id);
        let echoed = Self::echo_crc(&state.faults, checksum.value());

        state.objects.insert(
            (upload.bucket, upload.key),
            StoredObject {
                data: Bytes::from(data),
                parts,
                etag: etag.clone(),
                version_id: version_id.clone(),
                content_type: upload.content_type,
                metadata: upload.metadata,
            },
        );

        Ok(CompleteMultipartOutput {
            etag,
            version_id: Some(version_id),
            hash_crc64: echoed,
        })
    }

    async fn abort_multipart_upload(&self, request: AbortMultipartRequest) -> ExecResult<()> {
        let mut state = self.state.lock();
        state.calls.abort += 1;
        if let Some(err) = state.faults.abort.clone() {
            return Err(err);
        }
        state
            .uploads
            .remove(&request.upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(&request.upload_id))
    }

    async fn get_range(&self, request: GetRangeRequest) -> ExecResult<GetRangeOutput> {
        let mut state = self.state.lock();
        state.calls.get_range += 1;
        let gets = state.calls.get_range;

        let object = state
            .objects
            .get(&(request.bucket.clone(), request.key.clone()))
            .ok_or_else(|| ServiceError::new(404, "NoSuchKey", "the object does not exist"))?;

        if let Some(version) = &request.version_id {
            if *version != object.version_id {
                return Err(ServiceError::new(404, "NoSuchVersion", "version does not exist").into());
            }
        }

        let size = object.data.len() as u64;
        let offset = request.range.offset;
        if offset > size || (offset == size && size > 0) {
            return Err(ServiceError::new(
                416,
                "InvalidRange",
                format!("range {} not satisfiable for {} bytes", request.range, size),
            )
            .into());
        }

        let end = match request.range.count {
            Some(count) => offset.saturating_add(count).min(size),
            None => size,
        };
        let mut body = object.data.slice(offset as usize..end as usize);
        let content_length = body.len() as u64;

        let faults = &state.faults;
        if let Some(limit) = faults.short_body {
            body.truncate(limit);
        }
        let etag = match faults.rotate_etag_after {
            Some(after) if gets > after => format!("{}-rotated", object.etag),
            _ => object.etag.clone(),
        };
        let start = if gets > 1 {
            offset + faults.start_skew
        } else {
            offset
        };

        Ok(GetRangeOutput {
            start,
            content_length,
            object_size: size,
            etag,
            version_id: Some(object.version_id.clone()),
            hash_crc64: Self::echo_crc(faults, crc64(&object.data)),
            body: Box::new(Cursor::new(body)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CompletedPart, HttpRange};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_multipart_roundtrip() {
        let store = MemoryStore::new();
        let upload_id = store
            .initiate_multipart_upload(InitiateMultipartRequest {
                bucket: "b".into(),
                key: "k".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut parts = Vec::new();
        for (n, body) in [(1u32, &b"hello "[..]), (2, &b"world"[..])] {
            let out = store
                .upload_part(UploadPartRequest {
                    bucket: "b".into(),
                    key: "k".into(),
                    upload_id: upload_id.clone(),
                    part_number: n,
                    body: Bytes::from_static(body),
                    content_crc64: Some(crc64(body)),
                })
                .await
                .unwrap();
            parts.push(CompletedPart {
                part_number: n,
                etag: out.etag,
                crc64: crc64(body),
                size: body.len() as u64,
            });
        }

        let out = store
            .complete_multipart_upload(CompleteMultipartRequest {
                bucket: "b".into(),
                key: "k".into(),
                upload_id,
                parts,
            })
            .await
            .unwrap();

        assert_eq!(out.hash_crc64, Some(crc64(b"hello world")));
        assert_eq!(store.object("b", "k").unwrap(), b"hello world");
        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(store.completed_part_numbers(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_rejects_bad_digest() {
        let store = MemoryStore::new();
        let err = store
            .put_object(PutObjectRequest {
                bucket: "b".into(),
                key: "k".into(),
                body: Bytes::from_static(b"data"),
                content_crc64: Some(1),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Service(e) if e.code == "InvalidDigest"));
    }

    #[tokio::test]
    async fn test_get_range_and_faults() {
        let store = MemoryStore::new();
        let etag = store.insert_object("b", "k", &b"0123456789"[..]);
        store.short_bodies(2);
        store.rotate_etag_after(1);

        let request = GetRangeRequest {
            bucket: "b".into(),
            key: "k".into(),
            version_id: None,
            range: HttpRange::new(3, Some(4)),
        };

        let mut first = store.get_range(request.clone()).await.unwrap();
        assert_eq!(first.start, 3);
        assert_eq!(first.content_length, 4);
        assert_eq!(first.etag, etag);
        assert_eq!(first.content_range().unwrap().to_string(), "bytes 3-6/10");

        let mut body = Vec::new();
        first.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"34");

        let second = store.get_range(request).await.unwrap();
        assert_ne!(second.etag, etag);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let store = MemoryStore::new();
        store.insert_object("b", "k", &b"abc"[..]);

        let err = store
            .get_range(GetRangeRequest {
                bucket: "b".into(),
                key: "k".into(),
                version_id: None,
                range: HttpRange::new(3, None),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Service(e) if e.status == 416));
    }
}
