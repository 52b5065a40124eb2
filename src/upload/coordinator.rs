//! Upload coordinator: single PUT or a full multipart session

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::planner::{PartPlanner, TransferPlan};
use super::pool::{FirstError, JobFeed, PartContext, PartWorkerPool};
use super::source::{PartSource, UploadSource};
use super::{UploadOptions, UploadResult};
use crate::checksum::{crc64, ChecksumAccumulator};
use crate::config::TransferConfig;
use crate::error::{IntegrityError, ObjectPath, Result, TransferCause, TransferError};
use crate::executor::{
    cancellable, AbortMultipartRequest, CompleteMultipartRequest, CompletedPart,
    InitiateMultipartRequest, PutObjectRequest, RequestExecutor,
};
use crate::progress::TransferDirection;

/// Lifecycle of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Init,
    SinglePut,
    Initiating,
    UploadingParts,
    Completing,
    Aborting,
    Done,
    Failed,
}

impl UploadState {
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Init, SinglePut)
                | (Init, Initiating)
                | (Init, Failed)
                | (SinglePut, Done)
                | (SinglePut, Failed)
                | (Initiating, UploadingParts)
                | (Initiating, Failed)
                | (UploadingParts, Completing)
                | (UploadingParts, Aborting)
                | (UploadingParts, Failed)
                | (Completing, Done)
                | (Completing, Failed)
                | (Aborting, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Failed)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Init => "init",
            UploadState::SinglePut => "single-put",
            UploadState::Initiating => "initiating",
            UploadState::UploadingParts => "uploading-parts",
            UploadState::Completing => "completing",
            UploadState::Aborting => "aborting",
            UploadState::Done => "done",
            UploadState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Coordinator-owned state of one upload
#[derive(Debug)]
struct UploadSession {
    path: String,
    bucket: String,
    key: String,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    uploaded: u64,
    state: UploadState,
}

impl UploadSession {
    fn new(path: &ObjectPath) -> Self {
        Self {
            path: path.to_string(),
            bucket: path.bucket.clone(),
            key: path.key.clone(),
            upload_id: None,
            parts: Vec::new(),
            uploaded: 0,
            state: UploadState::Init,
        }
    }

    fn transition(&mut self, next: UploadState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            let cause = TransferCause::Internal(format!(
                "invalid upload transition {} -> {}",
                self.state, next
            ));
            self.state = UploadState::Failed;
            return Err(self.error(cause));
        }
        debug!(path = %self.path, from = %self.state, to = %next, "Upload state transition");
        self.state = next;
        Ok(())
    }

    fn error(&self, cause: impl Into<TransferCause>) -> TransferError {
        TransferError::new(&self.path, cause).with_upload_id(self.upload_id.clone())
    }

    /// Move to `Failed` and build the error for `cause`
    fn fail(&mut self, cause: impl Into<TransferCause>) -> TransferError {
        if self.state.can_transition_to(UploadState::Failed) {
            debug!(path = %self.path, from = %self.state, to = %UploadState::Failed, "Upload state transition");
            self.state = UploadState::Failed;
        }
        self.error(cause)
    }

    /// Sort parts and check they cover `1..=n` with nothing missing
    fn finalize_parts(&mut self, plan: &TransferPlan) -> std::result::Result<(), TransferCause> {
        self.parts.sort_by_key(|p| p.part_number);

        let actual = self.parts.len() as u32;
        let expected = plan
            .part_count
            .unwrap_or_else(|| self.parts.last().map_or(0, |p| p.part_number));
        let contiguous = self
            .parts
            .iter()
            .zip(1u32..)
            .all(|(part, n)| part.part_number == n);

        if actual != expected || !contiguous || actual == 0 {
            return Err(IntegrityError::PartsIncomplete { expected, actual }.into());
        }
        Ok(())
    }
}

/// Uploads objects through a [`RequestExecutor`]
#[derive(Clone)]
pub struct Uploader {
    executor: Arc<dyn RequestExecutor>,
    config: TransferConfig,
}

impl Uploader {
    pub fn new(executor: Arc<dyn RequestExecutor>, config: TransferConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Upload `source` to `bucket/key`
    ///
    /// Objects that fit in one part are sent with a single PUT. Larger ones
    /// use a multipart session; on a part failure the session is aborted
    /// unless parts are to be left in place, and the error carries the
    /// upload id.
    #[tracing::instrument(skip_all, fields(bucket = %bucket, key = %key))]
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        source: UploadSource,
        opts: UploadOptions,
    ) -> Result<UploadResult> {
        let path = ObjectPath::new(&self.config.scheme, bucket, key);
        if bucket.is_empty() {
            return Err(TransferError::new(
                &path,
                TransferCause::Parameter("bucket name is empty".to_string()),
            ));
        }
        if key.is_empty() {
            return Err(TransferError::new(
                &path,
                TransferCause::Parameter("object key is empty".to_string()),
            ));
        }

        let started = Instant::now();
        let mut session = UploadSession::new(&path);
        let result = self.run(&mut session, source, &opts).await;

        match &result {
            Ok(done) => {
                info!(
                    path = %session.path,
                    size = done.size,
                    parts = done.part_count,
                    crc64 = done.hash_crc64,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Upload completed"
                );
                if let Some(progress) = &opts.progress {
                    progress.transfer_completed(&session.path, done.size, started.elapsed());
                }
            }
            Err(e) => {
                error!(path = %session.path, error = %e, "Upload failed");
                if let Some(progress) = &opts.progress {
                    progress.transfer_failed(&session.path, e.to_string(), session.uploaded);
                }
            }
        }
        result
    }

    /// Upload a local file; every worker opens its own handle.
    ///
    /// The content type is guessed from the extension when not set.
    pub async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        path: impl AsRef<Path>,
        mut opts: UploadOptions,
    ) -> Result<UploadResult> {
        let path = path.as_ref();
        if opts.content_type.is_none() {
            opts.content_type = mime_guess::from_path(path).first_raw().map(str::to_string);
        }
        self.upload(bucket, key, UploadSource::file(path), opts).await
    }

    async fn run(
        &self,
        session: &mut UploadSession,
        source: UploadSource,
        opts: &UploadOptions,
    ) -> Result<UploadResult> {
        let (descriptor, source) = source.prepare().await.map_err(|e| session.fail(e))?;

        let planner = PartPlanner::new(
            opts.part_size.unwrap_or(self.config.part_size),
            opts.parallelism.unwrap_or(self.config.parallelism),
        );
        let plan = planner.plan(&descriptor).map_err(|c| session.fail(c))?;
        debug!(
            path = %session.path,
            total = ?plan.total_size,
            part_size = plan.part_size,
            parts = ?plan.part_count,
            parallelism = plan.parallelism,
            "Planned upload"
        );

        if let Some(progress) = &opts.progress {
            progress.transfer_started(&session.path, plan.total_size, TransferDirection::Upload);
        }

        if plan.is_single_part() {
            let data = read_first(&source, &plan, &opts.cancel)
                .await
                .map_err(|c| session.fail(c))?;
            let expected = plan.total_size.unwrap_or(0);
            if data.len() as u64 != expected {
                return Err(session.fail(IntegrityError::UnexpectedEof {
                    offset: data.len() as u64,
                }));
            }
            return self.put_single(session, data, opts).await;
        }

        if plan.is_streaming() {
            // A short first chunk means the whole stream fits in one PUT
            let first = read_first(&source, &plan, &opts.cancel)
                .await
                .map_err(|c| session.fail(c))?;
            if (first.len() as u64) < plan.part_size {
                return self.put_single(session, first, opts).await;
            }
            source.unread(first).await;
        }

        self.run_multipart(session, &plan, source, opts).await
    }

    async fn put_single(
        &self,
        session: &mut UploadSession,
        data: Bytes,
        opts: &UploadOptions,
    ) -> Result<UploadResult> {
        session.transition(UploadState::SinglePut)?;

        let crc = crc64(&data);
        let size = data.len() as u64;
        let request = PutObjectRequest {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            body: data,
            content_type: opts.content_type.clone(),
            metadata: opts.metadata.clone(),
            content_crc64: Some(crc),
        };

        let output = cancellable(&opts.cancel, self.executor.put_object(request))
            .await
            .map_err(|e| session.fail(e))?;
        session.uploaded = size;

        self.verify_crc64(session, crc, output.hash_crc64)?;
        session.transition(UploadState::Done)?;

        if let Some(progress) = &opts.progress {
            progress.progress(&session.path, size, Some(size));
        }

        Ok(UploadResult {
            upload_id: None,
            etag: output.etag,
            hash_crc64: crc,
            server_crc64: output.hash_crc64,
            version_id: output.version_id,
            size,
            part_count: 1,
        })
    }

    async fn run_multipart(
        &self,
        session: &mut UploadSession,
        plan: &TransferPlan,
        source: PartSource,
        opts: &UploadOptions,
    ) -> Result<UploadResult> {
        session.transition(UploadState::Initiating)?;

        let request = InitiateMultipartRequest {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            content_type: opts.content_type.clone(),
            metadata: opts.metadata.clone(),
        };
        let upload_id = cancellable(&opts.cancel, self.executor.initiate_multipart_upload(request))
            .await
            .map_err(|e| session.fail(e))?;
        session.upload_id = Some(upload_id.clone());
        info!(
            path = %session.path,
            upload_id = %upload_id,
            parts = ?plan.part_count,
            parallelism = plan.parallelism,
            "Initiated multipart upload"
        );

        session.transition(UploadState::UploadingParts)?;

        let ctx = Arc::new(PartContext {
            executor: self.executor.clone(),
            source: Arc::new(source),
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            upload_id: upload_id.clone(),
            streaming: plan.is_streaming(),
            verify_crc64: self.config.verify_crc64,
            cancel: opts.cancel.clone(),
            first_error: FirstError::default(),
            feed: Mutex::new(JobFeed::for_plan(plan)),
        });

        let mut dispatch = PartWorkerPool::new(plan.parallelism).dispatch(ctx.clone());
        while let Some(result) = dispatch.next_result().await {
            match result.outcome {
                Ok(part) => {
                    debug!(part = part.part_number, size = part.size, etag = %part.etag, "Part stored");
                    session.uploaded += part.size;
                    if let Some(progress) = &opts.progress {
                        progress.part_completed(&session.path, part.part_number, part.size);
                        progress.progress(&session.path, session.uploaded, plan.total_size);
                    }
                    session.parts.push(part);
                }
                Err(cause) => {
                    debug!(part = result.index, error = %cause, "Part reported failure");
                }
            }
        }
        let joined = dispatch.join().await;

        let failure = ctx
            .first_error
            .get()
            .cloned()
            .or_else(|| joined.err())
            .or_else(|| opts.cancel.is_cancelled().then_some(TransferCause::Cancelled))
            .or_else(|| session.finalize_parts(plan).err());

        if let Some(cause) = failure {
            let leave_parts = opts
                .leave_parts_on_error
                .unwrap_or(self.config.leave_parts_on_error);
            return Err(self.abort(session, cause, leave_parts).await);
        }

        let mut checksum = ChecksumAccumulator::new();
        for part in &session.parts {
            checksum.push(part.crc64, part.size);
        }

        session.transition(UploadState::Completing)?;
        let request = CompleteMultipartRequest {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            upload_id: upload_id.clone(),
            parts: session.parts.clone(),
        };
        let output = cancellable(&opts.cancel, self.executor.complete_multipart_upload(request))
            .await
            .map_err(|e| session.fail(e))?;

        self.verify_crc64(session, checksum.value(), output.hash_crc64)?;
        session.transition(UploadState::Done)?;

        Ok(UploadResult {
            upload_id: Some(upload_id),
            etag: output.etag,
            hash_crc64: checksum.value(),
            server_crc64: output.hash_crc64,
            version_id: output.version_id,
            size: checksum.len(),
            part_count: session.parts.len() as u32,
        })
    }

    /// Best-effort abort after a part failure. Runs even after cancellation.
    async fn abort(
        &self,
        session: &mut UploadSession,
        cause: TransferCause,
        leave_parts: bool,
    ) -> TransferError {
        let upload_id = match session.upload_id.clone() {
            Some(id) => id,
            None => return session.fail(cause),
        };

        if leave_parts {
            warn!(path = %session.path, upload_id = %upload_id, error = %cause, "Leaving uploaded parts in place");
            return session.fail(cause);
        }

        if let Err(e) = session.transition(UploadState::Aborting) {
            return e;
        }
        warn!(path = %session.path, upload_id = %upload_id, error = %cause, "Aborting multipart upload");

        let request = AbortMultipartRequest {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            upload_id: upload_id.clone(),
        };
        let aborted = self.executor.abort_multipart_upload(request).await;

        let err = session.fail(cause);
        match aborted {
            Ok(()) => err,
            Err(abort_err) => {
                error!(upload_id = %upload_id, error = %abort_err, "Abort failed");
                err.with_abort_error(abort_err.into())
            }
        }
    }

    fn verify_crc64(&self, session: &mut UploadSession, client: u64, server: Option<u64>) -> Result<()> {
        match server {
            Some(server) if self.config.verify_crc64 && server != client => {
                Err(session.fail(IntegrityError::Crc64Mismatch { client, server }))
            }
            _ => Ok(()),
        }
    }
}

async fn read_first(
    source: &PartSource,
    plan: &TransferPlan,
    cancel: &CancellationToken,
) -> std::result::Result<Bytes, TransferCause> {
    let job = plan.job(1);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferCause::Cancelled),
        data = source.read_part(&job) => Ok(data?),
    }
}
