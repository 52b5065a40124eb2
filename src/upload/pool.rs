//! Bounded-concurrency part uploads
//!
//! Workers pull jobs from a shared feed, upload them through the executor and
//! report one [`PartResult`] per job over a channel. The coordinator is the
//! only consumer of results; workers never touch session state.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::planner::{PartJob, TransferPlan};
use super::source::PartSource;
use super::MAX_PARTS;
use crate::checksum::crc64;
use crate::error::{IntegrityError, TransferCause};
use crate::executor::{cancellable, CompletedPart, RequestExecutor, UploadPartRequest};

/// Jobs not yet taken by a worker
#[derive(Debug)]
pub(crate) enum JobFeed {
    /// Known-size plan
    Planned(VecDeque<PartJob>),

    /// Unknown size: fixed-size jobs until a short read
    Streaming {
        next_index: u32,
        part_size: u64,
        finished: bool,
    },
}

impl JobFeed {
    pub(crate) fn for_plan(plan: &TransferPlan) -> Self {
        if plan.is_streaming() {
            JobFeed::Streaming {
                next_index: 1,
                part_size: plan.part_size,
                finished: false,
            }
        } else {
            JobFeed::Planned(plan.jobs().into())
        }
    }

    fn next_job(&mut self) -> Option<PartJob> {
        match self {
            JobFeed::Planned(jobs) => jobs.pop_front(),
            JobFeed::Streaming {
                next_index,
                part_size,
                finished,
            } => {
                if *finished {
                    return None;
                }
                let index = *next_index;
                *next_index += 1;
                Some(PartJob {
                    index,
                    offset: u64::from(index - 1) * *part_size,
                    length: *part_size,
                })
            }
        }
    }

    /// Stop handing out jobs
    fn finish(&mut self) {
        match self {
            JobFeed::Planned(jobs) => jobs.clear(),
            JobFeed::Streaming { finished, .. } => *finished = true,
        }
    }

    fn remaining(&self) -> Option<usize> {
        match self {
            JobFeed::Planned(jobs) => Some(jobs.len()),
            JobFeed::Streaming { .. } => None,
        }
    }
}

/// Single-assignment slot holding the first part failure
#[derive(Debug, Default)]
pub(crate) struct FirstError(OnceLock<TransferCause>);

impl FirstError {
    /// Returns false if another failure was recorded first
    pub(crate) fn set(&self, cause: TransferCause) -> bool {
        self.0.set(cause).is_ok()
    }

    pub(crate) fn get(&self) -> Option<&TransferCause> {
        self.0.get()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.get().is_some()
    }
}

/// Outcome of one dispatched job
#[derive(Debug)]
pub(crate) struct PartResult {
    pub index: u32,
    pub outcome: Result<CompletedPart, TransferCause>,
}

/// State shared by every worker of one upload
pub(crate) struct PartContext {
    pub executor: Arc<dyn RequestExecutor>,
    pub source: Arc<PartSource>,
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub streaming: bool,
    pub verify_crc64: bool,
    pub cancel: CancellationToken,
    pub first_error: FirstError,
    pub feed: Mutex<JobFeed>,
}

impl PartContext {
    fn next_job(&self) -> Option<PartJob> {
        if self.first_error.is_set() || self.cancel.is_cancelled() {
            return None;
        }
        self.feed.lock().next_job()
    }

    async fn read(&self, job: &PartJob) -> Result<Bytes, TransferCause> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferCause::Cancelled),
            data = self.source.read_part(job) => Ok(data?),
        }
    }

    /// Upload one part. `Ok(None)` marks the end of a streaming source.
    async fn upload(&self, job: &PartJob) -> Result<Option<CompletedPart>, TransferCause> {
        let data = self.read(job).await?;
        let size = data.len() as u64;

        if self.streaming {
            if size < job.length {
                self.feed.lock().finish();
            }
            if data.is_empty() {
                return Ok(None);
            }
            if job.index > MAX_PARTS {
                return Err(IntegrityError::PartCountExceeded { max: MAX_PARTS }.into());
            }
        } else if size != job.length {
            return Err(IntegrityError::UnexpectedEof {
                offset: job.offset + size,
            }
            .into());
        }

        let crc = crc64(&data);
        let request = UploadPartRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            part_number: job.index,
            body: data,
            content_crc64: Some(crc),
        };

        let output = cancellable(&self.cancel, self.executor.upload_part(request)).await?;

        if self.verify_crc64 {
            if let Some(server) = output.hash_crc64 {
                if server != crc {
                    return Err(IntegrityError::Crc64Mismatch {
                        client: crc,
                        server,
                    }
                    .into());
                }
            }
        }

        Ok(Some(CompletedPart {
            part_number: job.index,
            etag: output.etag,
            crc64: crc,
            size,
        }))
    }
}

async fn run_worker(worker: usize, ctx: Arc<PartContext>, results: mpsc::UnboundedSender<PartResult>) {
    while let Some(job) = ctx.next_job() {
        debug!(
            worker,
            part = job.index,
            offset = job.offset,
            length = job.length,
            "Uploading part"
        );

        match ctx.upload(&job).await {
            Ok(Some(part)) => {
                let _ = results.send(PartResult {
                    index: job.index,
                    outcome: Ok(part),
                });
            }
            Ok(None) => {
                debug!(worker, part = job.index, "Source exhausted");
                break;
            }
            Err(cause) => {
                if ctx.first_error.set(cause.clone()) {
                    warn!(worker, part = job.index, error = %cause, "Part upload failed");
                } else {
                    debug!(worker, part = job.index, error = %cause, "Part upload failed after first error");
                }
                ctx.feed.lock().finish();
                let _ = results.send(PartResult {
                    index: job.index,
                    outcome: Err(cause),
                });
                break;
            }
        }
    }
}

/// Spawns upload workers for one multipart session
#[derive(Debug, Clone, Copy)]
pub(crate) struct PartWorkerPool {
    parallelism: usize,
}

impl PartWorkerPool {
    pub(crate) fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// Start `min(parallelism, remaining jobs)` workers
    pub(crate) fn dispatch(&self, ctx: Arc<PartContext>) -> Dispatch {
        let workers = match ctx.feed.lock().remaining() {
            Some(remaining) => self.parallelism.min(remaining),
            None => self.parallelism,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut join_set = JoinSet::new();
        for worker in 0..workers {
            join_set.spawn(run_worker(worker, ctx.clone(), tx.clone()));
        }
        debug!(workers, "Dispatched part workers");

        Dispatch {
            results: rx,
            workers: join_set,
        }
    }
}

/// Running workers and their result stream
pub(crate) struct Dispatch {
    results: mpsc::UnboundedReceiver<PartResult>,
    workers: JoinSet<()>,
}

impl Dispatch {
    /// Next result; `None` once every worker has exited
    pub(crate) async fn next_result(&mut self) -> Option<PartResult> {
        self.results.recv().await
    }

    /// Wait for every worker. A panicked worker becomes an internal error.
    pub(crate) async fn join(mut self) -> Result<(), TransferCause> {
        let mut failure = None;
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                if failure.is_none() {
                    failure = Some(TransferCause::Internal(format!("part worker failed: {}", e)));
                }
            }
        }
        match failure {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::upload::planner::PartPlanner;
    use crate::upload::planner::SourceDescriptor;
    use crate::upload::UploadSource;

    async fn context(
        store: Arc<MemoryStore>,
        data: Vec<u8>,
        part_size: u64,
        parallelism: usize,
    ) -> (Arc<PartContext>, TransferPlan) {
        let (desc, source) = UploadSource::bytes(data).prepare().await.unwrap();
        let plan = PartPlanner::new(part_size, parallelism).plan(&desc).unwrap();
        let upload_id = store
            .initiate_multipart_upload(crate::executor::InitiateMultipartRequest {
                bucket: "bucket".into(),
                key: "key".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let ctx = Arc::new(PartContext {
            executor: store,
            source: Arc::new(source),
            bucket: "bucket".into(),
            key: "key".into(),
            upload_id,
            streaming: plan.is_streaming(),
            verify_crc64: true,
            cancel: CancellationToken::new(),
            first_error: FirstError::default(),
            feed: Mutex::new(JobFeed::for_plan(&plan)),
        });
        (ctx, plan)
    }

    async fn collect(dispatch: &mut Dispatch) -> Vec<PartResult> {
        let mut results = Vec::new();
        while let Some(result) = dispatch.next_result().await {
            results.push(result);
        }
        results
    }

    #[test]
    fn test_first_error_wins() {
        let cell = FirstError::default();
        assert!(!cell.is_set());
        assert!(cell.set(TransferCause::Transport("first".into())));
        assert!(!cell.set(TransferCause::Cancelled));
        assert!(matches!(cell.get(), Some(TransferCause::Transport(m)) if m == "first"));
    }

    #[test]
    fn test_streaming_feed_stops_after_finish() {
        let plan = PartPlanner::new(10, 1)
            .plan(&SourceDescriptor::new(false, None))
            .unwrap();
        let mut feed = JobFeed::for_plan(&plan);

        assert_eq!(feed.next_job().map(|j| (j.index, j.offset)), Some((1, 0)));
        assert_eq!(feed.next_job().map(|j| (j.index, j.offset)), Some((2, 10)));
        feed.finish();
        assert!(feed.next_job().is_none());
        assert_eq!(feed.remaining(), None);
    }

    #[tokio::test]
    async fn test_one_result_per_job() {
        let store = Arc::new(MemoryStore::new());
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let (ctx, plan) = context(store, data, 1000, 4).await;

        let mut dispatch = PartWorkerPool::new(plan.parallelism).dispatch(ctx);
        let results = collect(&mut dispatch).await;
        dispatch.join().await.unwrap();

        let mut indices: Vec<u32> = results.iter().map(|r| r.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (1..=10).collect::<Vec<_>>());
        assert!(results.iter().all(|r| r.outcome.is_ok()));
    }

    #[tokio::test]
    async fn test_failure_stops_new_jobs() {
        let store = Arc::new(MemoryStore::new());
        store.fail_part(2, crate::error::ServiceError::new(500, "InternalError", "boom"));
        let (ctx, _plan) = context(store.clone(), vec![7u8; 10_000], 1000, 1).await;

        let mut dispatch = PartWorkerPool::new(1).dispatch(ctx.clone());
        let results = collect(&mut dispatch).await;
        dispatch.join().await.unwrap();

        // Sequential worker: part 1 succeeds, part 2 fails, nothing after
        assert_eq!(results.len(), 2);
        assert!(results[0].outcome.is_ok());
        assert!(results[1].outcome.is_err());
        assert!(matches!(
            ctx.first_error.get(),
            Some(TransferCause::Service(e)) if e.code == "InternalError"
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_takes_no_jobs() {
        let store = Arc::new(MemoryStore::new());
        let (ctx, _plan) = context(store.clone(), vec![1u8; 5000], 1000, 3).await;
        ctx.cancel.cancel();

        let mut dispatch = PartWorkerPool::new(3).dispatch(ctx);
        assert!(collect(&mut dispatch).await.is_empty());
        dispatch.join().await.unwrap();
        assert_eq!(store.calls().upload_part, 0);
    }
}
