//! Range fetching seam for the prefetch pipeline

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ExecResult;
use crate::executor::{GetRangeOutput, GetRangeRequest, HttpRange, RequestExecutor};

/// Issues one ranged GET
#[async_trait]
pub trait RangeGetter: Send + Sync {
    async fn get_range(&self, range: HttpRange) -> ExecResult<GetRangeOutput>;
}

/// Ranged GETs of one object through a [`RequestExecutor`]
#[derive(Clone)]
pub struct ObjectRangeGetter {
    executor: Arc<dyn RequestExecutor>,
    bucket: String,
    key: String,
    version_id: Option<String>,
}

impl ObjectRangeGetter {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        version_id: Option<String>,
    ) -> Self {
        Self {
            executor,
            bucket: bucket.into(),
            key: key.into(),
            version_id,
        }
    }

    /// Pin later fetches to `version_id`
    pub fn with_version(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version_id(&self) -> Option<&str> {
        self.version_id.as_deref()
    }
}

#[async_trait]
impl RangeGetter for ObjectRangeGetter {
    async fn get_range(&self, range: HttpRange) -> ExecResult<GetRangeOutput> {
        self.executor
            .get_range(GetRangeRequest {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                version_id: self.version_id.clone(),
                range,
            })
            .await
    }
}
