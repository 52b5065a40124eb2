//! Part planning for multipart uploads

use super::{DEFAULT_PARALLELISM, DEFAULT_PART_SIZE, MAX_PARTS, MAX_PART_SIZE, MIN_PART_SIZE};
use crate::error::TransferCause;

/// Capabilities of an upload source, probed once at entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Parts can be read at arbitrary offsets
    pub seekable: bool,

    /// Total byte count, if known before reading
    pub known_length: Option<u64>,
}

impl SourceDescriptor {
    pub fn new(seekable: bool, known_length: Option<u64>) -> Self {
        Self {
            seekable,
            known_length,
        }
    }
}

/// One part of a multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartJob {
    /// 1-based part number
    pub index: u32,
    pub offset: u64,
    /// Bytes to read; for a streaming part, the most that will be read
    pub length: u64,
}

/// How an object will be split and uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub total_size: Option<u64>,
    pub part_size: u64,
    /// `None` in streaming mode, where parts are discovered until EOF
    pub part_count: Option<u32>,
    pub parallelism: usize,
    pub single_part: bool,
}

impl TransferPlan {
    /// One PUT, no multipart session
    pub fn is_single_part(&self) -> bool {
        self.single_part
    }

    /// Unknown total size
    pub fn is_streaming(&self) -> bool {
        self.total_size.is_none()
    }

    /// Job for part `index` at a fixed stride of `part_size`
    pub fn job(&self, index: u32) -> PartJob {
        let offset = u64::from(index - 1) * self.part_size;
        let length = match self.total_size {
            Some(total) => self.part_size.min(total.saturating_sub(offset)),
            None => self.part_size,
        };
        PartJob {
            index,
            offset,
            length,
        }
    }

    /// Every job of a known-size plan, in index order. Empty when streaming.
    pub fn jobs(&self) -> Vec<PartJob> {
        match self.part_count {
            Some(count) if !self.is_streaming() => (1..=count).map(|i| self.job(i)).collect(),
            _ => Vec::new(),
        }
    }
}

/// Derives part size, part count and parallelism from the source and limits
#[derive(Debug, Clone, Copy)]
pub struct PartPlanner {
    part_size: u64,
    parallelism: usize,
}

impl PartPlanner {
    /// Zero selects the default for either value
    pub fn new(part_size: u64, parallelism: usize) -> Self {
        Self {
            part_size: if part_size == 0 {
                DEFAULT_PART_SIZE
            } else {
                part_size
            },
            parallelism: if parallelism == 0 {
                DEFAULT_PARALLELISM
            } else {
                parallelism
            },
        }
    }

    pub fn plan(&self, source: &SourceDescriptor) -> Result<TransferPlan, TransferCause> {
        if self.part_size > MAX_PART_SIZE {
            return Err(TransferCause::Parameter(format!(
                "part size {} exceeds maximum {}",
                self.part_size, MAX_PART_SIZE
            )));
        }

        // Parts of a non-seekable source must be read in stream order
        let parallelism = if source.seekable { self.parallelism } else { 1 };

        let total = match source.known_length {
            Some(total) => total,
            None => {
                return Ok(TransferPlan {
                    total_size: None,
                    part_size: self.part_size,
                    part_count: None,
                    parallelism: 1,
                    single_part: false,
                })
            }
        };

        if total <= self.part_size {
            return Ok(TransferPlan {
                total_size: Some(total),
                part_size: self.part_size,
                part_count: Some(1),
                parallelism: 1,
                single_part: true,
            });
        }

        let mut part_size = self.part_size;
        if total.div_ceil(part_size) > u64::from(MAX_PARTS) {
            part_size = total.div_ceil(u64::from(MAX_PARTS)).max(MIN_PART_SIZE);
            if part_size > MAX_PART_SIZE {
                return Err(TransferCause::Parameter(format!(
                    "object of {} bytes needs parts larger than {}",
                    total, MAX_PART_SIZE
                )));
            }
        }

        let part_count = total.div_ceil(part_size);
        let part_count = u32::try_from(part_count)
            .map_err(|_| TransferCause::Internal(format!("part count {} overflows", part_count)))?;

        Ok(TransferPlan {
            total_size: Some(total),
            part_size,
            part_count: Some(part_count),
            parallelism: parallelism.min(part_count as usize).max(1),
            single_part: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn seekable(len: u64) -> SourceDescriptor {
        SourceDescriptor::new(true, Some(len))
    }

    #[test]
    fn test_zero_selects_defaults() {
        let plan = PartPlanner::new(0, 0).plan(&seekable(20 * MIB)).unwrap();
        assert_eq!(plan.part_size, DEFAULT_PART_SIZE);
        assert_eq!(plan.part_count, Some(4));
        assert_eq!(plan.parallelism, DEFAULT_PARALLELISM);
    }

    #[test]
    fn test_small_explicit_part_size() {
        let plan = PartPlanner::new(102_400, 4).plan(&seekable(523_123)).unwrap();
        assert!(!plan.is_single_part());
        assert_eq!(plan.part_count, Some(6));
        assert_eq!(plan.parallelism, 4);

        let jobs = plan.jobs();
        assert_eq!(jobs.len(), 6);
        assert!(jobs[..5].iter().all(|j| j.length == 102_400));
        assert_eq!(jobs[5].offset, 512_000);
        assert_eq!(jobs[5].length, 11_123);
    }

    #[test]
    fn test_single_part_fast_path() {
        let planner = PartPlanner::new(MIB, 3);

        let plan = planner.plan(&seekable(MIB)).unwrap();
        assert!(plan.is_single_part());
        assert_eq!(plan.part_count, Some(1));

        let empty = planner.plan(&seekable(0)).unwrap();
        assert!(empty.is_single_part());
        assert_eq!(empty.total_size, Some(0));
    }

    #[test]
    fn test_parallelism_clamped_to_part_count() {
        let plan = PartPlanner::new(MIB, 16).plan(&seekable(2 * MIB + 1)).unwrap();
        assert_eq!(plan.part_count, Some(3));
        assert_eq!(plan.parallelism, 3);
    }

    #[test]
    fn test_non_seekable_forces_sequential() {
        let plan = PartPlanner::new(MIB, 8)
            .plan(&SourceDescriptor::new(false, Some(10 * MIB)))
            .unwrap();
        assert_eq!(plan.parallelism, 1);
        assert_eq!(plan.part_count, Some(10));
    }

    #[test]
    fn test_unknown_length_is_streaming() {
        let plan = PartPlanner::new(MIB, 8)
            .plan(&SourceDescriptor::new(false, None))
            .unwrap();
        assert!(plan.is_streaming());
        assert!(!plan.is_single_part());
        assert_eq!(plan.part_count, None);
        assert_eq!(plan.parallelism, 1);
        assert!(plan.jobs().is_empty());

        let job = plan.job(3);
        assert_eq!(job.offset, 2 * MIB);
        assert_eq!(job.length, MIB);
    }

    #[test]
    fn test_part_count_never_exceeds_max() {
        let sizes = [
            1,
            MIN_PART_SIZE,
            MIN_PART_SIZE * 10_000,
            MIN_PART_SIZE * 10_000 + 1,
            50 * 1024 * MIB,
            1024 * 1024 * MIB,
            5 * 1024 * 1024 * MIB,
        ];
        let part_sizes = [1, 1024, 102_400, MIN_PART_SIZE, 64 * MIB];

        for &size in &sizes {
            for &part_size in &part_sizes {
                let plan = PartPlanner::new(part_size, 4).plan(&seekable(size)).unwrap();
                let count = plan.part_count.unwrap();
                assert!(count <= MAX_PARTS, "size {} part {}", size, part_size);
                assert!(u64::from(count) * plan.part_size >= size);

                if plan.part_size != part_size {
                    assert!(plan.part_size >= MIN_PART_SIZE);
                }
            }
        }
    }

    #[test]
    fn test_scaled_part_size_has_floor() {
        // 10 001 parts of 1 KiB would be needed
        let plan = PartPlanner::new(1024, 3)
            .plan(&seekable(1024 * 10_001))
            .unwrap();
        assert_eq!(plan.part_size, MIN_PART_SIZE);
        assert_eq!(plan.part_count, Some(2));
    }

    #[test]
    fn test_oversized_object_rejected() {
        let too_big = MAX_PART_SIZE * u64::from(MAX_PARTS) + 1;
        let err = PartPlanner::new(0, 0).plan(&seekable(too_big)).unwrap_err();
        assert!(matches!(err, TransferCause::Parameter(_)));

        let err = PartPlanner::new(MAX_PART_SIZE + 1, 0)
            .plan(&seekable(1))
            .unwrap_err();
        assert!(matches!(err, TransferCause::Parameter(_)));
    }
}
