//! Progress events for uploads and downloads
//!
//! Attach a [`ProgressReporter`] to [`UploadOptions`](crate::upload::UploadOptions)
//! or [`DownloadOptions`](crate::download::DownloadOptions) and consume the
//! receiver on any task:
//!
//! ```no_run
//! use orbit_transfer::progress::{ProgressEvent, ProgressReporter};
//!
//! # async fn example() {
//! let (reporter, mut receiver) = ProgressReporter::new();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = receiver.recv().await {
//!         if let ProgressEvent::Progress { percentage, .. } = event {
//!             println!("{:.1}%", percentage);
//!         }
//!     }
//! });
//! # let _ = reporter;
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Progress event for a single transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// Transfer started
    TransferStarted {
        /// Logical object path
        operation_id: String,
        /// Total bytes, if known up front
        total_bytes: Option<u64>,
        direction: TransferDirection,
    },

    /// Bytes moved so far
    Progress {
        operation_id: String,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        /// Percentage complete (0-100), 0 when the total is unknown
        percentage: f64,
    },

    /// One multipart part was stored
    PartCompleted {
        operation_id: String,
        part_number: u32,
        part_bytes: u64,
    },

    /// Transfer completed successfully
    TransferCompleted {
        operation_id: String,
        total_bytes: u64,
        duration: Duration,
    },

    /// Transfer failed
    TransferFailed {
        operation_id: String,
        error: String,
        bytes_transferred: u64,
    },
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "Upload"),
            TransferDirection::Download => write!(f, "Download"),
        }
    }
}

/// Sender half for progress events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Arc<UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = unbounded_channel();
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    /// Report a progress event
    pub fn report(&self, event: ProgressEvent) {
        // Receiver might be dropped
        let _ = self.sender.send(event);
    }

    pub fn transfer_started(
        &self,
        operation_id: &str,
        total_bytes: Option<u64>,
        direction: TransferDirection,
    ) {
        self.report(ProgressEvent::TransferStarted {
            operation_id: operation_id.to_string(),
            total_bytes,
            direction,
        });
    }

    pub fn progress(&self, operation_id: &str, bytes_transferred: u64, total_bytes: Option<u64>) {
        let percentage = match total_bytes {
            Some(total) if total > 0 => (bytes_transferred as f64 / total as f64) * 100.0,
            _ => 0.0,
        };

        self.report(ProgressEvent::Progress {
            operation_id: operation_id.to_string(),
            bytes_transferred,
            total_bytes,
            percentage,
        });
    }

    pub fn part_completed(&self, operation_id: &str, part_number: u32, part_bytes: u64) {
        self.report(ProgressEvent::PartCompleted {
            operation_id: operation_id.to_string(),
            part_number,
            part_bytes,
        });
    }

    pub fn transfer_completed(&self, operation_id: &str, total_bytes: u64, duration: Duration) {
        self.report(ProgressEvent::TransferCompleted {
            operation_id: operation_id.to_string(),
            total_bytes,
            duration,
        });
    }

    pub fn transfer_failed(&self, operation_id: &str, error: String, bytes_transferred: u64) {
        self.report(ProgressEvent::TransferFailed {
            operation_id: operation_id.to_string(),
            error,
            bytes_transferred,
        });
    }
}
