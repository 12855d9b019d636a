//! Network quality oracle seam.
//!
//! The coordinator treats the oracle as a black box: it asks for a
//! recommended batch size before each cycle and reports each group
//! outcome back. Heuristics (bandwidth probes, RTT windows) live behind
//! this trait, outside this crate.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Batch-size advice and upload feedback.
pub trait NetworkQualityOracle: Send + Sync {
    /// How many records the next cycle should dequeue.
    fn recommended_batch_size(&self) -> usize;

    /// Feedback after each per-stream group upload.
    fn record_upload_result(&self, success: bool);
}

/// Oracle that always recommends the same batch size and ignores
/// feedback. The default when no estimator is wired in.
#[derive(Debug)]
pub struct FixedBatchOracle {
    batch_size: AtomicUsize,
}

impl FixedBatchOracle {
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: AtomicUsize::new(batch_size.max(1)),
        }
    }

    /// Adjust the fixed recommendation at runtime.
    pub fn set_batch_size(&self, batch_size: usize) {
        self.batch_size.store(batch_size.max(1), Ordering::Relaxed);
    }
}

impl Default for FixedBatchOracle {
    fn default() -> Self {
        Self::new(50)
    }
}

impl NetworkQualityOracle for FixedBatchOracle {
    fn recommended_batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    fn record_upload_result(&self, _success: bool) {}
}
