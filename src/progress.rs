use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Cumulative byte accounting for one transfer. Cloneable; all clones share
/// the same counter. Callback failures are logged and never abort the
/// transfer.
#[derive(Clone)]
pub struct TransferProgress {
    total_bytes: u64,
    transferred: Arc<AtomicU64>,
    callback: Option<ProgressCallback>,
}

impl TransferProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            transferred: Arc::new(AtomicU64::new(0)),
            callback: None,
        }
    }

    pub fn with_callback(
        total_bytes: u64,
        callback: impl Fn(u64, u64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            total_bytes,
            transferred: Arc::new(AtomicU64::new(0)),
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn noop() -> Self {
        Self::new(0)
    }

    /// Records `bytes` more sent and notifies the callback with the
    /// cumulative count.
    pub fn record_bytes(&self, bytes: u64) {
        let transferred = self.transferred.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(callback) = &self.callback {
            let callback = callback.clone();
            let total = self.total_bytes;
            if catch_unwind(AssertUnwindSafe(|| callback(transferred, total))).is_err() {
                log::warn!("Progress callback panicked; transfer continues");
            }
        }
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
