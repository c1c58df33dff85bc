/// Transfer progress instrumentation.
///
/// A byte-counting observer attached to uploads and downloads of large
/// archives. It logs one line per crossing of a percentage threshold
/// (default: every 10 points) plus unconditionally at 100%, so a
/// multi-minute transfer stays visible without flooding the log.
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Log a line at most once per this many percentage points.
pub const DEFAULT_UPDATE_INTERVAL: u64 = 10;

/// Per-transfer byte counter. One instance per upload or download; no state
/// is shared across transfers.
#[derive(Debug)]
pub struct TransferProgress {
    label: String,
    verb: &'static str,
    direction: &'static str,
    total: u64,
    interval: u64,
    seen: AtomicU64,
    last_logged: AtomicU64,
}

impl TransferProgress {
    pub fn upload(label: &str, total: u64) -> Self {
        Self::new(label, "uploading", "to", total, DEFAULT_UPDATE_INTERVAL)
    }

    pub fn download(label: &str, total: u64) -> Self {
        Self::new(label, "downloading", "from", total, DEFAULT_UPDATE_INTERVAL)
    }

    fn new(label: &str, verb: &'static str, direction: &'static str, total: u64, interval: u64) -> Self {
        if total == 0 {
            // Nothing will ever cross a threshold on an empty transfer.
            info!("{verb} {label} {direction} s3: 100.00% (empty)");
        }
        Self {
            label: label.to_string(),
            verb,
            direction,
            total,
            interval,
            seen: AtomicU64::new(0),
            last_logged: AtomicU64::new(0),
        }
    }

    /// Record `bytes` more transferred bytes, logging if a threshold was
    /// crossed. Safe to call from the transfer's callback context.
    pub fn observe(&self, bytes: u64) {
        if let Some(percentage) = self.advance(bytes) {
            info!(
                "{} {} {} s3: {:.2}%",
                self.verb, self.label, self.direction, percentage
            );
        }
    }

    /// Advance the counter; returns the percentage to log, if any.
    fn advance(&self, bytes: u64) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let seen = self.seen.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let points = seen.saturating_mul(100) / self.total;
        let last = self.last_logged.load(Ordering::Relaxed);
        if points.saturating_sub(last) >= self.interval || points >= 100 {
            self.last_logged.store(points, Ordering::Relaxed);
            return Some((seen as f64 / self.total as f64) * 100.0);
        }
        None
    }
}
