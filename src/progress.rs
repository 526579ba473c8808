use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::util::format_bytes;

/// Thread-safe running tally of transferred bytes. Workers add to it on
/// every acknowledged part; readers derive percentage, speed, and ETA.
pub struct ProgressTracker {
    total_estimate: u64,
    transferred: AtomicU64,
    start: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub transferred: u64,
    pub total_estimate: u64,
    pub percentage: f64,
    pub bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(total_estimate: u64) -> Self {
        ProgressTracker {
            total_estimate,
            transferred: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn update(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let transferred = self.transferred();
        let elapsed = self.start.elapsed().as_secs_f64();

        let percentage = if self.total_estimate > 0 {
            transferred as f64 / self.total_estimate as f64 * 100.0
        } else {
            0.0
        };

        let bytes_per_sec = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };

        let eta = if bytes_per_sec > 0.0 && transferred < self.total_estimate {
            let remaining = (self.total_estimate - transferred) as f64;
            Some(Duration::from_secs_f64(remaining / bytes_per_sec))
        } else {
            None
        };

        ProgressSnapshot {
            transferred,
            total_estimate: self.total_estimate,
            percentage,
            bytes_per_sec,
            eta,
        }
    }

    pub fn format_status(&self) -> String {
        let snapshot = self.snapshot();
        let eta = match snapshot.eta {
            Some(eta) => format!("{}s", eta.as_secs()),
            None => "unknown".to_string(),
        };
        format!(
            "{:.1}% ({} / {}), {}/s, ETA {}",
            snapshot.percentage,
            format_bytes(snapshot.transferred),
            format_bytes(snapshot.total_estimate),
            format_bytes(snapshot.bytes_per_sec as u64),
            eta
        )
    }
}
