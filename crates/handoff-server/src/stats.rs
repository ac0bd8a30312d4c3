//! Pipeline counters.
//!
//! Each counter has a single writer (one stage); readers on other threads
//! only ever see a snapshot, so relaxed ordering is enough.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    // IO stage
    pub accepts: AtomicU64,
    pub closes: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub forwarded: AtomicU64,
    pub forward_rejections: AtomicU64,
    pub returned: AtomicU64,
    pub io_errors: AtomicU64,
    // processing stage
    pub processed: AtomicU64,
    pub return_rejections: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            accepts: load(&self.accepts),
            closes: load(&self.closes),
            bytes_in: load(&self.bytes_in),
            bytes_out: load(&self.bytes_out),
            forwarded: load(&self.forwarded),
            forward_rejections: load(&self.forward_rejections),
            returned: load(&self.returned),
            io_errors: load(&self.io_errors),
            processed: load(&self.processed),
            return_rejections: load(&self.return_rejections),
        }
    }
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepts: u64,
    pub closes: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub forwarded: u64,
    pub forward_rejections: u64,
    pub returned: u64,
    pub io_errors: u64,
    pub processed: u64,
    pub return_rejections: u64,
}

impl StatsSnapshot {
    /// Connections accepted and not yet closed.
    pub fn open(&self) -> u64 {
        self.accepts.saturating_sub(self.closes)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conns={} accepts={} close={} bytes_in={} bytes_out={} fwd={} fwd_full={} ret={} ret_full={} processed={} err={}",
            self.open(),
            self.accepts,
            self.closes,
            self.bytes_in,
            self.bytes_out,
            self.forwarded,
            self.forward_rejections,
            self.returned,
            self.return_rejections,
            self.processed,
            self.io_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_display() {
        let stats = PipelineStats::new();
        PipelineStats::bump(&stats.accepts);
        PipelineStats::bump(&stats.accepts);
        PipelineStats::bump(&stats.closes);
        PipelineStats::add(&stats.bytes_in, 11);

        let snap = stats.snapshot();
        assert_eq!(snap.accepts, 2);
        assert_eq!(snap.open(), 1);
        assert_eq!(snap.bytes_in, 11);
        assert!(snap.to_string().starts_with("conns=1 accepts=2 close=1 bytes_in=11 "));
    }
}
