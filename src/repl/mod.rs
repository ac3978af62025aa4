//! Replication subsystem state shared between daemons.
//!
//! Everything that was process-global in the ancestral design — the
//! shutdown flag, the backup-side LSN counters, the pipeline stages and the
//! background-replay wakeup — lives in one explicitly constructed value
//! threaded to every daemon at start-up.

pub mod backup;
pub mod primary;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One half of the double buffer between the backup's receive daemon and
/// its redo workers: a window's LSN bounds plus readiness bookkeeping.
///
/// Partition claims are generation-tagged: `work` packs the publication
/// generation in its high half and the next unclaimed partition in its low
/// half, so a worker holding bounds from a drained window can never claim
/// (or count against) the window published after it.
#[derive(Debug, Default)]
pub struct PipelineStage {
    pub start_lsn: AtomicU64,
    pub end_lsn: AtomicU64,
    pub ready: AtomicBool,
    pub num_replaying_threads: AtomicU32,
    work: AtomicU64,
    pub completed_partitions: AtomicU32,
}

impl PipelineStage {
    /// Publish a window to the redo workers.
    pub fn publish(&self, start: u64, end: u64, threads: u32) {
        debug_assert!(!self.ready.load(Ordering::Relaxed));
        self.start_lsn.store(start, Ordering::Relaxed);
        self.end_lsn.store(end, Ordering::Relaxed);
        self.completed_partitions.store(0, Ordering::Relaxed);
        self.num_replaying_threads.store(threads, Ordering::Relaxed);
        let generation = (self.work.load(Ordering::Relaxed) >> 32) + 1;
        self.work.store(generation << 32, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
    }

    /// Claim the next partition, `None` when this publication is drained or
    /// the caller's view of the stage is stale.
    pub fn claim_partition(&self, partitions: u32) -> Option<u32> {
        loop {
            if !self.ready.load(Ordering::Acquire) {
                return None;
            }
            let work = self.work.load(Ordering::Acquire);
            let partition = (work & u64::from(u32::MAX)) as u32;
            if partition >= partitions {
                return None;
            }
            if self
                .work
                .compare_exchange_weak(work, work + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(partition);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplicationControl {
    shutdown: AtomicBool,
    /// Backup: everything below this offset has been applied to the store.
    pub replayed_lsn_offset: AtomicU64,
    /// Backup: everything below this offset is on durable storage. Advanced
    /// only by the flusher; deliberately distinct from the log manager's own
    /// durable LSN because segment rotation transiently remaps offsets.
    pub persisted_lsn_offset: AtomicU64,
    /// Backup: NVRAM persistence horizon.
    pub persisted_nvram_offset: AtomicU64,
    /// Backup: bytes persisted-on-replay since the last window reset.
    pub persisted_nvram_size: AtomicU64,
    /// Backup: receive daemon hands the flusher its target through this.
    pub new_end_lsn_offset: AtomicU64,
    /// Primary: bytes shipped to all backups.
    pub shipped_log_size: AtomicU64,
    /// Backup: bytes received from the primary.
    pub received_log_size: AtomicU64,
    pub stages: [PipelineStage; 2],
    pub bg_replay_mutex: Mutex<()>,
    pub bg_replay_cond: Condvar,
}

impl ReplicationControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.bg_replay_cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Poll a counter until it reaches `target` or the timeout elapses.
    /// Test and bootstrap helper; daemons use their own loops.
    pub fn wait_counter_at_least(
        &self,
        counter: &AtomicU64,
        target: u64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while counter.load(Ordering::Acquire) < target {
            if self.is_shutdown() || Instant::now() >= deadline {
                return counter.load(Ordering::Acquire) >= target;
            }
            std::thread::yield_now();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineStage, ReplicationControl};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn stage_publication_resets_progress_counters() {
        let stage = PipelineStage::default();
        stage.publish(100, 200, 4);
        assert_eq!(stage.start_lsn.load(Ordering::Relaxed), 100);
        assert_eq!(stage.end_lsn.load(Ordering::Relaxed), 200);
        assert_eq!(stage.completed_partitions.load(Ordering::Relaxed), 0);
        assert!(stage.ready.load(Ordering::Relaxed));

        // Partitions are claimed exactly once per publication.
        let mut claimed = Vec::new();
        while let Some(p) = stage.claim_partition(4) {
            claimed.push(p);
        }
        assert_eq!(claimed, vec![0, 1, 2, 3]);
        assert!(stage.claim_partition(4).is_none());

        stage.ready.store(false, Ordering::Release);
        stage.publish(200, 300, 4);
        assert_eq!(stage.claim_partition(4), Some(0), "fresh generation restarts");
    }

    #[test]
    fn counter_wait_times_out_without_progress() {
        let ctrl = ReplicationControl::new();
        assert!(!ctrl.wait_counter_at_least(
            &ctrl.replayed_lsn_offset,
            10,
            Duration::from_millis(20)
        ));
        ctrl.replayed_lsn_offset.store(10, Ordering::Release);
        assert!(ctrl.wait_counter_at_least(
            &ctrl.replayed_lsn_offset,
            10,
            Duration::from_millis(20)
        ));
    }
}
