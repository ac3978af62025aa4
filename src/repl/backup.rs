//! Replication backup: bootstrap from the primary's startup metadata, then
//! receive, persist and replay shipped log windows.
//!
//! Three offsets tell the whole story: `replayed_lsn_offset` (applied to
//! the local store), `persisted_lsn_offset` (on durable storage) and
//! `persisted_nvram_offset` (NVRAM horizon). Replay may run ahead of the
//! flusher — redo reads from the log arena, not from disk.

use crate::config::{MvoltConfig, NvramDelayType, PersistPolicy, ReplayPolicy};
use crate::error::MvoltError;
use crate::index::KeyIndex;
use crate::log::checkpoint::{install_rows, load_rows};
use crate::log::manager::LogManager;
use crate::log::record::{RecordKind, scan_window};
use crate::log::segment::{chkpt_data_name, chkpt_marker_name};
use crate::repl::{PipelineStage, ReplicationControl};
use crate::repl::primary::{StartMetadata, WindowHeader};
use crate::store::OidTable;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const REPLAY_BOUNDS_FILE: &str = "replay_bounds";

struct BackupShared {
    ctrl: Arc<ReplicationControl>,
    /// Bootstrap base: offsets below this never materialized locally.
    base: std::sync::atomic::AtomicU64,
    log: LogManager,
    store: Arc<OidTable>,
    index: Arc<dyn KeyIndex>,
    persist_policy: PersistPolicy,
    replay_policy: ReplayPolicy,
    nvram_log_buffer: bool,
    persist_nvram_on_replay: bool,
    nvram_delay_type: NvramDelayType,
    partitions: u32,
    replay_threads: u32,
    group_commit_bytes: usize,
}

pub struct ReplicationBackup {
    shared: Arc<BackupShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ReplicationBackup {
    /// Connect to the primary, materialize its consistent starting point,
    /// and start the receive/flush/replay daemons.
    pub fn start(
        log: LogManager,
        store: Arc<OidTable>,
        index: Arc<dyn KeyIndex>,
        ctrl: Arc<ReplicationControl>,
        cfg: &MvoltConfig,
    ) -> Result<Self, MvoltError> {
        let addr = cfg.primary_addr.as_deref().ok_or(MvoltError::InvalidConfig {
            message: "backup requires primary_addr".into(),
        })?;
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        let shared = Arc::new(BackupShared {
            ctrl,
            base: std::sync::atomic::AtomicU64::new(0),
            log,
            store,
            index,
            persist_policy: cfg.persist_policy,
            replay_policy: cfg.replay_policy,
            nvram_log_buffer: cfg.nvram_log_buffer,
            persist_nvram_on_replay: cfg.persist_nvram_on_replay,
            nvram_delay_type: cfg.nvram_delay_type,
            partitions: cfg.log_redo_partitions,
            replay_threads: cfg.replay_threads,
            group_commit_bytes: cfg.group_commit_bytes,
        });

        bootstrap(&shared, &mut stream)?;

        let mut threads = Vec::new();
        {
            let shared = Arc::clone(&shared);
            threads.push(
                std::thread::Builder::new()
                    .name("mvolt-backup-recv".into())
                    .spawn(move || receive_daemon(&shared, stream))
                    .expect("spawn receive daemon"),
            );
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(
                std::thread::Builder::new()
                    .name("mvolt-backup-flush".into())
                    .spawn(move || flush_daemon(&shared))
                    .expect("spawn flush daemon"),
            );
        }
        if shared.replay_policy != ReplayPolicy::None
            && shared.persist_policy != PersistPolicy::Async
        {
            for i in 0..shared.replay_threads {
                let shared = Arc::clone(&shared);
                threads.push(
                    std::thread::Builder::new()
                        .name(format!("mvolt-backup-redo-{i}"))
                        .spawn(move || redo_worker(&shared))
                        .expect("spawn redo worker"),
                );
            }
        }
        if shared.replay_policy == ReplayPolicy::Background {
            let shared = Arc::clone(&shared);
            threads.push(
                std::thread::Builder::new()
                    .name("mvolt-backup-bg-replay".into())
                    .spawn(move || background_replay(&shared))
                    .expect("spawn background replayer"),
            );
        }

        Ok(Self { shared, threads })
    }

    pub fn replayed_offset(&self) -> u64 {
        self.shared.ctrl.replayed_lsn_offset.load(Ordering::Acquire)
    }

    pub fn persisted_offset(&self) -> u64 {
        self.shared.ctrl.persisted_lsn_offset.load(Ordering::Acquire)
    }

    pub fn wait_replayed_at_least(&self, offset: u64, timeout: Duration) -> bool {
        self.shared.ctrl.wait_counter_at_least(
            &self.shared.ctrl.replayed_lsn_offset,
            offset,
            timeout,
        )
    }

    pub fn wait_persisted_at_least(&self, offset: u64, timeout: Duration) -> bool {
        self.shared.ctrl.wait_counter_at_least(
            &self.shared.ctrl.persisted_lsn_offset,
            offset,
            timeout,
        )
    }

    /// Join the daemons; the shared shutdown flag must already be set.
    pub fn shutdown(&mut self) {
        debug_assert!(self.shared.ctrl.is_shutdown());
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        tracing::info!(
            received = self.shared.ctrl.received_log_size.load(Ordering::Relaxed),
            replayed = self.replayed_offset(),
            "replication backup stopped"
        );
    }
}

/// Consume the startup metadata blob: checkpoint rows, segment tails, and
/// counter initialization. Leaves the stream positioned at window traffic.
fn bootstrap(shared: &BackupShared, stream: &mut TcpStream) -> Result<(), MvoltError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let blob_len = u32::from_be_bytes(len_buf) as usize;
    let mut blob = vec![0u8; blob_len];
    stream.read_exact(&mut blob)?;
    let metadata: StartMetadata =
        serde_json::from_slice(&blob).map_err(|e| MvoltError::Decode(e.to_string()))?;
    tracing::info!(
        chkpt = metadata.chkpt_start_offset,
        durable = metadata.durable_offset,
        segments = metadata.segments.len(),
        "backup bootstrap metadata received"
    );

    shared.log.reset_to(metadata.chkpt_start_offset);
    shared
        .base
        .store(metadata.chkpt_start_offset.max(1), Ordering::Release);

    if metadata.chkpt_size > 0 {
        let mut chkpt = vec![0u8; metadata.chkpt_size as usize];
        stream.read_exact(&mut chkpt)?;
        let dir = shared.log.segment_store().dir().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(chkpt_data_name(metadata.chkpt_start_offset)), &chkpt)?;
        File::create(dir.join(chkpt_marker_name(metadata.chkpt_start_offset)))?;
        let rows = load_rows(&chkpt)?;
        install_rows(&rows, &shared.store, shared.index.as_ref())?;
        tracing::info!(rows = rows.len(), "checkpoint installed");
    }

    for tail in &metadata.segments {
        let lo = tail.start.max(metadata.chkpt_start_offset);
        let mut bytes = vec![0u8; tail.tail_size as usize];
        stream.read_exact(&mut bytes)?;
        shared.log.install_replicated(lo, &bytes);
    }

    // Roll the post-checkpoint tail forward so reads see a consistent
    // state before live windows arrive.
    let committed = shared.log.committed_offset();
    let next = redo_range(shared, metadata.chkpt_start_offset, committed, None)?;
    let durable = shared.log.flush()?;

    let ctrl = &shared.ctrl;
    ctrl.replayed_lsn_offset.store(next, Ordering::Release);
    ctrl.persisted_lsn_offset.store(durable, Ordering::Release);
    ctrl.persisted_nvram_offset.store(durable, Ordering::Release);
    ctrl.persisted_nvram_size.store(0, Ordering::Release);
    ctrl.new_end_lsn_offset.store(durable, Ordering::Release);
    Ok(())
}

/// Read exactly `buf.len()` bytes, tolerating read timeouts so the daemon
/// can observe shutdown between messages. Returns false on EOF/shutdown.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    ctrl: &ReplicationControl,
) -> std::io::Result<bool> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if ctrl.is_shutdown() {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn receive_daemon(shared: &BackupShared, mut stream: TcpStream) {
    if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(100))) {
        tracing::warn!(error = %e, "receive daemon could not set read timeout");
    }
    let mut stage_toggle = 0usize;
    let mut bounds_file: Option<File> = None;
    while !shared.ctrl.is_shutdown() {
        let mut header_buf = [0u8; 25];
        match read_full(&mut stream, &mut header_buf, &shared.ctrl) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(error = %e, "receive daemon read failed");
                break;
            }
        }
        let header = match WindowHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "corrupt window header, stopping receive");
                break;
            }
        };
        let mut bytes = vec![0u8; header.len as usize];
        match read_full(&mut stream, &mut bytes, &shared.ctrl) {
            Ok(true) => {}
            _ => break,
        }

        // A re-shipped prefix the bootstrap already materialized is clamped
        // away; the log manager applies the same trim to the bytes.
        let start = header.start.max(shared.base.load(Ordering::Acquire));
        let end = header.start + u64::from(header.len);
        shared
            .ctrl
            .received_log_size
            .fetch_add(u64::from(header.len), Ordering::Relaxed);
        shared.log.install_replicated(header.start, &bytes);
        if end > start {
            let fresh = &bytes[(start - header.start) as usize..];
            process_log_data(shared, &mut stage_toggle, &mut bounds_file, start, end, fresh);
        }

        if shared.persist_policy != PersistPolicy::Async {
            let ack = if shared.nvram_log_buffer {
                shared.ctrl.persisted_nvram_offset.load(Ordering::Acquire)
            } else {
                shared.ctrl.persisted_lsn_offset.load(Ordering::Acquire)
            };
            if let Err(e) = stream.write_all(&ack.to_be_bytes()) {
                tracing::warn!(error = %e, "persistence ack failed");
                break;
            }
        }
    }
    tracing::info!("backup receive daemon exiting");
}

/// Window admission: stage publication (or bounds spill), NVRAM handling,
/// and the policy-dependent persistence/replay waits.
fn process_log_data(
    shared: &BackupShared,
    stage_toggle: &mut usize,
    bounds_file: &mut Option<File>,
    start: u64,
    end: u64,
    bytes: &[u8],
) {
    let ctrl = &shared.ctrl;
    ctrl.new_end_lsn_offset.store(end, Ordering::Release);

    if shared.persist_policy != PersistPolicy::Async {
        match shared.replay_policy {
            ReplayPolicy::Sync | ReplayPolicy::Pipelined => {
                let stage = &ctrl.stages[*stage_toggle];
                *stage_toggle ^= 1;
                wait_stage_free(ctrl, stage);
                stage.publish(start, end, shared.replay_threads);
            }
            ReplayPolicy::Background => {
                if append_bounds(shared, bounds_file, start, end).is_ok() {
                    ctrl.bg_replay_cond.notify_all();
                } else {
                    tracing::error!("failed to spill replay bounds");
                }
            }
            ReplayPolicy::None => {}
        }
    }

    if shared.nvram_log_buffer {
        let size = end - start;
        if shared.persist_nvram_on_replay {
            while ctrl.persisted_nvram_size.load(Ordering::Acquire) < size {
                if ctrl.is_shutdown() {
                    return;
                }
                std::thread::yield_now();
            }
            ctrl.persisted_nvram_size.store(0, Ordering::Release);
        } else {
            nvram_delay(shared.nvram_delay_type, bytes);
        }
        ctrl.persisted_nvram_offset.store(end, Ordering::Release);
    } else {
        while end > ctrl.persisted_lsn_offset.load(Ordering::Acquire) {
            if ctrl.is_shutdown() {
                return;
            }
            std::thread::yield_now();
        }
    }

    if shared.replay_policy == ReplayPolicy::Sync && shared.persist_policy != PersistPolicy::Async
    {
        while ctrl.replayed_lsn_offset.load(Ordering::Acquire) < end {
            if ctrl.is_shutdown() {
                return;
            }
            std::thread::yield_now();
        }
        tracing::debug!(start, end, "window rolled forward");
    }
}

fn wait_stage_free(ctrl: &ReplicationControl, stage: &PipelineStage) {
    while stage.ready.load(Ordering::Acquire) {
        if ctrl.is_shutdown() {
            return;
        }
        std::thread::yield_now();
    }
}

fn append_bounds(
    shared: &BackupShared,
    bounds_file: &mut Option<File>,
    start: u64,
    end: u64,
) -> std::io::Result<()> {
    if bounds_file.is_none() {
        let dir = shared.log.segment_store().dir();
        std::fs::create_dir_all(dir)?;
        *bounds_file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(REPLAY_BOUNDS_FILE))?,
        );
    }
    let file = bounds_file.as_mut().expect("bounds file just opened");
    let mut rec = [0u8; 16];
    rec[0..8].copy_from_slice(&start.to_be_bytes());
    rec[8..16].copy_from_slice(&end.to_be_bytes());
    file.write_all(&rec)?;
    file.sync_data()
}

/// Watch `new_end_lsn_offset` and keep durable storage caught up. A
/// separate counter (not the log's durable LSN) feeds the ack path so
/// segment rotation cannot transiently confuse it.
fn flush_daemon(shared: &BackupShared) {
    let ctrl = &shared.ctrl;
    while !ctrl.is_shutdown() {
        let target = ctrl.new_end_lsn_offset.load(Ordering::Acquire);
        if target > ctrl.persisted_lsn_offset.load(Ordering::Acquire) {
            match shared.log.flush_until(target) {
                Ok(durable) => {
                    ctrl.persisted_lsn_offset
                        .fetch_max(durable, Ordering::AcqRel);
                }
                Err(e) => {
                    tracing::error!(error = %e, "backup log flush failed");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    tracing::info!("backup flush daemon exiting");
}

/// OID-parallel redo worker: claim partitions of whichever stage is ready,
/// and let the last finisher publish the replayed offset.
fn redo_worker(shared: &BackupShared) {
    let ctrl = &shared.ctrl;
    while !ctrl.is_shutdown() {
        let mut worked = false;
        for stage in &ctrl.stages {
            while let Some(partition) = stage.claim_partition(shared.partitions) {
                // Bounds are stable from claim until this worker reports
                // completion; republication waits on the completed count.
                let start = stage.start_lsn.load(Ordering::Relaxed);
                let end = stage.end_lsn.load(Ordering::Relaxed);
                worked = true;
                if let Err(e) = redo_range(shared, start, end, Some(partition)) {
                    tracing::error!(error = %e, partition, "redo failed");
                }
                let done = stage.completed_partitions.fetch_add(1, Ordering::AcqRel) + 1;
                if done == shared.partitions {
                    ctrl.replayed_lsn_offset.fetch_max(end, Ordering::AcqRel);
                    if shared.nvram_log_buffer && shared.persist_nvram_on_replay {
                        // Redo is the persistence agent under persist-on-replay.
                        ctrl.persisted_nvram_size
                            .fetch_add(end - start, Ordering::AcqRel);
                    }
                    stage.ready.store(false, Ordering::Release);
                    ctrl.bg_replay_cond.notify_all();
                }
            }
        }
        if !worked {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
    tracing::info!("backup redo worker exiting");
}

/// Background replayer. Under async persistence it tails the durable LSN
/// directly in group-commit-sized bites; otherwise it reads stage bounds
/// from the side file and drives the redo workers.
fn background_replay(shared: &BackupShared) {
    let ctrl = &shared.ctrl;
    if shared.persist_policy == PersistPolicy::Async {
        let mut start = ctrl.replayed_lsn_offset.load(Ordering::Acquire);
        while !ctrl.is_shutdown() {
            let durable = shared.log.durable_offset();
            let end = durable.min(start + shared.group_commit_bytes as u64);
            if end > start {
                match redo_range(shared, start, end, None) {
                    Ok(next) => {
                        debug_assert!(next >= start);
                        ctrl.replayed_lsn_offset.fetch_max(next, Ordering::AcqRel);
                        if next > start {
                            start = next;
                        } else {
                            // Partial trailing record; wait for more bytes.
                            std::thread::sleep(Duration::from_micros(200));
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "background redo failed");
                        return;
                    }
                }
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    } else {
        let dir = shared.log.segment_store().dir().to_path_buf();
        let path = dir.join(REPLAY_BOUNDS_FILE);
        let mut cursor = 0u64;
        let mut stage_toggle = 0usize;
        while !ctrl.is_shutdown() {
            let Some((start, end)) = read_bounds_at(&path, &mut cursor, ctrl) else {
                continue;
            };
            // Redo reads from the log arena; make sure the bytes are also
            // durable before marking the stage ready.
            while shared.log.durable_offset() < end {
                if ctrl.is_shutdown() {
                    return;
                }
                std::thread::yield_now();
            }
            let stage = &ctrl.stages[stage_toggle];
            stage_toggle ^= 1;
            wait_stage_free(ctrl, stage);
            stage.publish(start, end, shared.replay_threads);
            while ctrl.replayed_lsn_offset.load(Ordering::Acquire) < end {
                if ctrl.is_shutdown() {
                    return;
                }
                let mut lock = ctrl.bg_replay_mutex.lock();
                let _ = ctrl
                    .bg_replay_cond
                    .wait_for(&mut lock, Duration::from_millis(10));
            }
        }
    }
    tracing::info!("background replayer exiting");
}

/// Read one 16-byte bounds record at the cursor, waiting on the shared
/// condition when the read comes up short.
fn read_bounds_at(
    path: &std::path::Path,
    cursor: &mut u64,
    ctrl: &ReplicationControl,
) -> Option<(u64, u64)> {
    loop {
        if ctrl.is_shutdown() {
            return None;
        }
        let mut rec = [0u8; 16];
        let got = File::open(path).ok().and_then(|mut f| {
            f.seek(SeekFrom::Start(*cursor)).ok()?;
            let mut filled = 0usize;
            while filled < rec.len() {
                match f.read(&mut rec[filled..]) {
                    Ok(0) => return None,
                    Ok(n) => filled += n,
                    Err(_) => return None,
                }
            }
            Some(rec)
        });
        match got {
            Some(rec) => {
                *cursor += 16;
                let start = u64::from_be_bytes(rec[0..8].try_into().expect("slice len"));
                let end = u64::from_be_bytes(rec[8..16].try_into().expect("slice len"));
                return Some((start, end));
            }
            None => {
                let mut lock = ctrl.bg_replay_mutex.lock();
                let _ = ctrl
                    .bg_replay_cond
                    .wait_for(&mut lock, Duration::from_millis(10));
            }
        }
    }
}

fn redo_range(
    shared: &BackupShared,
    start: u64,
    end: u64,
    partition: Option<u32>,
) -> Result<u64, MvoltError> {
    apply_log_window(
        &shared.log,
        &shared.store,
        shared.index.as_ref(),
        shared.partitions,
        partition,
        start,
        end,
    )
}

/// Apply `[start, end)` from the log arena to a store. With a partition,
/// only records whose OID hashes into it are applied. Returns the absolute
/// offset of the first unconsumed byte, which trails `end` exactly when the
/// window ends in a partial record.
pub(crate) fn apply_log_window(
    log: &LogManager,
    store: &OidTable,
    index: &dyn KeyIndex,
    partitions: u32,
    partition: Option<u32>,
    start: u64,
    end: u64,
) -> Result<u64, MvoltError> {
    if end <= start {
        return Ok(start);
    }
    let (bytes, _) = log.read_window(start, (end - start) as usize);
    let guard = crossbeam_epoch::pin();
    let consumed = scan_window(&bytes, |at, record| {
        if let Some(p) = partition
            && record.oid % partitions != p
        {
            return;
        }
        let lsn = log.lsn_at(start + at as u64);
        match record.kind {
            RecordKind::Insert => {
                store.install_replayed(record.oid, lsn, &record.payload, &guard);
                store.reserve_past(record.oid);
                index.insert_if_absent(&record.key, record.oid);
            }
            RecordKind::Update => {
                store.install_replayed(record.oid, lsn, &record.payload, &guard);
            }
            RecordKind::Skip => {}
        }
    })
    .map_err(|e| MvoltError::Corruption(format!("redo at {start:#x}: {e}")))?;
    Ok(start + consumed as u64)
}

/// Emulate NVRAM persistence latency for a window.
fn nvram_delay(kind: NvramDelayType, bytes: &[u8]) {
    match kind {
        NvramDelayType::Clflush => {
            // Touch every cache line the window occupies.
            let mut i = 0usize;
            while i < bytes.len() {
                unsafe { std::ptr::read_volatile(&bytes[i]) };
                i += 64;
            }
        }
        NvramDelayType::ClwbEmu => {
            // Model write-back cost at a fixed per-line latency.
            let lines = bytes.len().div_ceil(64) as u64;
            let budget = Duration::from_nanos(lines * 50);
            let begin = Instant::now();
            while begin.elapsed() < budget {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::nvram_delay;
    use crate::config::NvramDelayType;

    #[test]
    fn nvram_delay_touches_every_line() {
        let window = vec![0xAAu8; 4096];
        nvram_delay(NvramDelayType::Clflush, &window);
        nvram_delay(NvramDelayType::ClwbEmu, &window[..64]);
    }
}
