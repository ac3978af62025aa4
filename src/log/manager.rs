//! Log manager: monotonic LSN reservation, per-transaction staged logs,
//! a byte-addressable in-memory log arena, and flushing to segment files.
//!
//! Reservations hand out disjoint offset ranges by a single `fetch_add`.
//! A range becomes part of the *committed prefix* once its transaction
//! either commits (its encoded records land in the arena) or discards (a
//! skip record blankets the range). The contiguous committed prefix is what
//! ships to backups and what the flusher persists; holes left by in-flight
//! transactions hold both watermarks back until they resolve.

use crate::fatptr::{INVALID_LSN, INVALID_SIZE_CODE, Lsn};
use crate::log::record::{LogRecord, RecordKind, SKIP_MIN_BYTES, encode_skip};
use crate::log::segment::SegmentStore;
use crate::store::Oid;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The only file id this core logs under.
pub const FID_CORE: u32 = 1;

/// First usable log offset; offset zero is the invalid LSN.
pub const LOG_BASE_OFFSET: u64 = 1;

struct Arena {
    bytes: Vec<u8>,
}

impl Arena {
    fn write(&mut self, offset: u64, data: &[u8]) {
        let idx = (offset - LOG_BASE_OFFSET) as usize;
        if self.bytes.len() < idx + data.len() {
            self.bytes.resize(idx + data.len(), 0);
        }
        self.bytes[idx..idx + data.len()].copy_from_slice(data);
    }

    fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let idx = (offset - LOG_BASE_OFFSET) as usize;
        self.bytes[idx..idx + len].to_vec()
    }
}

struct LogInner {
    segments: SegmentStore,
    cur: AtomicU64,
    committed: AtomicU64,
    durable: AtomicU64,
    arena: Mutex<Arena>,
    completions: Mutex<BTreeMap<u64, u64>>,
    flush_lock: Mutex<()>,
    closed: AtomicBool,
}

impl LogInner {
    fn mark_complete(&self, start: u64, end: u64) {
        let mut completions = self.completions.lock();
        completions.insert(start, end);
        let mut committed = self.committed.load(Ordering::Relaxed);
        while let Some((&s, &e)) = completions.first_key_value() {
            if s != committed {
                break;
            }
            completions.remove(&s);
            committed = e;
        }
        self.committed.store(committed, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct LogManager {
    inner: Arc<LogInner>,
}

impl LogManager {
    pub fn new(dir: impl AsRef<Path>, segment_bytes: u64) -> Self {
        Self {
            inner: Arc::new(LogInner {
                segments: SegmentStore::new(dir.as_ref(), segment_bytes),
                cur: AtomicU64::new(LOG_BASE_OFFSET),
                committed: AtomicU64::new(LOG_BASE_OFFSET),
                durable: AtomicU64::new(LOG_BASE_OFFSET),
                arena: Mutex::new(Arena { bytes: Vec::new() }),
                completions: Mutex::new(BTreeMap::new()),
                flush_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn segment_store(&self) -> &SegmentStore {
        &self.inner.segments
    }

    /// Tagged LSN for an absolute log offset.
    pub fn lsn_at(&self, offset: u64) -> Lsn {
        Lsn::make(
            offset,
            self.inner.segments.segment_of(offset) % crate::fatptr::MAX_SEGMENTS,
            INVALID_SIZE_CODE,
        )
    }

    /// Highest LSN reserved so far.
    pub fn cur_lsn(&self) -> Lsn {
        self.lsn_at(self.inner.cur.load(Ordering::Acquire))
    }

    /// Highest LSN guaranteed persistent in segment files.
    pub fn durable_flushed_lsn(&self) -> Lsn {
        self.lsn_at(self.inner.durable.load(Ordering::Acquire))
    }

    pub fn durable_offset(&self) -> u64 {
        self.inner.durable.load(Ordering::Acquire)
    }

    /// End of the contiguous committed prefix.
    pub fn committed_offset(&self) -> u64 {
        self.inner.committed.load(Ordering::Acquire)
    }

    /// Refuse all further reservations; in-flight pre-commits fail with the
    /// invalid LSN and their transactions abort internally.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn new_tx_log(&self) -> TxLog {
        TxLog {
            inner: Arc::clone(&self.inner),
            records: Vec::new(),
            staged: Vec::new(),
            reserved: None,
            finalized: false,
        }
    }

    /// Copy out `[start, min(committed, start+max))` for shipping or redo.
    /// The returned end is the absolute offset one past the last byte.
    pub fn read_window(&self, start: u64, max: usize) -> (Vec<u8>, u64) {
        let committed = self.committed_offset();
        let end = committed.min(start + max as u64);
        if end <= start {
            return (Vec::new(), start);
        }
        let bytes = self.inner.arena.lock().read(start, (end - start) as usize);
        (bytes, end)
    }

    /// Persist the committed prefix up to `target` into segment files and
    /// advance the durable marker. Returns the new durable offset.
    pub fn flush_until(&self, target: u64) -> io::Result<u64> {
        let _flush = self.inner.flush_lock.lock();
        let target = target.min(self.committed_offset());
        let durable = self.inner.durable.load(Ordering::Acquire);
        if target <= durable {
            return Ok(durable);
        }
        let bytes = self
            .inner
            .arena
            .lock()
            .read(durable, (target - durable) as usize);
        self.inner.segments.write_range(durable, &bytes)?;
        self.inner.segments.set_durable_marker(target)?;
        self.inner.durable.store(target, Ordering::Release);
        tracing::debug!(from = durable, to = target, "log flushed");
        Ok(target)
    }

    /// Persist everything committed so far.
    pub fn flush(&self) -> io::Result<u64> {
        self.flush_until(self.committed_offset())
    }

    /// Accept a replicated window at an absolute offset (backup receive
    /// path). The bytes are already finalized on the primary. A window
    /// overlapping the local base (a re-ship of bytes the bootstrap
    /// already materialized) is trimmed to the unseen suffix.
    pub fn install_replicated(&self, start: u64, bytes: &[u8]) {
        let end = start + bytes.len() as u64;
        let committed = self.committed_offset();
        let (start, bytes) = if start < committed {
            if end <= committed {
                return;
            }
            (committed, &bytes[(committed - start) as usize..])
        } else {
            (start, bytes)
        };
        if bytes.is_empty() {
            return;
        }
        self.inner.arena.lock().write(start, bytes);
        self.inner.cur.fetch_max(end, Ordering::AcqRel);
        self.inner.mark_complete(start, end);
    }

    /// Rebase an empty manager at `offset` (backup bootstrap: everything
    /// before the checkpoint start never materializes locally).
    pub fn reset_to(&self, offset: u64) {
        let offset = offset.max(LOG_BASE_OFFSET);
        self.inner.cur.store(offset, Ordering::Release);
        self.inner.committed.store(offset, Ordering::Release);
        self.inner.durable.store(offset, Ordering::Release);
    }

    /// Rebuild in-memory state from the segment files referenced by the
    /// durable marker. Returns the recovered durable offset.
    pub fn recover(&self) -> io::Result<u64> {
        let durable = self
            .inner
            .segments
            .durable_marker()?
            .unwrap_or(LOG_BASE_OFFSET)
            .max(LOG_BASE_OFFSET);
        if durable > LOG_BASE_OFFSET {
            let len = (durable - LOG_BASE_OFFSET) as usize;
            let bytes = self.inner.segments.read_range(LOG_BASE_OFFSET, len)?;
            self.inner.arena.lock().write(LOG_BASE_OFFSET, &bytes);
        }
        self.inner.cur.store(durable, Ordering::Release);
        self.inner.committed.store(durable, Ordering::Release);
        self.inner.durable.store(durable, Ordering::Release);
        tracing::info!(durable, "log recovered");
        Ok(durable)
    }
}

/// Per-transaction staged redo log. Records accumulate in memory; nothing
/// touches the shared arena until the commit/discard decision.
pub struct TxLog {
    inner: Arc<LogInner>,
    records: Vec<LogRecord>,
    staged: Vec<u8>,
    reserved: Option<(u64, u64)>,
    finalized: bool,
}

impl TxLog {
    /// Stage an insert (carries the key for backup index replay).
    pub fn log_insert(&mut self, fid: u32, oid: Oid, key: &[u8], payload: &[u8]) {
        debug_assert!(self.reserved.is_none());
        self.records
            .push(LogRecord::insert(fid, oid, key.to_vec(), payload.to_vec()));
    }

    /// Stage an update. A repeated update of the same OID replaces the
    /// staged record, mirroring the in-flight version that replaced its
    /// predecessor in the chain.
    pub fn log_update(&mut self, fid: u32, oid: Oid, payload: &[u8]) {
        debug_assert!(self.reserved.is_none());
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.kind == RecordKind::Update && r.oid == oid && r.fid == fid)
        {
            existing.payload = payload.to_vec();
            return;
        }
        self.records.push(LogRecord::update(fid, oid, payload.to_vec()));
    }

    pub fn staged_records(&self) -> usize {
        self.records.len()
    }

    /// Reserve the commit LSN. Returns the invalid LSN when the log is
    /// closed. Idempotent: a second call returns the same LSN.
    pub fn pre_commit(&mut self) -> Lsn {
        if let Some((_, end)) = self.reserved {
            return self.end_lsn(end);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return INVALID_LSN;
        }
        self.staged.clear();
        for record in &self.records {
            record.encode_into(&mut self.staged);
        }
        if self.staged.is_empty() {
            // Read-only transactions still need a unique commit stamp.
            self.staged = encode_skip(SKIP_MIN_BYTES);
        }
        let len = self.staged.len() as u64;
        let start = self.inner.cur.fetch_add(len, Ordering::AcqRel);
        self.reserved = Some((start, start + len));
        self.end_lsn(start + len)
    }

    fn end_lsn(&self, end: u64) -> Lsn {
        Lsn::make(
            end,
            self.inner.segments.segment_of(end) % crate::fatptr::MAX_SEGMENTS,
            INVALID_SIZE_CODE,
        )
    }

    /// Finalize the reservation with the staged records. Callable only
    /// after a successful `pre_commit`.
    pub fn commit(&mut self) {
        let (start, _end) = self.reserved.expect("commit without pre_commit");
        if self.finalized {
            return;
        }
        self.inner.arena.lock().write(start, &self.staged);
        self.inner.mark_complete(start, start + self.staged.len() as u64);
        self.finalized = true;
    }

    /// Void the staged transaction. With a reservation outstanding the
    /// range is blanketed by a skip record so the committed prefix can move
    /// past it.
    pub fn discard(&mut self) {
        if self.finalized {
            return;
        }
        if let Some((start, end)) = self.reserved {
            let skip = encode_skip((end - start) as usize);
            self.inner.arena.lock().write(start, &skip);
            self.inner.mark_complete(start, end);
            self.finalized = true;
        } else {
            self.records.clear();
            self.staged.clear();
        }
    }
}

impl Drop for TxLog {
    fn drop(&mut self) {
        // An abandoned reservation would wedge the committed prefix.
        if self.reserved.is_some() && !self.finalized {
            self.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FID_CORE, LOG_BASE_OFFSET, LogManager};
    use crate::log::record::{Decoded, decode_one, scan_window};
    use tempfile::tempdir;

    #[test]
    fn commit_advances_the_contiguous_prefix() {
        let dir = tempdir().expect("tempdir");
        let log = LogManager::new(dir.path(), 1 << 20);
        assert_eq!(log.committed_offset(), LOG_BASE_OFFSET);

        let mut t1 = log.new_tx_log();
        t1.log_update(FID_CORE, 7, b"a");
        let mut t2 = log.new_tx_log();
        t2.log_update(FID_CORE, 8, b"b");

        let l1 = t1.pre_commit();
        let l2 = t2.pre_commit();
        assert!(l1.offset() < l2.offset(), "reservations are ordered");

        // Committing the later reservation first leaves a hole.
        t2.commit();
        assert_eq!(log.committed_offset(), LOG_BASE_OFFSET);
        t1.commit();
        assert_eq!(log.committed_offset(), l2.offset());
    }

    #[test]
    fn discard_blankets_the_reservation_with_a_skip() {
        let dir = tempdir().expect("tempdir");
        let log = LogManager::new(dir.path(), 1 << 20);

        let mut aborted = log.new_tx_log();
        aborted.log_update(FID_CORE, 1, b"doomed");
        let _ = aborted.pre_commit();
        aborted.discard();

        let mut committed = log.new_tx_log();
        committed.log_update(FID_CORE, 2, b"live");
        let end = committed.pre_commit();
        committed.commit();
        assert_eq!(log.committed_offset(), end.offset());

        let (window, _) = log.read_window(LOG_BASE_OFFSET, usize::MAX >> 1);
        let mut oids = Vec::new();
        let next = scan_window(&window, |_, r| oids.push(r.oid)).expect("scan");
        assert_eq!(next, window.len());
        assert_eq!(oids, vec![2], "skip record hides the discarded update");
    }

    #[test]
    fn read_only_transactions_get_unique_stamps() {
        let dir = tempdir().expect("tempdir");
        let log = LogManager::new(dir.path(), 1 << 20);
        let mut a = log.new_tx_log();
        let mut b = log.new_tx_log();
        let la = a.pre_commit();
        let lb = b.pre_commit();
        assert_ne!(la.offset(), lb.offset());
        a.commit();
        b.commit();

        let (window, _) = log.read_window(LOG_BASE_OFFSET, 1 << 20);
        assert!(matches!(decode_one(&window).expect("skip"), Decoded::Skip(_)));
    }

    #[test]
    fn closed_log_refuses_reservations() {
        let dir = tempdir().expect("tempdir");
        let log = LogManager::new(dir.path(), 1 << 20);
        log.close();
        let mut tx = log.new_tx_log();
        tx.log_update(FID_CORE, 1, b"x");
        assert!(tx.pre_commit().is_invalid());
    }

    #[test]
    fn flush_recover_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let committed_end;
        {
            let log = LogManager::new(dir.path(), 128);
            let mut tx = log.new_tx_log();
            tx.log_insert(FID_CORE, 3, b"k", &[9u8; 200]);
            let end = tx.pre_commit();
            tx.commit();
            committed_end = end.offset();
            let durable = log.flush().expect("flush");
            assert_eq!(durable, committed_end);
            assert_eq!(log.durable_flushed_lsn().offset(), committed_end);
        }

        let log = LogManager::new(dir.path(), 128);
        let recovered = log.recover().expect("recover");
        assert_eq!(recovered, committed_end);
        let (window, end) = log.read_window(LOG_BASE_OFFSET, 1 << 20);
        assert_eq!(end, committed_end);
        let mut seen = Vec::new();
        scan_window(&window, |_, r| seen.push((r.oid, r.payload.len()))).expect("scan");
        assert_eq!(seen, vec![(3, 200)]);
    }

    #[test]
    fn dropped_reservation_does_not_wedge_the_watermark() {
        let dir = tempdir().expect("tempdir");
        let log = LogManager::new(dir.path(), 1 << 20);
        {
            let mut tx = log.new_tx_log();
            tx.log_update(FID_CORE, 1, b"x");
            let _ = tx.pre_commit();
            // Dropped without commit or discard.
        }
        let mut tx = log.new_tx_log();
        tx.log_update(FID_CORE, 2, b"y");
        let end = tx.pre_commit();
        tx.commit();
        assert_eq!(log.committed_offset(), end.offset());
    }
}
