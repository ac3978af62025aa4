//! A single tuple version: one node of an OID's version chain.

use crate::fatptr::{Asi, FatPtr, Lsn, Xid};
use crossbeam_epoch::{Atomic, Guard, Shared};
use std::sync::atomic::{AtomicU64, Ordering};

/// Chain node. `next` links toward older versions; all stamp fields are
/// single-word fat pointers. Once the creator commits, `clsn` is retagged
/// from the creator's XID to the commit LSN — that one store is the
/// publication point, after which only `sstamp` and `xstamp` may change.
pub struct Version {
    next: Atomic<Version>,
    /// Creator stamp: `Asi::Xid` while uncommitted, `Asi::Log` afterwards.
    clsn: AtomicU64,
    /// Commit offset of the overwriter; 0 until superseded.
    sstamp: AtomicU64,
    /// Latest reader access stamp.
    xstamp: AtomicU64,
    /// Reader-slot bitmap (serial safety net).
    readers: AtomicU64,
    payload: Box<[u8]>,
}

impl Version {
    /// A fresh uncommitted version owned by `creator`.
    pub fn new_dirty(creator: Xid, payload: Vec<u8>) -> Self {
        Self {
            next: Atomic::null(),
            clsn: AtomicU64::new(FatPtr::from_xid(creator).raw()),
            sstamp: AtomicU64::new(0),
            xstamp: AtomicU64::new(0),
            readers: AtomicU64::new(0),
            payload: payload.into_boxed_slice(),
        }
    }

    /// A version materialized from the log (backup replay, checkpoint load).
    pub fn new_committed(clsn: Lsn, payload: Vec<u8>) -> Self {
        Self {
            next: Atomic::null(),
            clsn: AtomicU64::new(clsn.to_fat_ptr().raw()),
            sstamp: AtomicU64::new(0),
            xstamp: AtomicU64::new(0),
            readers: AtomicU64::new(0),
            payload: payload.into_boxed_slice(),
        }
    }

    pub fn clsn(&self) -> FatPtr {
        FatPtr::from_raw(self.clsn.load(Ordering::Relaxed))
    }

    pub fn is_committed(&self) -> bool {
        self.clsn().asi() == Asi::Log
    }

    /// Retag the creator stamp to a commit LSN, making the version
    /// universally visible. Callers on the snapshot-isolation path follow
    /// this with a full fence.
    pub fn publish_clsn(&self, lsn: Lsn) {
        self.clsn.store(lsn.to_fat_ptr().raw(), Ordering::Release);
    }

    pub fn sstamp(&self) -> u64 {
        self.sstamp.load(Ordering::Relaxed)
    }

    /// Record the overwriter's commit offset. Transitions exactly once from
    /// zero; the debug assertion keeps that single-shot property honest.
    pub fn publish_sstamp(&self, stamp: u64) {
        debug_assert_ne!(stamp, 0);
        let prev = self.sstamp.swap(stamp, Ordering::Release);
        debug_assert!(prev == 0 || prev == stamp, "sstamp rewritten: {prev} -> {stamp}");
    }

    pub fn xstamp(&self) -> u64 {
        self.xstamp.load(Ordering::Relaxed)
    }

    pub fn store_xstamp(&self, stamp: u64) {
        self.xstamp.store(stamp, Ordering::Relaxed);
    }

    /// Raise the access stamp to at least `stamp`.
    pub fn advance_xstamp(&self, stamp: u64) {
        self.xstamp.fetch_max(stamp, Ordering::Relaxed);
    }

    pub fn readers_bitmap(&self) -> u64 {
        self.readers.load(Ordering::Acquire)
    }

    pub fn readers_fetch_or(&self, bits: u64) -> u64 {
        self.readers.fetch_or(bits, Ordering::AcqRel)
    }

    pub fn readers_fetch_and(&self, bits: u64) -> u64 {
        self.readers.fetch_and(bits, Ordering::AcqRel)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Copy the payload, revalidating the creator stamp afterwards. A stamp
    /// change mid-copy means the snapshot of the bytes cannot be trusted.
    pub fn stable_read(&self) -> Option<Vec<u8>> {
        let before = self.clsn.load(Ordering::Acquire);
        let copy = self.payload.to_vec();
        let after = self.clsn.load(Ordering::Acquire);
        (before == after).then_some(copy)
    }

    pub fn next<'g>(&self, guard: &'g Guard) -> Shared<'g, Version> {
        self.next.load(Ordering::Acquire, guard)
    }

    pub(crate) fn set_next(&self, next: Shared<'_, Version>) {
        self.next.store(next, Ordering::Release);
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("clsn", &self.clsn())
            .field("sstamp", &self.sstamp())
            .field("xstamp", &self.xstamp())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
