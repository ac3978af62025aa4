//! Transaction context table.
//!
//! A fixed pool of contexts is recycled across transactions. Because a
//! context can be freed and reissued while another thread is still looking at
//! it, every consumer that reads a context it did not allocate must re-read
//! `owner` after reading the fields of interest and start over if it no
//! longer matches the XID being looked up. That owner-revalidation discipline
//! is the only protection against use-after-recycle.

use crate::error::MvoltError;
use crate::fatptr::{Lsn, Xid};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    Embryo = 0,
    Active = 1,
    Committing = 2,
    Committed = 3,
    Aborted = 4,
}

impl TxnState {
    fn from_u8(v: u8) -> TxnState {
        match v {
            0 => TxnState::Embryo,
            1 => TxnState::Active,
            2 => TxnState::Committing,
            3 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

/// Per-transaction state. All fields are single-word atomics read and
/// written with relaxed ordering; cross-field consistency comes from the
/// owner-revalidation pattern, not from fences.
#[derive(Debug)]
pub struct XidContext {
    /// Raw XID this context currently belongs to; 0 while free.
    owner: AtomicU64,
    /// Raw LSN captured at transaction begin.
    begin: AtomicU64,
    /// Raw commit LSN; 0 until pre-commit reserves one.
    end: AtomicU64,
    /// Largest predecessor commit stamp (eta).
    pstamp: AtomicU64,
    /// Smallest successor commit stamp (pi); `u64::MAX` until bounded.
    sstamp: AtomicU64,
    state: AtomicU8,
}

impl XidContext {
    fn empty() -> Self {
        Self {
            owner: AtomicU64::new(0),
            begin: AtomicU64::new(0),
            end: AtomicU64::new(0),
            pstamp: AtomicU64::new(0),
            sstamp: AtomicU64::new(u64::MAX),
            state: AtomicU8::new(TxnState::Embryo as u8),
        }
    }

    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn begin(&self) -> Lsn {
        Lsn::from_raw(self.begin.load(Ordering::Relaxed))
    }

    pub fn set_begin(&self, lsn: Lsn) {
        self.begin.store(lsn.raw(), Ordering::Relaxed);
    }

    /// Raw commit-LSN word; zero means "not pre-committed yet".
    pub fn end_raw(&self) -> u64 {
        self.end.load(Ordering::Relaxed)
    }

    pub fn end_offset(&self) -> u64 {
        Lsn::from_raw(self.end_raw()).offset()
    }

    pub fn set_end(&self, lsn: Lsn) {
        self.end.store(lsn.raw(), Ordering::Relaxed);
    }

    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn pstamp(&self) -> u64 {
        self.pstamp.load(Ordering::Relaxed)
    }

    /// Raise pstamp to at least `stamp`.
    pub fn advance_pstamp(&self, stamp: u64) {
        self.pstamp.fetch_max(stamp, Ordering::Relaxed);
    }

    pub fn set_pstamp(&self, stamp: u64) {
        self.pstamp.store(stamp, Ordering::Relaxed);
    }

    pub fn sstamp(&self) -> u64 {
        self.sstamp.load(Ordering::Relaxed)
    }

    /// Lower sstamp to at most `stamp`.
    pub fn constrain_sstamp(&self, stamp: u64) {
        self.sstamp.fetch_min(stamp, Ordering::Relaxed);
    }

    /// The SSN exclusion invariant: commit is allowed only while
    /// `sstamp > pstamp`.
    pub fn exclusion_holds(&self) -> bool {
        self.sstamp() > self.pstamp()
    }
}

/// Outcome of waiting on another transaction's commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Aborted,
    /// The context was recycled mid-wait; the transaction reached a terminal
    /// state and its slot moved on. Callers re-read whatever pointed here.
    Recycled,
}

/// Fixed-size pool of transaction contexts.
pub struct XidTable {
    contexts: Box<[XidContext]>,
    free: Mutex<Vec<u16>>,
    next_generation: AtomicU64,
}

impl XidTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= (1 << 16));
        let contexts: Vec<XidContext> = (0..capacity).map(|_| XidContext::empty()).collect();
        let free: Vec<u16> = (0..capacity as u16).rev().collect();
        Self {
            contexts: contexts.into_boxed_slice(),
            free: Mutex::new(free),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }

    /// Hand out a fresh XID bound to a recycled context.
    pub fn allocate(&self) -> Result<Xid, MvoltError> {
        let slot = self.free.lock().pop().ok_or(MvoltError::Unavailable {
            message: "transaction context table exhausted".into(),
        })?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let xid = Xid::compose(generation, slot);
        let ctx = &self.contexts[slot as usize];
        ctx.begin.store(0, Ordering::Relaxed);
        ctx.end.store(0, Ordering::Relaxed);
        ctx.pstamp.store(0, Ordering::Relaxed);
        ctx.sstamp.store(u64::MAX, Ordering::Relaxed);
        ctx.state.store(TxnState::Embryo as u8, Ordering::Relaxed);
        // Publishing the owner is what makes the context discoverable.
        ctx.owner.store(xid.raw(), Ordering::Release);
        Ok(xid)
    }

    /// Release an XID. The context is immediately recyclable; concurrent
    /// readers detect this through the owner changing under them.
    pub fn free(&self, xid: Xid) {
        let ctx = self.get(xid);
        debug_assert_eq!(ctx.owner(), xid.raw(), "freeing a context twice");
        debug_assert!(ctx.state().is_terminal() || ctx.state() == TxnState::Embryo);
        ctx.owner.store(0, Ordering::Release);
        self.free.lock().push(xid.slot());
    }

    /// Context slot for an XID. The returned reference may describe a later
    /// transaction; callers must revalidate `owner` against `xid`.
    pub fn get(&self, xid: Xid) -> &XidContext {
        &self.contexts[xid.slot() as usize % self.contexts.len()]
    }

    /// Spin until a peer that has pre-committed reaches a terminal state.
    ///
    /// Only call after observing a nonzero `end` for `xid`; an `Active`
    /// state here means the snapshot raced ahead of the peer and we keep
    /// spinning until the owner changes or the state resolves.
    pub fn wait_for_commit_result(&self, xid: Xid) -> CommitOutcome {
        let ctx = self.get(xid);
        loop {
            let state = ctx.state();
            if ctx.owner() != xid.raw() {
                return CommitOutcome::Recycled;
            }
            match state {
                TxnState::Committed => return CommitOutcome::Committed,
                TxnState::Aborted => return CommitOutcome::Aborted,
                TxnState::Embryo | TxnState::Active | TxnState::Committing => {
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
            }
        }
    }
}
