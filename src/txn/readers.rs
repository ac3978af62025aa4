//! Reader registry for the serial safety net.
//!
//! Each SSN transaction claims one global slot for its lifetime; every tuple
//! carries a bitmap word of slot indexes that are currently reading it. The
//! slot cap bounds concurrent registered readers — a transaction that cannot
//! get a slot is never blocked, it just runs without registration and is
//! accounted for conservatively (its commits still push the tuple `xstamp`,
//! which overwriters fold into their pstamp).

use crate::fatptr::Xid;
use crate::store::Version;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MAX_READER_SLOTS: usize = 64;

/// A claimed reader slot. Indexes into [`ReaderSlots`] and into every
/// tuple's reader bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSlot(pub(crate) u8);

impl ReaderSlot {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn bit(self) -> u64 {
        1u64 << self.0
    }
}

/// Global slot-to-XID mapping shared by all tuples.
pub struct ReaderSlots {
    xids: [AtomicU64; MAX_READER_SLOTS],
    occupied: AtomicU64,
    limit: usize,
}

impl ReaderSlots {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0 && limit <= MAX_READER_SLOTS);
        Self {
            xids: std::array::from_fn(|_| AtomicU64::new(0)),
            occupied: AtomicU64::new(0),
            limit,
        }
    }

    /// Claim a slot for a transaction, or `None` when all slots are taken.
    pub fn acquire(&self, xid: Xid) -> Option<ReaderSlot> {
        loop {
            let occupied = self.occupied.load(Ordering::Acquire);
            let free = !occupied & Self::mask(self.limit);
            if free == 0 {
                return None;
            }
            let idx = free.trailing_zeros() as u8;
            let bit = 1u64 << idx;
            if self
                .occupied
                .compare_exchange_weak(occupied, occupied | bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.xids[idx as usize].store(xid.raw(), Ordering::Release);
                return Some(ReaderSlot(idx));
            }
        }
    }

    pub fn release(&self, slot: ReaderSlot) {
        self.xids[slot.index()].store(0, Ordering::Release);
        self.occupied.fetch_and(!slot.bit(), Ordering::AcqRel);
    }

    /// Raw XID currently bound to a slot; 0 while the slot is free or in the
    /// middle of hand-over. Callers re-read after consuming dependent fields.
    pub fn xid_at(&self, index: usize) -> u64 {
        self.xids[index].load(Ordering::Acquire)
    }

    pub fn in_use(&self) -> usize {
        self.occupied.load(Ordering::Relaxed).count_ones() as usize
    }

    fn mask(limit: usize) -> u64 {
        if limit == MAX_READER_SLOTS {
            u64::MAX
        } else {
            (1u64 << limit) - 1
        }
    }
}

/// Register a transaction as a reader of `version`.
///
/// Returns `false` when the tuple already lost the race to a committed
/// overwriter (`sstamp` became nonzero): registering after that point would
/// let the overwriter miss the anti-dependency, so the reader falls back to
/// consuming the tuple's `sstamp` instead.
pub fn register_reader(version: &Version, slot: ReaderSlot) -> bool {
    if version.sstamp() != 0 {
        return false;
    }
    version.readers_fetch_or(slot.bit());
    if version.sstamp() != 0 {
        // Lost the race after setting the bit; withdraw.
        version.readers_fetch_and(!slot.bit());
        return false;
    }
    true
}

pub fn deregister_reader(version: &Version, slot: ReaderSlot) {
    version.readers_fetch_and(!slot.bit());
}

/// Snapshot the reader slots of a tuple. Iteration tolerates concurrent
/// clears: a cleared reader committed and already published its xstamp, so
/// undercounting here is safe.
pub fn iter_readers<'a>(
    version: &Version,
    slots: &'a ReaderSlots,
) -> impl Iterator<Item = (usize, u64)> + 'a {
    let mut bitmap = version.readers_bitmap();
    std::iter::from_fn(move || {
        while bitmap != 0 {
            let idx = bitmap.trailing_zeros() as usize;
            bitmap &= bitmap - 1;
            let raw = slots.xid_at(idx);
            if raw != 0 {
                return Some((idx, raw));
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::{ReaderSlots, deregister_reader, iter_readers, register_reader};
    use crate::fatptr::Xid;
    use crate::store::Version;

    fn dirty_version() -> Version {
        Version::new_dirty(Xid::compose(1, 0), b"v".to_vec())
    }

    #[test]
    fn acquire_release_cycles_slots() {
        let slots = ReaderSlots::new(2);
        let a = slots.acquire(Xid::compose(1, 1)).expect("slot a");
        let b = slots.acquire(Xid::compose(2, 2)).expect("slot b");
        assert_ne!(a.index(), b.index());
        assert!(slots.acquire(Xid::compose(3, 3)).is_none(), "full");
        assert_eq!(slots.in_use(), 2);

        slots.release(a);
        let c = slots.acquire(Xid::compose(4, 4)).expect("slot c");
        assert_eq!(c.index(), a.index());
        assert_eq!(slots.xid_at(c.index()), Xid::compose(4, 4).raw());
        slots.release(b);
        slots.release(c);
        assert_eq!(slots.in_use(), 0);
    }

    #[test]
    fn registration_fails_once_overwritten() {
        let slots = ReaderSlots::new(4);
        let slot = slots.acquire(Xid::compose(9, 0)).expect("slot");
        let version = dirty_version();
        assert!(register_reader(&version, slot));
        deregister_reader(&version, slot);

        version.publish_sstamp(420);
        assert!(
            !register_reader(&version, slot),
            "committed overwriter forecloses registration"
        );
        assert_eq!(version.readers_bitmap(), 0, "failed registration left no bit");
        slots.release(slot);
    }

    #[test]
    fn iteration_reports_live_slot_xids() {
        let slots = ReaderSlots::new(8);
        let version = dirty_version();
        let x1 = Xid::compose(5, 1);
        let x2 = Xid::compose(6, 2);
        let s1 = slots.acquire(x1).expect("s1");
        let s2 = slots.acquire(x2).expect("s2");
        assert!(register_reader(&version, s1));
        assert!(register_reader(&version, s2));

        let mut seen: Vec<u64> = iter_readers(&version, &slots).map(|(_, x)| x).collect();
        seen.sort_unstable();
        let mut expect = vec![x1.raw(), x2.raw()];
        expect.sort_unstable();
        assert_eq!(seen, expect);

        // A released slot drops out of iteration even while its bit lingers.
        slots.release(s1);
        let seen: Vec<u64> = iter_readers(&version, &slots).map(|(_, x)| x).collect();
        assert_eq!(seen, vec![x2.raw()]);
        slots.release(s2);
    }
}
