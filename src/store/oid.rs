//! OID-indexed table of lock-free version chains.
//!
//! Each cell holds the head of a newest-first chain of [`Version`] nodes.
//! Installation and unlinking go through compare-and-swap on the cell; the
//! in-place overwrite of a transaction's own uncommitted head is a plain
//! store, valid because the install permission matrix never lets two
//! transactions own the same head. OID allocation hands each thread an
//! extent of 8,192 ids so the global cursor is touched once per extent.

use crate::fatptr::{Asi, Lsn, Xid};
use crate::store::version::Version;
use crate::txn::xid::{TxnState, XidTable};
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

pub type Oid = u32;

pub const OID_EXTENT: u32 = 8192;

static NEXT_TABLE_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Per-thread allocation extents, keyed by table identity so unrelated
    // instances in one process do not share cursors.
    static OID_EXTENTS: RefCell<HashMap<usize, (u32, u32)>> = RefCell::new(HashMap::new());
}

/// The reader's view used by the visibility traversal: who is asking and
/// which snapshot boundary applies.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotView {
    /// Raw XID of the visitor.
    pub xid: u64,
    /// Begin offset: committed versions at or below this are visible.
    pub begin: u64,
}

struct OidPage {
    cells: Box<[Atomic<Version>]>,
}

impl OidPage {
    fn new() -> Self {
        let cells: Vec<Atomic<Version>> =
            (0..OID_EXTENT).map(|_| Atomic::null()).collect();
        Self {
            cells: cells.into_boxed_slice(),
        }
    }
}

pub struct OidTable {
    id: usize,
    pages: RwLock<Vec<Arc<OidPage>>>,
    alloc_cursor: AtomicU64,
}

impl OidTable {
    pub fn new() -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            pages: RwLock::new(Vec::new()),
            alloc_cursor: AtomicU64::new(0),
        }
    }

    /// Highest OID ever handed to an extent (exclusive bound).
    pub fn allocated(&self) -> u64 {
        self.alloc_cursor.load(Ordering::Relaxed)
    }

    /// Reserve a fresh OID from this thread's extent.
    pub fn alloc(&self) -> Oid {
        OID_EXTENTS.with(|cache| {
            let mut cache = cache.borrow_mut();
            let entry = cache.entry(self.id).or_insert((0, 0));
            if entry.1 == 0 {
                entry.0 = self.alloc_extent();
                entry.1 = OID_EXTENT;
            }
            let oid = entry.0 + (OID_EXTENT - entry.1);
            entry.1 -= 1;
            oid
        })
    }

    fn alloc_extent(&self) -> u32 {
        let start = self
            .alloc_cursor
            .fetch_add(u64::from(OID_EXTENT), Ordering::Relaxed);
        self.ensure_capacity(start + u64::from(OID_EXTENT));
        start as u32
    }

    /// Move the allocation cursor past `oid` (replay / checkpoint load), so
    /// subsequent extents never collide with replicated ids.
    pub fn reserve_past(&self, oid: Oid) {
        let needed = (u64::from(oid) + 1).div_ceil(u64::from(OID_EXTENT)) * u64::from(OID_EXTENT);
        self.alloc_cursor.fetch_max(needed, Ordering::Relaxed);
        self.ensure_capacity(needed);
    }

    /// Grow the cell array to cover at least `upto` OIDs.
    pub fn ensure_capacity(&self, upto: u64) {
        {
            let pages = self.pages.read();
            if (pages.len() as u64) * u64::from(OID_EXTENT) >= upto {
                return;
            }
        }
        let mut pages = self.pages.write();
        while (pages.len() as u64) * u64::from(OID_EXTENT) < upto {
            pages.push(Arc::new(OidPage::new()));
        }
    }

    fn with_cell<R>(&self, oid: Oid, f: impl FnOnce(&Atomic<Version>) -> R) -> Option<R> {
        let page = {
            let pages = self.pages.read();
            pages.get((oid / OID_EXTENT) as usize).cloned()?
        };
        Some(f(&page.cells[(oid % OID_EXTENT) as usize]))
    }

    /// Load the current chain head.
    pub fn begin<'g>(&self, oid: Oid, guard: &'g Guard) -> Shared<'g, Version> {
        self.with_cell(oid, |cell| cell.load(Ordering::Acquire, guard))
            .unwrap_or_else(Shared::null)
    }

    /// Install the first version of an OID. Fails if the cell is occupied.
    pub fn put_new(&self, oid: Oid, version: Owned<Version>, guard: &Guard) -> bool {
        self.with_cell(oid, |cell| {
            cell.compare_exchange(
                Shared::null(),
                version,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
        })
        .unwrap_or(false)
    }

    /// Install `version` over `old_head`.
    ///
    /// With `overwrite` set (a transaction replacing its own uncommitted
    /// head) the new node inherits `old_head.next` — the repeated in-flight
    /// version drops out of the chain — and the head is stored without a
    /// CAS; the displaced node is retired through the epoch. Otherwise the
    /// new node links to `old_head` and the head moves by CAS; a lost race
    /// returns false and the caller treats it as a write-write conflict.
    pub fn update(
        &self,
        oid: Oid,
        old_head: Shared<'_, Version>,
        version: Owned<Version>,
        overwrite: bool,
        guard: &Guard,
    ) -> bool {
        self.with_cell(oid, move |cell| {
            if overwrite {
                let old = unsafe { old_head.deref() };
                debug_assert_eq!(
                    old.clsn().to_xid(),
                    version.clsn().to_xid(),
                    "overwrite of a head owned by another transaction"
                );
                version.set_next(old.next(guard));
                let new_shared = version.into_shared(guard);
                cell.store(new_shared, Ordering::Release);
                fence(Ordering::SeqCst);
                unsafe { guard.defer_destroy(old_head) };
                true
            } else {
                version.set_next(old_head);
                cell.compare_exchange(
                    old_head,
                    version,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            }
        })
        .unwrap_or(false)
    }

    /// Remove an uncommitted head, exposing its successor. Only valid when
    /// `head` is the caller's own sole dirty version.
    pub fn unlink(&self, oid: Oid, head: Shared<'_, Version>, guard: &Guard) -> bool {
        self.with_cell(oid, |cell| {
            let next = unsafe { head.deref() }.next(guard);
            if cell
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                unsafe { guard.defer_destroy(head) };
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Core visibility traversal: walk the chain newest-first and return the
    /// first version visible to `view`, revalidating context ownership when
    /// a dirty stamp points into the XID table.
    pub fn fetch_visible<'g>(
        &self,
        oid: Oid,
        view: &SnapshotView,
        xids: &XidTable,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Version>> {
        'restart: loop {
            let mut cur = self.begin(oid, guard);
            while let Some(v) = unsafe { cur.as_ref() } {
                let clsn = v.clsn();
                match clsn.asi() {
                    Asi::Xid => {
                        let holder = Xid::from_raw(clsn.offset());
                        if holder.raw() == view.xid {
                            // Own write.
                            return Some(cur);
                        }
                        let ctx = xids.get(holder);
                        let state = ctx.state();
                        let end = ctx.end_raw();
                        if ctx.owner() != holder.raw() {
                            // Context recycled under us; the chain may have
                            // changed shape. Start over.
                            continue 'restart;
                        }
                        if state == TxnState::Committed
                            && end != 0
                            && Lsn::from_raw(end).offset() <= view.begin
                        {
                            // Committed, post-commit stamping not finished.
                            return Some(cur);
                        }
                        // Uncommitted or too new under snapshot isolation.
                    }
                    Asi::Log => {
                        if clsn.offset() <= view.begin {
                            return Some(cur);
                        }
                    }
                    Asi::Hot => {}
                }
                cur = v.next(guard);
            }
            return None;
        }
    }

    /// The version immediately newer than `target` in its chain, if any.
    pub fn overwriter_of<'g>(
        &self,
        oid: Oid,
        target: Shared<'_, Version>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Version>> {
        let mut cur = self.begin(oid, guard);
        if cur.as_raw() == target.as_raw() {
            return None;
        }
        while let Some(v) = unsafe { cur.as_ref() } {
            let next = v.next(guard);
            if next.as_raw() == target.as_raw() {
                return Some(cur);
            }
            cur = next;
        }
        None
    }

    /// Install a committed version from the redo log. Returns false when the
    /// chain already carries this or a newer committed version, which makes
    /// replaying the same window twice a no-op.
    pub fn install_replayed(
        &self,
        oid: Oid,
        clsn: Lsn,
        payload: &[u8],
        guard: &Guard,
    ) -> bool {
        self.ensure_capacity(u64::from(oid) + 1);
        loop {
            let head = self.begin(oid, guard);
            if let Some(h) = unsafe { head.as_ref() } {
                let head_clsn = h.clsn();
                if head_clsn.asi() == Asi::Log && head_clsn.offset() >= clsn.offset() {
                    return false;
                }
            }
            let version = Owned::new(Version::new_committed(clsn, payload.to_vec()));
            version.set_next(head);
            let installed = self
                .with_cell(oid, |cell| {
                    cell.compare_exchange(
                        head,
                        version,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_ok()
                })
                .unwrap_or(false);
            if installed {
                return true;
            }
        }
    }

    /// Committed LSN offsets of a chain, newest first (diagnostics, tests).
    pub fn chain_lsns(&self, oid: Oid, guard: &Guard) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = self.begin(oid, guard);
        while let Some(v) = unsafe { cur.as_ref() } {
            let clsn = v.clsn();
            if clsn.asi() == Asi::Log {
                out.push(clsn.offset());
            }
            cur = v.next(guard);
        }
        out
    }

    /// Snapshot every populated chain head that is committed, for the
    /// checkpointer: `(oid, clsn, payload)` triples.
    pub fn committed_heads(&self, guard: &Guard) -> Vec<(Oid, Lsn, Vec<u8>)> {
        let pages = self.pages.read().clone();
        let mut out = Vec::new();
        for (page_idx, page) in pages.iter().enumerate() {
            for (cell_idx, cell) in page.cells.iter().enumerate() {
                let mut cur = cell.load(Ordering::Acquire, guard);
                while let Some(v) = unsafe { cur.as_ref() } {
                    if let Some(lsn) = v.clsn().to_lsn() {
                        let oid = page_idx as u32 * OID_EXTENT + cell_idx as u32;
                        out.push((oid, lsn, v.payload().to_vec()));
                        break;
                    }
                    cur = v.next(guard);
                }
            }
        }
        out
    }
}

impl Default for OidTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OidTable {
    fn drop(&mut self) {
        // Exclusive access: walk every chain and free the nodes directly.
        let pages = self.pages.get_mut();
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            for page in pages.iter() {
                for cell in page.cells.iter() {
                    let mut cur = cell.load(Ordering::Relaxed, guard);
                    while !cur.is_null() {
                        let next = cur.deref().next(guard);
                        drop(cur.into_owned());
                        cur = next;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OID_EXTENT, OidTable, SnapshotView};
    use crate::fatptr::{Lsn, Xid};
    use crate::store::version::Version;
    use crate::txn::xid::{TxnState, XidTable};
    use crossbeam_epoch::{Owned, pin};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn committed(table: &OidTable, oid: u32, offset: u64, payload: &[u8]) {
        let guard = pin();
        assert!(table.install_replayed(oid, Lsn::make(offset, 0, 0), payload, &guard));
    }

    #[test]
    fn alloc_hands_out_extents_per_thread() {
        let table = Arc::new(OidTable::new());
        let first = table.alloc();
        assert_eq!(first, 0);
        let second = table.alloc();
        assert_eq!(second, 1);

        let other = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || table.alloc()).join().expect("join")
        };
        assert!(other >= OID_EXTENT, "second thread draws its own extent");
        assert!(table.allocated() >= 2 * u64::from(OID_EXTENT));
    }

    #[test]
    fn put_new_fails_on_occupied_cell() {
        let table = OidTable::new();
        table.ensure_capacity(8);
        let guard = pin();
        let xid = Xid::compose(1, 0);
        assert!(table.put_new(
            3,
            Owned::new(Version::new_dirty(xid, b"a".to_vec())),
            &guard
        ));
        assert!(!table.put_new(
            3,
            Owned::new(Version::new_dirty(xid, b"b".to_vec())),
            &guard
        ));
    }

    #[test]
    fn unlink_restores_the_previous_head() {
        let table = OidTable::new();
        committed(&table, 5, 100, b"old");
        let guard = pin();
        let xid = Xid::compose(2, 1);
        let old_head = table.begin(5, &guard);
        assert!(table.update(
            5,
            old_head,
            Owned::new(Version::new_dirty(xid, b"new".to_vec())),
            false,
            &guard
        ));
        let dirty = table.begin(5, &guard);
        assert!(!unsafe { dirty.deref() }.is_committed());

        assert!(table.unlink(5, dirty, &guard));
        let head = table.begin(5, &guard);
        assert_eq!(unsafe { head.deref() }.payload(), b"old");
    }

    #[test]
    fn overwrite_drops_the_repeated_inflight_version() {
        let table = OidTable::new();
        committed(&table, 3, 50, b"base");
        let guard = pin();
        let xid = Xid::compose(7, 0);

        let head = table.begin(3, &guard);
        assert!(table.update(
            3,
            head,
            Owned::new(Version::new_dirty(xid, b"first".to_vec())),
            false,
            &guard
        ));
        let first_dirty = table.begin(3, &guard);
        assert!(table.update(
            3,
            first_dirty,
            Owned::new(Version::new_dirty(xid, b"second".to_vec())),
            true,
            &guard
        ));

        // Chain is second-dirty -> base; the first dirty version is gone.
        let head = table.begin(3, &guard);
        let head_ref = unsafe { head.deref() };
        assert_eq!(head_ref.payload(), b"second");
        let next = head_ref.next(&guard);
        assert_eq!(unsafe { next.deref() }.payload(), b"base");
        assert!(unsafe { next.deref() }.next(&guard).is_null());
    }

    #[test]
    fn visibility_picks_the_snapshot_version() {
        let table = OidTable::new();
        let xids = XidTable::new(8);
        committed(&table, 5, 200, b"A");
        committed(&table, 5, 300, b"B");

        let guard = pin();
        let reader = |begin: u64| SnapshotView { xid: 0, begin };
        let at_250 = table
            .fetch_visible(5, &reader(250), &xids, &guard)
            .expect("visible at 250");
        assert_eq!(unsafe { at_250.deref() }.payload(), b"A");
        let at_350 = table
            .fetch_visible(5, &reader(350), &xids, &guard)
            .expect("visible at 350");
        assert_eq!(unsafe { at_350.deref() }.payload(), b"B");
        assert!(
            table.fetch_visible(5, &reader(100), &xids, &guard).is_none(),
            "nothing visible before the first commit"
        );
    }

    #[test]
    fn own_dirty_write_is_visible_to_its_creator_only() {
        let table = OidTable::new();
        let xids = XidTable::new(8);
        committed(&table, 9, 100, b"committed");
        let writer = xids.allocate().expect("alloc");
        xids.get(writer).set_state(TxnState::Active);

        let guard = pin();
        let head = table.begin(9, &guard);
        assert!(table.update(
            9,
            head,
            Owned::new(Version::new_dirty(writer, b"dirty".to_vec())),
            false,
            &guard
        ));

        let own = table
            .fetch_visible(
                9,
                &SnapshotView {
                    xid: writer.raw(),
                    begin: 150,
                },
                &xids,
                &guard,
            )
            .expect("own write");
        assert_eq!(unsafe { own.deref() }.payload(), b"dirty");

        let other = table
            .fetch_visible(9, &SnapshotView { xid: 0, begin: 150 }, &xids, &guard)
            .expect("committed version");
        assert_eq!(unsafe { other.deref() }.payload(), b"committed");

        xids.get(writer).set_state(TxnState::Aborted);
        xids.free(writer);
    }

    #[test]
    fn overwriter_of_finds_the_immediate_successor() {
        let table = OidTable::new();
        committed(&table, 2, 100, b"v1");
        committed(&table, 2, 200, b"v2");
        committed(&table, 2, 300, b"v3");

        let guard = pin();
        let head = table.begin(2, &guard);
        assert!(table.overwriter_of(2, head, &guard).is_none());

        let mid = unsafe { head.deref() }.next(&guard);
        let ow = table.overwriter_of(2, mid, &guard).expect("overwriter");
        assert_eq!(ow.as_raw(), head.as_raw());

        let tail = unsafe { mid.deref() }.next(&guard);
        let ow = table.overwriter_of(2, tail, &guard).expect("overwriter");
        assert_eq!(ow.as_raw(), mid.as_raw());
    }

    proptest! {
        #[test]
        fn committed_chains_stay_in_decreasing_lsn_order(
            offsets in proptest::collection::btree_set(1u64..10_000, 1..20)
        ) {
            let table = OidTable::new();
            for off in &offsets {
                committed(&table, 1, *off, b"p");
            }
            let guard = pin();
            let lsns = table.chain_lsns(1, &guard);
            prop_assert_eq!(lsns.len(), offsets.len());
            prop_assert!(lsns.windows(2).all(|w| w[0] > w[1]));
        }

        #[test]
        fn replay_is_idempotent(
            offsets in proptest::collection::btree_set(1u64..10_000, 1..20)
        ) {
            let once = OidTable::new();
            let twice = OidTable::new();
            for off in &offsets {
                committed(&once, 1, *off, b"p");
                committed(&twice, 1, *off, b"p");
            }
            // Second application must change nothing.
            for off in &offsets {
                let guard = pin();
                prop_assert!(!twice.install_replayed(1, Lsn::make(*off, 0, 0), b"p", &guard));
            }
            let guard = pin();
            prop_assert_eq!(once.chain_lsns(1, &guard), twice.chain_lsns(1, &guard));
        }
    }
}
