//! Transaction runtime: reads, writes, inserts, and the two commit
//! protocols (snapshot isolation, and SI + serial safety net).
//!
//! Conflicts surface as [`AbortReason`] values. Every abort path — explicit
//! or signalled from a read/write/commit — unlinks the transaction's dirty
//! versions, deregisters its reads and discards its staged log before the
//! error reaches the caller. The abort-during-commit branch stores the
//! terminal state *before* touching the log, so no reader can observe a
//! half-published version whose owner still claims to be committing.

use crate::error::{AbortReason, MvoltError};
use crate::fatptr::{Asi, Lsn, Xid};
use crate::index::KeyIndex;
use crate::log::manager::{FID_CORE, TxLog};
use crate::store::{Oid, OidTable, SnapshotView, Version};
use crate::txn::readers::{self, ReaderSlot, ReaderSlots};
use crate::txn::xid::{CommitOutcome, TxnState, XidTable};
use crossbeam_epoch::{Guard, Owned, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

/// Versions whose commit stamp trails the reader's begin by more than this
/// are "old": readers skip registration and stamp maintenance on them, and
/// an overwriter of such a version pessimistically assumes it was read by a
/// transaction that committed just before the overwrite.
pub const OLD_VERSION_THRESHOLD: u64 = 0xffff_ffff;

struct WriteEntry {
    /// Current in-flight head owned by this transaction.
    new_ptr: usize,
    /// The committed version being replaced; `None` for inserts.
    overwritten: Option<usize>,
    key: Vec<u8>,
    is_insert: bool,
}

struct ReadEntry {
    version: usize,
    oid: Oid,
    registered: bool,
}

enum InstallOutcome {
    /// Chain extended over a committed head.
    Extended { new_ptr: usize, prev: usize },
    /// Own in-flight head replaced in place.
    Rewritten { new_ptr: usize },
    Refused,
}

pub struct Transaction {
    xid: Xid,
    xids: Arc<XidTable>,
    slots: Arc<ReaderSlots>,
    store: Arc<OidTable>,
    index: Arc<dyn KeyIndex>,
    log: TxLog,
    guard: Guard,
    slot: Option<ReaderSlot>,
    write_set: HashMap<Oid, WriteEntry>,
    read_set: Vec<ReadEntry>,
    ssn: bool,
    ssn_early_check: bool,
    resolved: bool,
}

/// Version reference from a pointer recorded in a read/write set.
///
/// Sound while the owning transaction's epoch guard is pinned: set entries
/// only name versions reached through the chain during this transaction,
/// and chain nodes are retired through the epoch, never freed in place.
unsafe fn version_at<'a>(ptr: usize) -> &'a Version {
    unsafe { &*(ptr as *const Version) }
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn begin(
        xids: Arc<XidTable>,
        slots: Arc<ReaderSlots>,
        store: Arc<OidTable>,
        index: Arc<dyn KeyIndex>,
        log: TxLog,
        begin_lsn: Lsn,
        ssn: bool,
        ssn_early_check: bool,
    ) -> Result<Self, MvoltError> {
        let xid = xids.allocate()?;
        let ctx = xids.get(xid);
        ctx.set_begin(begin_lsn);
        let slot = if ssn { slots.acquire(xid) } else { None };
        if ssn && slot.is_none() {
            tracing::debug!(xid = xid.raw(), "reader slots exhausted; running conservative");
        }
        Ok(Self {
            xid,
            xids,
            slots,
            store,
            index,
            log,
            guard: crossbeam_epoch::pin(),
            slot,
            write_set: HashMap::new(),
            read_set: Vec::new(),
            ssn,
            ssn_early_check,
            resolved: false,
        })
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn state(&self) -> TxnState {
        self.xids.get(self.xid).state()
    }

    fn begin_offset(&self) -> u64 {
        self.xids.get(self.xid).begin().offset()
    }

    fn activate(&self) {
        let ctx = self.xids.get(self.xid);
        if ctx.state() == TxnState::Embryo {
            ctx.set_state(TxnState::Active);
        }
    }

    fn view(&self) -> SnapshotView {
        SnapshotView {
            xid: self.xid.raw(),
            begin: self.begin_offset(),
        }
    }

    /// Read the value bound to `key` under this transaction's snapshot.
    pub fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, MvoltError> {
        self.activate();
        let Some(oid) = self.index.search(key) else {
            return Ok(None);
        };
        self.read_oid(oid)
    }

    pub fn read_oid(&mut self, oid: Oid) -> Result<Option<Vec<u8>>, MvoltError> {
        self.activate();
        let view = self.view();
        let ptr = {
            let found = self
                .store
                .fetch_visible(oid, &view, &self.xids, &self.guard);
            match found {
                Some(shared) => shared.as_raw() as usize,
                None => return Ok(None),
            }
        };
        let version = unsafe { version_at(ptr) };
        let Some(payload) = version.stable_read() else {
            return Err(self.signal_abort(AbortReason::UnstableRead));
        };
        if self.ssn {
            self.ssn_post_read(oid, ptr, version)?;
        }
        Ok(Some(payload))
    }

    /// Serial-safety-net bookkeeping after a successful read.
    fn ssn_post_read(
        &mut self,
        oid: Oid,
        ptr: usize,
        version: &Version,
    ) -> Result<(), MvoltError> {
        let clsn = version.clsn();
        if clsn.asi() != Asi::Log {
            // Own uncommitted write; no stamp maintenance.
            return Ok(());
        }
        let v_clsn = clsn.offset();
        let age = self.begin_offset().saturating_sub(v_clsn);
        if age >= OLD_VERSION_THRESHOLD {
            // Old version: implicitly assume xstamp = clsn - 1.
            return Ok(());
        }
        let xids = Arc::clone(&self.xids);
        let ctx = xids.get(self.xid);
        ctx.advance_pstamp(v_clsn);

        let tuple_sstamp = version.sstamp();
        if tuple_sstamp == 0 {
            match self.slot {
                Some(slot) if readers::register_reader(version, slot) => {
                    self.record_read(oid, ptr, true);
                }
                Some(_) => {
                    // Lost the race to a committed overwriter.
                    let ts = version.sstamp();
                    if ts != 0 {
                        ctx.constrain_sstamp(ts);
                    }
                }
                None => {
                    // No slot (bitmap overflow): stay unregistered but keep
                    // the read so certification re-checks its overwriter.
                    self.record_read(oid, ptr, false);
                }
            }
        } else {
            ctx.constrain_sstamp(tuple_sstamp);
        }

        if self.ssn_early_check && !ctx.exclusion_holds() {
            return Err(self.signal_abort(AbortReason::SsnExclusionFailure));
        }
        Ok(())
    }

    fn record_read(&mut self, oid: Oid, ptr: usize, registered: bool) {
        if self.read_set.iter().any(|r| r.version == ptr) {
            return;
        }
        self.read_set.push(ReadEntry {
            version: ptr,
            oid,
            registered,
        });
    }

    /// Overwrite the value bound to `key`. Returns false when the key is
    /// unbound; refusal by the version store aborts with a write-write
    /// conflict.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<bool, MvoltError> {
        self.activate();
        let Some(oid) = self.index.search(key) else {
            return Ok(false);
        };
        self.update_oid(oid, value)?;
        Ok(true)
    }

    pub fn update_oid(&mut self, oid: Oid, value: &[u8]) -> Result<(), MvoltError> {
        self.activate();
        let outcome = install_update(
            &self.store,
            &self.xids,
            self.xid,
            self.begin_offset(),
            oid,
            value,
            &self.guard,
        );
        match outcome {
            InstallOutcome::Refused => Err(self.signal_abort(AbortReason::WriteWriteConflict)),
            InstallOutcome::Extended { new_ptr, prev } => {
                self.log.log_update(FID_CORE, oid, value);
                self.write_set.insert(
                    oid,
                    WriteEntry {
                        new_ptr,
                        overwritten: Some(prev),
                        key: Vec::new(),
                        is_insert: false,
                    },
                );
                Ok(())
            }
            InstallOutcome::Rewritten { new_ptr } => {
                self.log.log_update(FID_CORE, oid, value);
                let entry = self
                    .write_set
                    .get_mut(&oid)
                    .expect("own dirty head without a write-set entry");
                entry.new_ptr = new_ptr;
                Ok(())
            }
        }
    }

    /// Create a new object under `key`. Returns false (and installs
    /// nothing) when the key is already bound.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool, MvoltError> {
        self.activate();
        let oid = self.store.alloc();
        self.store.ensure_capacity(u64::from(oid) + 1);
        let new_ptr = {
            let installed = self.store.put_new(
                oid,
                Owned::new(Version::new_dirty(self.xid, value.to_vec())),
                &self.guard,
            );
            debug_assert!(installed, "fresh oid with an occupied cell");
            if !installed {
                return Err(self.signal_abort(AbortReason::WriteWriteConflict));
            }
            self.store.begin(oid, &self.guard).as_raw() as usize
        };
        if !self.index.insert_if_absent(key, oid) {
            let head = Shared::from(new_ptr as *const Version);
            let unlinked = self.store.unlink(oid, head, &self.guard);
            debug_assert!(unlinked);
            return Ok(false);
        }
        self.log.log_insert(FID_CORE, oid, key, value);
        self.write_set.insert(
            oid,
            WriteEntry {
                new_ptr,
                overwritten: None,
                key: key.to_vec(),
                is_insert: true,
            },
        );
        Ok(true)
    }

    /// Voluntarily abort, undoing all effects.
    pub fn abort(mut self) {
        self.abort_mechanics();
    }

    fn signal_abort(&mut self, reason: AbortReason) -> MvoltError {
        tracing::debug!(xid = self.xid.raw(), reason = %reason, "transaction abort");
        self.abort_mechanics();
        MvoltError::Abort(reason)
    }

    /// Undo writes, deregister reads, discard the staged log. The terminal
    /// state is stored first on every path.
    fn abort_mechanics(&mut self) {
        if self.resolved {
            return;
        }
        self.xids.get(self.xid).set_state(TxnState::Aborted);

        for (oid, entry) in &self.write_set {
            let head = Shared::from(entry.new_ptr as *const Version);
            let unlinked = self.store.unlink(*oid, head, &self.guard);
            debug_assert!(unlinked, "dirty head moved under its owner");
            if entry.is_insert {
                self.index.remove(&entry.key, *oid);
            }
        }
        if let Some(slot) = self.slot {
            for read in &self.read_set {
                if read.registered {
                    readers::deregister_reader(unsafe { version_at(read.version) }, slot);
                }
            }
        }
        self.log.discard();
        self.resolved = true;
    }

    /// Commit under the configured protocol, returning the commit LSN.
    pub fn commit(mut self) -> Result<Lsn, MvoltError> {
        if self.ssn {
            self.ssn_commit()
        } else {
            self.si_commit()
        }
    }

    fn enter_committing(&mut self) -> Result<(), MvoltError> {
        let ctx = self.xids.get(self.xid);
        match ctx.state() {
            TxnState::Embryo | TxnState::Active => {
                ctx.set_state(TxnState::Committing);
                Ok(())
            }
            state => Err(MvoltError::Validation(format!(
                "commit on a transaction in state {state:?}"
            ))),
        }
    }

    /// Snapshot-isolation commit: reserve the commit LSN, persist intent,
    /// then publish every new version by retagging its creator stamp.
    fn si_commit(&mut self) -> Result<Lsn, MvoltError> {
        self.enter_committing()?;
        let clsn = self.log.pre_commit();
        if clsn.is_invalid() {
            return Err(self.signal_abort(AbortReason::Internal));
        }
        let ctx = self.xids.get(self.xid);
        ctx.set_end(clsn);
        self.log.commit();
        ctx.set_state(TxnState::Committed);

        for entry in self.write_set.values() {
            unsafe { version_at(entry.new_ptr) }.publish_clsn(clsn);
        }
        // Payload writes must be visible before any reader trusts the tag.
        fence(Ordering::SeqCst);
        self.resolved = true;
        Ok(clsn)
    }

    /// SI commit strengthened by serial-safety-net certification.
    fn ssn_commit(&mut self) -> Result<Lsn, MvoltError> {
        self.enter_committing()?;
        let clsn = self.log.pre_commit();
        if clsn.is_invalid() {
            return Err(self.signal_abort(AbortReason::Internal));
        }
        let cstamp = clsn.offset();
        let xids = Arc::clone(&self.xids);
        let ctx = xids.get(self.xid);
        ctx.set_end(clsn);
        // Reads may never have bounded sstamp; it must not exceed cstamp.
        ctx.constrain_sstamp(cstamp);

        // Overwrites: find the largest predecessor (eta) among readers of
        // the versions this transaction replaces.
        'writes: for entry in self.write_set.values() {
            let Some(ow_ptr) = entry.overwritten else {
                continue; // insert
            };
            let overwritten = unsafe { version_at(ow_ptr) };
            let age = loop {
                let ow_clsn = overwritten.clsn();
                match ow_clsn.asi() {
                    Asi::Xid => {
                        // Pre-committed holder still in post-commit: its
                        // cstamp lives in its context.
                        let holder = Xid::from_raw(ow_clsn.offset());
                        let hctx = xids.get(holder);
                        let end = hctx.end_offset();
                        if hctx.owner() != holder.raw() {
                            continue; // recycled; clsn is a log stamp now
                        }
                        break self.begin_offset().saturating_sub(end);
                    }
                    Asi::Log => {
                        break self.begin_offset().saturating_sub(ow_clsn.offset());
                    }
                    Asi::Hot => break 0,
                }
            };

            if age >= OLD_VERSION_THRESHOLD {
                // Pessimistic old-version rule; nothing larger is possible.
                ctx.set_pstamp(cstamp - 1);
                break 'writes;
            }

            // Committed readers that already deregistered (or never had a
            // slot) left their mark in xstamp.
            let access_stamp = overwritten.xstamp();
            if access_stamp < cstamp {
                ctx.advance_pstamp(access_stamp);
            }
            let mut iter_bitmap = overwritten.readers_bitmap();
            while iter_bitmap != 0 {
                let slot_idx = iter_bitmap.trailing_zeros() as usize;
                iter_bitmap &= iter_bitmap - 1;
                let mut reader_raw = self.slots.xid_at(slot_idx);
                loop {
                    if reader_raw == 0 || reader_raw == self.xid.raw() {
                        break;
                    }
                    let reader = Xid::from_raw(reader_raw);
                    let rctx = xids.get(reader);
                    let reader_end = rctx.end_offset();
                    if rctx.owner() != reader_raw {
                        // Slot handed over mid-read; re-resolve it.
                        reader_raw = self.slots.xid_at(slot_idx);
                        continue;
                    }
                    if reader_end != 0
                        && reader_end < cstamp
                        && xids.wait_for_commit_result(reader) == CommitOutcome::Committed
                    {
                        ctx.advance_pstamp(reader_end);
                    }
                    break;
                }
            }
        }
        debug_assert!(ctx.pstamp() <= cstamp - 1);

        // Reads: find the smallest successor (pi) among overwriters of the
        // versions this transaction read.
        for read in &self.read_set {
            if self.write_set.contains_key(&read.oid) {
                continue; // the overwriter is this transaction
            }
            let read_version = unsafe { version_at(read.version) };
            let ow_ptr = {
                let target = Shared::from(read.version as *const Version);
                self.store
                    .overwriter_of(read.oid, target, &self.guard)
                    .map(|s| s.as_raw() as usize)
            };
            let Some(ow_ptr) = ow_ptr else {
                let ts = read_version.sstamp();
                if ts != 0 {
                    ctx.constrain_sstamp(ts);
                }
                continue;
            };
            let overwriter = unsafe { version_at(ow_ptr) };
            loop {
                let sclsn = overwriter.clsn();
                match sclsn.asi() {
                    Asi::Xid => {
                        let successor = Xid::from_raw(sclsn.offset());
                        if successor.raw() == self.xid.raw() {
                            break;
                        }
                        let sctx = xids.get(successor);
                        let successor_end = sctx.end_offset();
                        if sctx.owner() != successor.raw() {
                            continue; // recycled; clsn settled, re-read it
                        }
                        if successor_end == 0 || successor_end > cstamp {
                            // Not pre-committed, or serialized after me.
                            break;
                        }
                        match xids.wait_for_commit_result(successor) {
                            CommitOutcome::Committed => ctx.constrain_sstamp(successor_end),
                            CommitOutcome::Aborted => {}
                            CommitOutcome::Recycled => {
                                let ts = read_version.sstamp();
                                if ts != 0 {
                                    ctx.constrain_sstamp(ts);
                                }
                            }
                        }
                        break;
                    }
                    Asi::Log | Asi::Hot => {
                        let ts = read_version.sstamp();
                        if ts != 0 {
                            ctx.constrain_sstamp(ts);
                        }
                        break;
                    }
                }
            }
        }

        let exclusion_ok = ctx.exclusion_holds();
        if !exclusion_ok {
            return Err(self.signal_abort(AbortReason::SsnExclusionFailure));
        }

        self.log.commit();
        ctx.set_state(TxnState::Committed);

        // Post-commit: stamp successors into overwritten versions, publish
        // the new versions, push access stamps, release reader slots.
        let committer_sstamp = ctx.sstamp();
        for entry in self.write_set.values() {
            let new_version = unsafe { version_at(entry.new_ptr) };
            if let Some(ow_ptr) = entry.overwritten {
                debug_assert!(committer_sstamp != 0 && committer_sstamp != u64::MAX);
                unsafe { version_at(ow_ptr) }.publish_sstamp(committer_sstamp);
            }
            new_version.store_xstamp(cstamp);
            new_version.publish_clsn(clsn);
        }
        fence(Ordering::SeqCst);

        for read in &self.read_set {
            if self.write_set.contains_key(&read.oid) {
                continue;
            }
            let read_version = unsafe { version_at(read.version) };
            read_version.advance_xstamp(cstamp);
            if read.registered
                && let Some(slot) = self.slot
            {
                readers::deregister_reader(read_version, slot);
            }
        }
        self.resolved = true;
        Ok(clsn)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Falling out of scope without resolution is a voluntary abort.
        if !self.resolved {
            self.abort_mechanics();
        }
        if let Some(slot) = self.slot.take() {
            self.slots.release(slot);
        }
        self.xids.free(self.xid);
    }
}

/// Version-install permission matrix for updates. Loops internally on
/// context recycling; every other outcome is final.
fn install_update(
    store: &OidTable,
    xids: &XidTable,
    xid: Xid,
    begin: u64,
    oid: Oid,
    value: &[u8],
    guard: &Guard,
) -> InstallOutcome {
    loop {
        let head = store.begin(oid, guard);
        let Some(head_ref) = (unsafe { head.as_ref() }) else {
            return InstallOutcome::Refused;
        };
        let clsn = head_ref.clsn();
        let overwrite_own = match clsn.asi() {
            Asi::Log => {
                if clsn.offset() > begin {
                    // A newer committed version exists.
                    return InstallOutcome::Refused;
                }
                false
            }
            Asi::Xid => {
                let holder = Xid::from_raw(clsn.offset());
                if holder.raw() == xid.raw() {
                    true
                } else {
                    let hctx = xids.get(holder);
                    let state = hctx.state();
                    if hctx.owner() != holder.raw() {
                        continue; // recycled; reload the head
                    }
                    match state {
                        // Pre-committed, post-commit pending: extend over it.
                        TxnState::Committed => false,
                        _ => return InstallOutcome::Refused,
                    }
                }
            }
            Asi::Hot => return InstallOutcome::Refused,
        };

        let new = Owned::new(Version::new_dirty(xid, value.to_vec()));
        if overwrite_own {
            let installed = store.update(oid, head, new, true, guard);
            debug_assert!(installed, "in-place overwrite cannot lose a race");
            let new_ptr = store.begin(oid, guard).as_raw() as usize;
            return InstallOutcome::Rewritten { new_ptr };
        }
        if store.update(oid, head, new, false, guard) {
            let new_ptr = store.begin(oid, guard).as_raw() as usize;
            return InstallOutcome::Extended {
                new_ptr,
                prev: head.as_raw() as usize,
            };
        }
        // Lost the install race: a write-write conflict.
        return InstallOutcome::Refused;
    }
}
