//! mvolt: a main-memory, multi-version OLTP storage core with primary/
//! backup log replication.
//!
//! An instance owns an OID-indexed table of lock-free version chains, a
//! recycled transaction-context pool, a byte-addressable redo log, and —
//! depending on its role — either a replication primary (accepts backups,
//! ships committed log windows) or a replication backup (receives,
//! persists and replays them). Concurrency control is snapshot isolation,
//! optionally strengthened to serializability by the serial safety net.

pub mod config;
pub mod error;
pub mod fatptr;
pub mod index;
pub mod log;
pub mod repl;
pub mod store;
pub mod txn;

pub use config::{
    IndexBackend, MvoltConfig, NvramDelayType, PersistPolicy, ReplayPolicy, Role,
};
pub use error::{AbortReason, ErrorCode, MvoltError};
pub use fatptr::{Asi, FatPtr, Lsn, Xid};
pub use store::Oid;
pub use txn::{Transaction, TxnState};

use crate::index::{HashedIndex, KeyIndex, OrderedIndex};
use crate::log::checkpoint::{
    CheckpointInfo, collect_rows, install_rows, latest_checkpoint, load_rows, write_checkpoint,
};
use crate::log::manager::{LOG_BASE_OFFSET, LogManager};
use crate::log::segment::SegmentStore;
use crate::repl::ReplicationControl;
use crate::repl::backup::{ReplicationBackup, apply_log_window};
use crate::repl::primary::ReplicationPrimary;
use crate::store::OidTable;
use crate::txn::{ReaderSlots, XidTable};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct MvoltInstance {
    config: MvoltConfig,
    log: LogManager,
    store: Arc<OidTable>,
    index: Arc<dyn KeyIndex>,
    xids: Arc<XidTable>,
    slots: Arc<ReaderSlots>,
    ctrl: Arc<ReplicationControl>,
    primary: Mutex<Option<ReplicationPrimary>>,
    backup: Mutex<Option<ReplicationBackup>>,
}

impl MvoltInstance {
    /// Bring an instance up in the configured role. A primary recovers
    /// whatever its log directory already holds; a backup bootstraps from
    /// its primary and starts tailing.
    pub fn open(config: MvoltConfig) -> Result<Self, MvoltError> {
        config.validate()?;
        std::fs::create_dir_all(&config.log_dir)?;

        let log = LogManager::new(&config.log_dir, config.log_segment_bytes);
        let store = Arc::new(OidTable::new());
        let index: Arc<dyn KeyIndex> = match config.index_backend {
            IndexBackend::Ordered => Arc::new(OrderedIndex::new()),
            IndexBackend::Hashed => Arc::new(HashedIndex::new()),
        };
        let xids = Arc::new(XidTable::new(config.xid_table_size));
        let slots = Arc::new(ReaderSlots::new(config.reader_slots));
        let ctrl = Arc::new(ReplicationControl::new());

        let mut primary = None;
        let mut backup = None;
        match config.role {
            Role::Primary => {
                if log.segment_store().durable_marker()?.is_some() {
                    let chkpt = latest_checkpoint(&config.log_dir)?;
                    let replay_from = match &chkpt {
                        Some(info) => {
                            let bytes = std::fs::read(&info.data_path)?;
                            let rows = load_rows(&bytes)?;
                            install_rows(&rows, &store, index.as_ref())?;
                            info.start_offset
                        }
                        None => LOG_BASE_OFFSET,
                    };
                    let durable = log.recover()?;
                    apply_log_window(
                        &log,
                        &store,
                        index.as_ref(),
                        config.log_redo_partitions,
                        None,
                        replay_from,
                        durable,
                    )?;
                    info!(replay_from, durable, "primary recovered");
                }
                if config.primary_listen_addr.is_some() {
                    primary = Some(ReplicationPrimary::start(
                        log.clone(),
                        Arc::clone(&ctrl),
                        &config,
                    )?);
                }
            }
            Role::Backup => {
                backup = Some(ReplicationBackup::start(
                    log.clone(),
                    Arc::clone(&store),
                    Arc::clone(&index),
                    Arc::clone(&ctrl),
                    &config,
                )?);
            }
        }

        info!(role = ?config.role, dir = %config.log_dir.display(), "mvolt instance open");
        Ok(Self {
            config,
            log,
            store,
            index,
            xids,
            slots,
            ctrl,
            primary: Mutex::new(primary),
            backup: Mutex::new(backup),
        })
    }

    /// Reset an existing log directory: truncate the segment and
    /// checkpoint data files and drop the markers that referenced them.
    pub fn truncate_log_dir(dir: &Path) -> Result<(), MvoltError> {
        SegmentStore::new(dir, 1).truncate_data_files()?;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('c') || name.starts_with('d') || name.starts_with('n') {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &MvoltConfig {
        &self.config
    }

    pub fn log(&self) -> &LogManager {
        &self.log
    }

    pub fn control(&self) -> &ReplicationControl {
        &self.ctrl
    }

    /// Start a transaction at the current log horizon.
    pub fn begin(&self) -> Result<Transaction, MvoltError> {
        Transaction::begin(
            Arc::clone(&self.xids),
            Arc::clone(&self.slots),
            Arc::clone(&self.store),
            Arc::clone(&self.index),
            self.log.new_tx_log(),
            self.log.cur_lsn(),
            self.config.ssn,
            self.config.ssn_early_check,
        )
    }

    /// One-shot snapshot read.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MvoltError> {
        let mut tx = self.begin()?;
        let value = tx.read(key)?;
        tx.commit()?;
        Ok(value)
    }

    /// One-shot upsert.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Lsn, MvoltError> {
        let mut tx = self.begin()?;
        if !tx.update(key, value)? && !tx.insert(key, value)? {
            // Lost an insert race; the key exists now.
            tx.update(key, value)?;
        }
        tx.commit()
    }

    /// Persist the committed log prefix.
    pub fn flush(&self) -> Result<u64, MvoltError> {
        Ok(self.log.flush()?)
    }

    /// Flush, ship to all connected backups, and (policy permitting) wait
    /// for their persistence acks. Primary only.
    pub fn ship_committed(&self) -> Result<u64, MvoltError> {
        let guard = self.primary.lock();
        let primary = guard.as_ref().ok_or_else(|| MvoltError::Validation(
            "ship_committed on an instance without a replication primary".into(),
        ))?;
        primary.ship_committed()
    }

    /// Address backups should connect to. Primary with listener only.
    pub fn primary_local_addr(&self) -> Option<SocketAddr> {
        self.primary.lock().as_ref().map(|p| p.local_addr())
    }

    pub fn connected_backups(&self) -> usize {
        self.primary.lock().as_ref().map_or(0, |p| p.backup_count())
    }

    /// Write a checkpoint of the committed state at the durable horizon.
    pub fn checkpoint(&self) -> Result<CheckpointInfo, MvoltError> {
        if !self.config.enable_chkpt {
            return Err(MvoltError::Validation(
                "checkpointing is disabled (enable_chkpt)".into(),
            ));
        }
        let durable = self.log.flush()?;
        let rows = collect_rows(&self.store, self.index.as_ref());
        write_checkpoint(&self.config.log_dir, self.log.lsn_at(durable), &rows)
    }

    /// Backup progress helpers (false on a primary).
    pub fn wait_backup_replayed(&self, offset: u64, timeout: Duration) -> bool {
        self.backup
            .lock()
            .as_ref()
            .is_some_and(|b| b.wait_replayed_at_least(offset, timeout))
    }

    pub fn wait_backup_persisted(&self, offset: u64, timeout: Duration) -> bool {
        self.backup
            .lock()
            .as_ref()
            .is_some_and(|b| b.wait_persisted_at_least(offset, timeout))
    }

    /// Stop daemons, close the log, and flush what is already committed.
    pub fn shutdown(&self) {
        if self.ctrl.is_shutdown() {
            return;
        }
        self.ctrl.request_shutdown();
        self.log.close();
        if let Some(mut p) = self.primary.lock().take() {
            p.shutdown();
        }
        if let Some(mut b) = self.backup.lock().take() {
            b.shutdown();
        }
        if let Err(e) = self.log.flush() {
            tracing::warn!(error = %e, "final flush failed during shutdown");
        }
        info!("mvolt instance shut down");
    }
}

impl Drop for MvoltInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
