use crate::error::MvoltError;
use std::path::PathBuf;

/// Role of this instance in the replication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Primary,
    Backup,
}

/// How the backup acknowledges persistence of a shipped log window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistPolicy {
    /// Wait for the flusher daemon to reach the window's end LSN.
    #[default]
    Sync,
    /// Treat the (emulated) NVRAM log buffer as the persistence domain.
    Nvram,
    /// Never wait on the commit path.
    Async,
}

/// When the backup applies shipped log records to its own store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayPolicy {
    /// Persist only; never replay.
    None,
    /// Replay the window before acknowledging it.
    #[default]
    Sync,
    /// Hand the window to redo threads and acknowledge without waiting.
    Pipelined,
    /// Spill stage bounds to a side file and let a background thread drive redo.
    Background,
}

/// Which key-to-OID index variant backs the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexBackend {
    #[default]
    Ordered,
    Hashed,
}

/// NVRAM latency emulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NvramDelayType {
    /// Touch every cache line of the window, emulating clflush cost.
    #[default]
    Clflush,
    /// Busy-wait a modelled write-back duration for the window size.
    ClwbEmu,
}

/// Runtime configuration for a mvolt instance.
#[derive(Debug, Clone)]
pub struct MvoltConfig {
    pub role: Role,
    /// Directory holding log segments, checkpoint files and markers.
    pub log_dir: PathBuf,
    /// Enable the serial safety net on top of snapshot isolation.
    pub ssn: bool,
    /// Run the exclusion check at read time, not just at commit.
    pub ssn_early_check: bool,
    /// Requested but unsupported; `open` rejects it.
    pub log_ship_by_rdma: bool,
    pub persist_policy: PersistPolicy,
    pub replay_policy: ReplayPolicy,
    pub nvram_log_buffer: bool,
    pub persist_nvram_on_replay: bool,
    pub nvram_delay_type: NvramDelayType,
    /// Ship/replay window granularity in bytes.
    pub group_commit_bytes: usize,
    /// OID-parallel redo partition count.
    pub log_redo_partitions: u32,
    /// Redo worker threads on a backup.
    pub replay_threads: u32,
    pub enable_chkpt: bool,
    /// Fixed byte span covered by each log segment file.
    pub log_segment_bytes: u64,
    /// Capacity of the transaction context pool.
    pub xid_table_size: usize,
    /// Concurrent SSN reader slots (<= 64).
    pub reader_slots: usize,
    pub index_backend: IndexBackend,
    /// Primary: address to accept backup connections on.
    pub primary_listen_addr: Option<String>,
    /// Backup: address of the primary to bootstrap from.
    pub primary_addr: Option<String>,
}

impl Default for MvoltConfig {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            log_dir: PathBuf::from("mvolt-log"),
            ssn: false,
            ssn_early_check: false,
            log_ship_by_rdma: false,
            persist_policy: PersistPolicy::Sync,
            replay_policy: ReplayPolicy::Sync,
            nvram_log_buffer: false,
            persist_nvram_on_replay: false,
            nvram_delay_type: NvramDelayType::Clflush,
            group_commit_bytes: 4 * 1024 * 1024,
            log_redo_partitions: 8,
            replay_threads: 2,
            enable_chkpt: false,
            log_segment_bytes: 64 * 1024 * 1024,
            xid_table_size: 8192,
            reader_slots: 64,
            index_backend: IndexBackend::Ordered,
            primary_listen_addr: None,
            primary_addr: None,
        }
    }
}

impl MvoltConfig {
    /// Serializable-by-default profile: SSN with the early exclusion check.
    pub fn serializable(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ssn: true,
            ssn_early_check: true,
            ..Self::default()
        }
    }

    /// Backup profile tailing a primary with synchronous replay.
    pub fn backup(log_dir: impl Into<PathBuf>, primary_addr: impl Into<String>) -> Self {
        Self {
            role: Role::Backup,
            log_dir: log_dir.into(),
            primary_addr: Some(primary_addr.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), MvoltError> {
        if self.log_ship_by_rdma {
            return Err(MvoltError::Unsupported(
                "RDMA log shipping is not available in this build; use TCP".into(),
            ));
        }
        if self.reader_slots == 0 || self.reader_slots > 64 {
            return Err(MvoltError::InvalidConfig {
                message: format!("reader_slots must be in 1..=64, got {}", self.reader_slots),
            });
        }
        if self.xid_table_size == 0 || self.xid_table_size > (1 << 16) {
            return Err(MvoltError::InvalidConfig {
                message: format!(
                    "xid_table_size must be in 1..=65536, got {}",
                    self.xid_table_size
                ),
            });
        }
        if self.group_commit_bytes == 0 {
            return Err(MvoltError::InvalidConfig {
                message: "group_commit_bytes must be nonzero".into(),
            });
        }
        if self.log_redo_partitions == 0 {
            return Err(MvoltError::InvalidConfig {
                message: "log_redo_partitions must be nonzero".into(),
            });
        }
        if self.log_segment_bytes == 0 {
            return Err(MvoltError::InvalidConfig {
                message: "log_segment_bytes must be nonzero".into(),
            });
        }
        if self.role == Role::Backup && self.primary_addr.is_none() {
            return Err(MvoltError::InvalidConfig {
                message: "backup role requires primary_addr".into(),
            });
        }
        if self.role == Role::Backup
            && self.replay_policy != ReplayPolicy::None
            && self.replay_threads == 0
        {
            return Err(MvoltError::InvalidConfig {
                message: "replay requires at least one replay thread".into(),
            });
        }
        Ok(())
    }
}
