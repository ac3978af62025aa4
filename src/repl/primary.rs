//! Replication primary: accepts backups, hands each a consistent starting
//! point, and ships committed log windows — synchronously during group
//! commit, or from a shipping daemon under the async persistence policy.

use crate::config::{MvoltConfig, PersistPolicy};
use crate::error::MvoltError;
use crate::log::checkpoint::latest_checkpoint;
use crate::log::manager::{LOG_BASE_OFFSET, LogManager};
use crate::log::segment::{chkpt_marker_name, durable_marker_name, nxt_marker_name};
use crate::repl::ReplicationControl;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) const WINDOW_MAGIC: u32 = 0x4D56_4C54;

/// Per-segment tail entry of the startup metadata blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentTail {
    pub segment: u32,
    pub start: u64,
    pub end: u64,
    /// Bytes of this segment inside `[chkpt_start, durable)`.
    pub tail_size: u64,
}

/// Metadata blob sent to a joining backup, followed on the wire by the
/// checkpoint bytes and each segment tail in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMetadata {
    pub num_log_files: u32,
    pub chkpt_marker: String,
    pub durable_marker: String,
    pub nxt_marker: String,
    pub chkpt_size: u64,
    pub chkpt_start_offset: u64,
    pub durable_offset: u64,
    pub segments: Vec<SegmentTail>,
}

pub(crate) struct WindowHeader {
    pub start: u64,
    pub len: u32,
    pub new_segment: bool,
    pub new_segment_start: u64,
}

impl WindowHeader {
    pub(crate) fn encode(&self) -> [u8; 25] {
        let mut out = [0u8; 25];
        out[0..4].copy_from_slice(&WINDOW_MAGIC.to_be_bytes());
        out[4..12].copy_from_slice(&self.start.to_be_bytes());
        out[12..16].copy_from_slice(&self.len.to_be_bytes());
        out[16] = u8::from(self.new_segment);
        out[17..25].copy_from_slice(&self.new_segment_start.to_be_bytes());
        out
    }

    pub(crate) fn decode(buf: &[u8; 25]) -> Result<Self, MvoltError> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().expect("slice len"));
        if magic != WINDOW_MAGIC {
            return Err(MvoltError::Corruption("bad window magic".into()));
        }
        Ok(Self {
            start: u64::from_be_bytes(buf[4..12].try_into().expect("slice len")),
            len: u32::from_be_bytes(buf[12..16].try_into().expect("slice len")),
            new_segment: buf[16] != 0,
            new_segment_start: u64::from_be_bytes(buf[17..25].try_into().expect("slice len")),
        })
    }
}

pub struct ReplicationPrimary {
    ctrl: Arc<ReplicationControl>,
    log: LogManager,
    persist_policy: PersistPolicy,
    sockets: Arc<Mutex<Vec<TcpStream>>>,
    shipped_upto: Arc<AtomicU64>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
    ship_thread: Option<JoinHandle<()>>,
}

impl ReplicationPrimary {
    pub fn start(
        log: LogManager,
        ctrl: Arc<ReplicationControl>,
        cfg: &MvoltConfig,
    ) -> Result<Self, MvoltError> {
        let addr = cfg
            .primary_listen_addr
            .clone()
            .unwrap_or_else(|| "127.0.0.1:0".to_string());
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "replication primary listening");

        let sockets: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let shipped_upto = Arc::new(AtomicU64::new(log.durable_offset().max(LOG_BASE_OFFSET)));

        let accept_thread = {
            let ctrl = Arc::clone(&ctrl);
            let sockets = Arc::clone(&sockets);
            let log = log.clone();
            std::thread::Builder::new()
                .name("mvolt-primary-accept".into())
                .spawn(move || {
                    while !ctrl.is_shutdown() {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                tracing::info!(%peer, "backup connected");
                                match handshake(&log, stream) {
                                    Ok(stream) => sockets.lock().push(stream),
                                    Err(e) => {
                                        tracing::warn!(%peer, error = %e, "handshake failed")
                                    }
                                }
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                std::thread::sleep(Duration::from_millis(5));
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "accept failed");
                                std::thread::sleep(Duration::from_millis(50));
                            }
                        }
                    }
                    tracing::info!("primary accept daemon exiting");
                })
                .expect("spawn accept daemon")
        };

        let ship_thread = if cfg.persist_policy == PersistPolicy::Async {
            let ctrl2 = Arc::clone(&ctrl);
            let log2 = log.clone();
            let sockets2 = Arc::clone(&sockets);
            let shipped2 = Arc::clone(&shipped_upto);
            let cap = cfg.group_commit_bytes;
            Some(
                std::thread::Builder::new()
                    .name("mvolt-primary-ship".into())
                    .spawn(move || {
                        while !ctrl2.is_shutdown() {
                            if let Err(e) = log2.flush() {
                                tracing::warn!(error = %e, "async shipper flush failed");
                            }
                            let shipped = ship_windows(
                                &log2,
                                &ctrl2,
                                &sockets2,
                                &shipped2,
                                Some(cap),
                                false,
                            );
                            if shipped == 0 {
                                std::thread::sleep(Duration::from_millis(1));
                            }
                        }
                        tracing::info!("primary async shipping daemon exiting");
                    })
                    .expect("spawn ship daemon"),
            )
        } else {
            None
        };

        Ok(Self {
            ctrl,
            log,
            persist_policy: cfg.persist_policy,
            sockets,
            shipped_upto,
            local_addr,
            accept_thread: Some(accept_thread),
            ship_thread,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn backup_count(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Group-commit shipping: persist the committed prefix, stream it to
    /// every backup, and — when the persistence policy demands — wait for
    /// the persistence acks. Returns the offset shipped through.
    pub fn ship_committed(&self) -> Result<u64, MvoltError> {
        self.log.flush()?;
        let wait_ack = self.persist_policy != PersistPolicy::Async;
        ship_windows(
            &self.log,
            &self.ctrl,
            &self.sockets,
            &self.shipped_upto,
            None,
            wait_ack,
        );
        Ok(self.shipped_upto.load(Ordering::Acquire))
    }

    pub fn shipped_offset(&self) -> u64 {
        self.shipped_upto.load(Ordering::Acquire)
    }

    /// Join the daemons; the shared shutdown flag must already be set.
    pub fn shutdown(&mut self) {
        debug_assert!(self.ctrl.is_shutdown());
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.ship_thread.take() {
            let _ = t.join();
        }
        tracing::info!(
            shipped = self.ctrl.shipped_log_size.load(Ordering::Relaxed),
            "replication primary stopped"
        );
    }
}

/// Ship pending committed windows to every backup. Returns bytes shipped.
fn ship_windows(
    log: &LogManager,
    ctrl: &ReplicationControl,
    sockets: &Mutex<Vec<TcpStream>>,
    shipped_upto: &AtomicU64,
    cap: Option<usize>,
    wait_ack: bool,
) -> usize {
    let mut total = 0usize;
    loop {
        let start = shipped_upto.load(Ordering::Acquire);
        let max = cap.unwrap_or(usize::MAX >> 1);
        let (bytes, end) = log.read_window(start, max);
        if bytes.is_empty() {
            return total;
        }
        let segment_bytes = log.segment_store().segment_bytes();
        let header = WindowHeader {
            start,
            len: bytes.len() as u32,
            new_segment: start / segment_bytes != (end - 1) / segment_bytes,
            new_segment_start: (end / segment_bytes) * segment_bytes,
        };

        let mut guard = sockets.lock();
        guard.retain_mut(|stream| {
            let sent = stream
                .write_all(&header.encode())
                .and_then(|_| stream.write_all(&bytes))
                .and_then(|_| stream.flush());
            if let Err(e) = sent {
                tracing::warn!(error = %e, "dropping backup after failed ship");
                return false;
            }
            true
        });
        if wait_ack {
            guard.retain_mut(|stream| {
                let mut ack = [0u8; 8];
                match stream.read_exact(&mut ack) {
                    Ok(()) => {
                        let persisted = u64::from_be_bytes(ack);
                        tracing::debug!(persisted, end, "backup persistence ack");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping backup after missing ack");
                        false
                    }
                }
            });
        }
        drop(guard);

        shipped_upto.store(end, Ordering::Release);
        ctrl.shipped_log_size
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        total += bytes.len();
        if cap.is_some() {
            // One window per iteration under the capped (daemon) mode.
            return total;
        }
    }
}

/// Build and send the startup metadata blob, checkpoint bytes and segment
/// tails, leaving the stream ready for window traffic.
fn handshake(log: &LogManager, mut stream: TcpStream) -> Result<TcpStream, MvoltError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let store = log.segment_store();
    let durable = log.durable_offset().max(LOG_BASE_OFFSET);
    let chkpt = latest_checkpoint(store.dir())?;
    let (chkpt_start, chkpt_bytes) = match &chkpt {
        Some(info) => (info.start_offset, std::fs::read(&info.data_path)?),
        None => (LOG_BASE_OFFSET, Vec::new()),
    };

    let all_segments = store.list_segments()?;
    let mut segments = Vec::new();
    for meta in &all_segments {
        let lo = meta.start.max(chkpt_start);
        let hi = meta.end.min(durable);
        if hi > lo {
            segments.push(SegmentTail {
                segment: meta.segment,
                start: meta.start,
                end: meta.end,
                tail_size: hi - lo,
            });
        }
    }

    let metadata = StartMetadata {
        num_log_files: all_segments.len() as u32,
        chkpt_marker: chkpt_marker_name(chkpt_start),
        durable_marker: durable_marker_name(durable),
        nxt_marker: nxt_marker_name(store.segment_of(durable) + 1),
        chkpt_size: chkpt_bytes.len() as u64,
        chkpt_start_offset: chkpt_start,
        durable_offset: durable,
        segments,
    };
    let blob = serde_json::to_vec(&metadata).map_err(|e| MvoltError::Encode(e.to_string()))?;
    stream.write_all(&(blob.len() as u32).to_be_bytes())?;
    stream.write_all(&blob)?;
    stream.write_all(&chkpt_bytes)?;
    for tail in &metadata.segments {
        let lo = tail.start.max(chkpt_start);
        let bytes = store.read_range(lo, tail.tail_size as usize)?;
        stream.write_all(&bytes)?;
        tracing::info!(segment = tail.segment, bytes = tail.tail_size, "shipped segment tail");
    }
    stream.flush()?;
    Ok(stream)
}
