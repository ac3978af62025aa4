//! Checkpoint data and marker files.
//!
//! A checkpoint pairs a data file (`o<lsn>`, JSON rows of the committed
//! chain heads with their index keys) with a marker file (`c<lsn>`). The
//! handshake ships the data file to a joining backup, which installs the
//! rows before tailing the log from the checkpoint LSN.

use crate::error::MvoltError;
use crate::fatptr::Lsn;
use crate::index::KeyIndex;
use crate::log::segment::{chkpt_data_name, chkpt_marker_name, parse_chkpt_marker_name};
use crate::store::{Oid, OidTable};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointRow {
    pub oid: Oid,
    pub key: Vec<u8>,
    pub clsn: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub start_offset: u64,
    pub data_path: PathBuf,
    pub size: u64,
}

/// Write a checkpoint of `rows` taken at `lsn`; the marker lands after the
/// data file so a torn checkpoint is never referenced.
pub fn write_checkpoint(
    dir: &Path,
    lsn: Lsn,
    rows: &[CheckpointRow],
) -> Result<CheckpointInfo, MvoltError> {
    fs::create_dir_all(dir)?;
    let data_path = dir.join(chkpt_data_name(lsn.offset()));
    let bytes = serde_json::to_vec(rows).map_err(|e| MvoltError::Encode(e.to_string()))?;
    fs::write(&data_path, &bytes)?;
    File::create(dir.join(chkpt_marker_name(lsn.offset())))?;
    tracing::info!(offset = lsn.offset(), rows = rows.len(), "checkpoint written");
    Ok(CheckpointInfo {
        start_offset: lsn.offset(),
        data_path,
        size: bytes.len() as u64,
    })
}

/// Collect the rows a checkpoint of the current store would contain.
pub fn collect_rows(store: &OidTable, index: &dyn KeyIndex) -> Vec<CheckpointRow> {
    let guard = crossbeam_epoch::pin();
    let mut by_oid = std::collections::HashMap::new();
    for (key, oid) in index.entries() {
        by_oid.insert(oid, key);
    }
    store
        .committed_heads(&guard)
        .into_iter()
        .map(|(oid, clsn, payload)| CheckpointRow {
            oid,
            key: by_oid.remove(&oid).unwrap_or_default(),
            clsn: clsn.raw(),
            payload,
        })
        .collect()
}

/// Latest checkpoint referenced by a marker, if any.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<CheckpointInfo>, MvoltError> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<u64> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(offset) = parse_chkpt_marker_name(name) {
            best = Some(best.map_or(offset, |b| b.max(offset)));
        }
    }
    let Some(offset) = best else { return Ok(None) };
    let data_path = dir.join(chkpt_data_name(offset));
    let size = fs::metadata(&data_path)
        .map_err(|_| MvoltError::Corruption(format!("checkpoint marker without data at {offset:#x}")))?
        .len();
    Ok(Some(CheckpointInfo {
        start_offset: offset,
        data_path,
        size,
    }))
}

pub fn load_rows(bytes: &[u8]) -> Result<Vec<CheckpointRow>, MvoltError> {
    serde_json::from_slice(bytes).map_err(|e| MvoltError::Decode(e.to_string()))
}

/// Materialize checkpoint rows into an empty store and index.
pub fn install_rows(
    rows: &[CheckpointRow],
    store: &OidTable,
    index: &dyn KeyIndex,
) -> Result<(), MvoltError> {
    let guard = crossbeam_epoch::pin();
    for row in rows {
        store.install_replayed(row.oid, Lsn::from_raw(row.clsn), &row.payload, &guard);
        store.reserve_past(row.oid);
        if !row.key.is_empty() {
            index.insert_if_absent(&row.key, row.oid);
        }
    }
    Ok(())
}
