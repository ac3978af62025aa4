//! Log-directory file layout.
//!
//! File-name prefixes distinguish roles: `l` log segment (name encodes
//! segment id and its fixed byte span), `o` checkpoint data (name encodes
//! the checkpoint start LSN), `c` checkpoint marker, `d` durable-LSN marker,
//! `n` next-segment marker. Segments cover fixed, contiguous offset spans
//! so a log offset maps to a file position without any lookup table.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub fn segment_file_name(segment: u32, start: u64, end: u64) -> String {
    format!("l{segment:08}-{start:016x}-{end:016x}")
}

pub fn parse_segment_file_name(name: &str) -> Option<(u32, u64, u64)> {
    let rest = name.strip_prefix('l')?;
    let mut parts = rest.splitn(3, '-');
    let segment = parts.next()?.parse::<u32>().ok()?;
    let start = u64::from_str_radix(parts.next()?, 16).ok()?;
    let end = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some((segment, start, end))
}

pub fn durable_marker_name(offset: u64) -> String {
    format!("d{offset:016x}")
}

pub fn parse_durable_marker_name(name: &str) -> Option<u64> {
    u64::from_str_radix(name.strip_prefix('d')?, 16).ok()
}

pub fn chkpt_marker_name(offset: u64) -> String {
    format!("c{offset:016x}")
}

pub fn parse_chkpt_marker_name(name: &str) -> Option<u64> {
    u64::from_str_radix(name.strip_prefix('c')?, 16).ok()
}

pub fn chkpt_data_name(offset: u64) -> String {
    format!("o{offset:016x}")
}

pub fn parse_chkpt_data_name(name: &str) -> Option<u64> {
    u64::from_str_radix(name.strip_prefix('o')?, 16).ok()
}

pub fn nxt_marker_name(segment: u32) -> String {
    format!("n{segment:08}")
}

pub fn parse_nxt_marker_name(name: &str) -> Option<u32> {
    name.strip_prefix('n')?.parse().ok()
}

#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub segment: u32,
    pub start: u64,
    pub end: u64,
    pub path: PathBuf,
    pub size: u64,
}

/// Segment-file writer/reader over a log directory.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    segment_bytes: u64,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>, segment_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            segment_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_bytes(&self) -> u64 {
        self.segment_bytes
    }

    pub fn segment_of(&self, offset: u64) -> u32 {
        (offset / self.segment_bytes) as u32
    }

    fn segment_path(&self, segment: u32) -> PathBuf {
        let start = u64::from(segment) * self.segment_bytes;
        self.dir
            .join(segment_file_name(segment, start, start + self.segment_bytes))
    }

    /// Write `bytes` at global log offset `start`, splitting at segment
    /// boundaries and fsyncing every touched file.
    pub fn write_range(&self, start: u64, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut offset = start;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let segment = self.segment_of(offset);
            let seg_start = u64::from(segment) * self.segment_bytes;
            let seg_end = seg_start + self.segment_bytes;
            let take = ((seg_end - offset) as usize).min(remaining.len());

            let path = self.segment_path(segment);
            let is_new = !path.exists();
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            file.seek(SeekFrom::Start(offset - seg_start))?;
            file.write_all(&remaining[..take])?;
            file.sync_data()?;
            if is_new {
                self.set_nxt_marker(segment + 1)?;
                tracing::info!(segment, path = %path.display(), "opened log segment");
            }

            offset += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    /// Read `len` bytes starting at global offset `start` from segment files.
    pub fn read_range(&self, start: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut offset = start;
        let mut filled = 0usize;
        while filled < len {
            let segment = self.segment_of(offset);
            let seg_start = u64::from(segment) * self.segment_bytes;
            let seg_end = seg_start + self.segment_bytes;
            let take = ((seg_end - offset) as usize).min(len - filled);

            let mut file = File::open(self.segment_path(segment))?;
            file.seek(SeekFrom::Start(offset - seg_start))?;
            file.read_exact(&mut out[filled..filled + take])?;

            offset += take as u64;
            filled += take;
        }
        Ok(out)
    }

    /// Replace the durable-LSN marker file.
    pub fn set_durable_marker(&self, offset: u64) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let fresh = self.dir.join(durable_marker_name(offset));
        File::create(&fresh)?;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(old) = parse_durable_marker_name(name)
                && old != offset
            {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    pub fn durable_marker(&self) -> io::Result<Option<u64>> {
        let mut best = None;
        if !self.dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(offset) = parse_durable_marker_name(name) {
                best = Some(best.map_or(offset, |b: u64| b.max(offset)));
            }
        }
        Ok(best)
    }

    fn set_nxt_marker(&self, segment: u32) -> io::Result<()> {
        let fresh = self.dir.join(nxt_marker_name(segment));
        File::create(&fresh)?;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(old) = parse_nxt_marker_name(name)
                && old != segment
            {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    pub fn list_segments(&self) -> io::Result<Vec<SegmentMeta>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((segment, start, end)) = parse_segment_file_name(name) {
                out.push(SegmentMeta {
                    segment,
                    start,
                    end,
                    path: entry.path(),
                    size: entry.metadata()?.len(),
                });
            }
        }
        out.sort_by_key(|m| m.segment);
        Ok(out)
    }

    /// Truncate every log-segment and checkpoint-data file, used when a
    /// primary restarts replication from a clean slate.
    pub fn truncate_data_files(&self) -> io::Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('l') || name.starts_with('o') {
                OpenOptions::new()
                    .write(true)
                    .open(entry.path())?
                    .set_len(0)?;
            }
        }
        Ok(())
    }
}
