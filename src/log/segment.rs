use crate::error::{Result, ShutterboxError};
use crate::types::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) const SEGMENT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Bookkeeping fields rewritten by a failed attempt or an explicit retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub id: RecordId,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub rejections: u32,
    pub dead_lettered: bool,
}

/// One durable mutation. A batch is a single op, so it lands on disk as a
/// single line and is applied all-or-nothing on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogOp {
    /// Everything before this line is superseded (written by compaction).
    Checkpoint,
    Append { record: Record },
    Upsert { records: Vec<Record> },
    MarkReplicated {
        ids: Vec<RecordId>,
        /// Remote blob pointers acknowledged together with the records.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        remote_urls: BTreeMap<RecordId, String>,
    },
    Patch { patches: Vec<RecordPatch> },
    Delete { ids: Vec<RecordId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub op: LogOp,
}

impl LogLine {
    pub fn new(seq: u64, op: LogOp) -> Self {
        LogLine {
            seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            op,
        }
    }
}

pub(crate) struct ActiveSegment {
    file: File,
    pub path: PathBuf,
    pub size: u64,
    pub id: u32,
}

impl ActiveSegment {
    pub fn open(dir: &Path, id: u32) -> Result<Self> {
        Self::open_path(&segment_path(dir, id), id)
    }

    pub fn open_path(path: &Path, id: u32) -> Result<Self> {
        let path = path.to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(ShutterboxError::storage)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(ActiveSegment {
            file,
            path,
            size,
            id,
        })
    }

    /// Append one line and fsync it. On failure the file is cut back to its
    /// previous length so a torn write never precedes the next line.
    pub fn write_line(&mut self, line: &LogLine) -> Result<()> {
        let mut buf = serde_json::to_vec(line).map_err(ShutterboxError::storage)?;
        buf.push(b'\n');

        let written = self
            .file
            .write_all(&buf)
            .and_then(|_| self.file.sync_data());

        if let Err(e) = written {
            if let Err(trunc) = self.file.set_len(self.size) {
                tracing::error!(
                    "[LOG] failed to roll back torn write in {}: {}",
                    self.path.display(),
                    trunc
                );
            }
            return Err(ShutterboxError::storage(e));
        }

        self.size += buf.len() as u64;
        Ok(())
    }
}

pub(crate) fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("segment_{:04}.jsonl", id))
}

/// Segment files in replay order.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut segments: Vec<(u32, PathBuf)> = fs::read_dir(dir)
        .map_err(ShutterboxError::storage)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            let id = name
                .to_str()?
                .strip_prefix("segment_")?
                .strip_suffix(".jsonl")?
                .parse::<u32>()
                .ok()?;
            Some((id, e.path()))
        })
        .collect();
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Parse every complete line of a segment. Returns the lines and the byte
/// length of the valid prefix; anything after the last newline is a torn
/// write and is dropped.
pub(crate) fn read_segment(path: &Path) -> Result<(Vec<LogLine>, u64)> {
    let bytes = fs::read(path).map_err(ShutterboxError::storage)?;
    let mut lines = Vec::new();
    let mut offset = 0usize;

    while let Some(pos) = bytes[offset..].iter().position(|b| *b == b'\n') {
        let raw = &bytes[offset..offset + pos];
        offset += pos + 1;
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<LogLine>(raw) {
            Ok(line) => lines.push(line),
            Err(e) => {
                tracing::warn!(
                    "[LOG] skipping unreadable line in {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    if offset < bytes.len() {
        tracing::warn!(
            "[LOG] dropping {} trailing bytes of torn write in {}",
            bytes.len() - offset,
            path.display()
        );
    }

    Ok((lines, offset as u64))
}
