//! Durable local record log.
//!
//! Every mutation is one JSON line appended to the active segment and
//! fsynced before the call returns; the in-memory view is only updated once
//! the line is durable. On open the segments are replayed in order to
//! rebuild that view. Compaction rewrites the live records behind a
//! `checkpoint` line and drops the older segments.

pub mod segment;

use crate::error::{Result, ShutterboxError};
use crate::types::{FailureKind, LogStats, Record, RecordFailure, RecordId};
use chrono::{DateTime, Utc};
use segment::{ActiveSegment, LogLine, LogOp, RecordPatch, SEGMENT_MAX_BYTES};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_COMPACT_THRESHOLD: u64 = 10_000;

type OrderKey = (DateTime<Utc>, u64);

#[derive(Default)]
struct LogState {
    records: HashMap<RecordId, Record>,
    /// Creation order, ties broken by the sequence of the inserting line.
    order: BTreeMap<OrderKey, RecordId>,
    keys: HashMap<RecordId, OrderKey>,
}

impl LogState {
    fn insert(&mut self, record: Record, seq: u64) {
        if let Some(old) = self.keys.remove(&record.id) {
            self.order.remove(&old);
        }
        let key = (record.created_at, seq);
        self.order.insert(key, record.id.clone());
        self.keys.insert(record.id.clone(), key);
        self.records.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &str) -> bool {
        if let Some(key) = self.keys.remove(id) {
            self.order.remove(&key);
        }
        self.records.remove(id).is_some()
    }

    fn apply(&mut self, line: &LogLine) {
        match &line.op {
            LogOp::Checkpoint => *self = LogState::default(),
            LogOp::Append { record } => self.insert(record.clone(), line.seq),
            LogOp::Upsert { records } => {
                for record in records {
                    match self.records.get_mut(&record.id) {
                        Some(existing) => *existing = record.clone(),
                        None => self.insert(record.clone(), line.seq),
                    }
                }
            }
            LogOp::MarkReplicated { ids, remote_urls } => {
                for id in ids {
                    if let Some(r) = self.records.get_mut(id) {
                        if let Some(url) = remote_urls.get(id) {
                            r.payload_ref.remote_url = Some(url.clone());
                        }
                        r.replicated = true;
                        r.attempt_count = 0;
                        r.last_error = None;
                        r.rejections = 0;
                        r.dead_lettered = false;
                    }
                }
            }
            LogOp::Patch { patches } => {
                for p in patches {
                    if let Some(r) = self.records.get_mut(&p.id) {
                        r.attempt_count = p.attempt_count;
                        r.last_error = p.last_error.clone();
                        r.rejections = p.rejections;
                        r.dead_lettered = p.dead_lettered;
                    }
                }
            }
            LogOp::Delete { ids } => {
                for id in ids {
                    self.remove(id);
                }
            }
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &Record> {
        self.order.values().filter_map(|id| self.records.get(id))
    }
}

struct Inner {
    state: LogState,
    segment: ActiveSegment,
    next_seq: u64,
    /// Lines written since the last checkpoint.
    lines: u64,
}

pub struct LocalLog {
    dir: PathBuf,
    compact_threshold: u64,
    segment_max_bytes: u64,
    inner: Mutex<Inner>,
}

impl LocalLog {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_threshold(dir, DEFAULT_COMPACT_THRESHOLD)
    }

    pub fn open_with_threshold(dir: &Path, compact_threshold: u64) -> Result<Self> {
        fs::create_dir_all(dir).map_err(ShutterboxError::storage)?;

        let segments = segment::list_segments(dir)?;
        let mut state = LogState::default();
        let mut max_seq = 0u64;
        let mut lines = 0u64;

        for (idx, (_, path)) in segments.iter().enumerate() {
            let (parsed, valid_len) = segment::read_segment(path)?;
            for line in &parsed {
                max_seq = max_seq.max(line.seq);
                if matches!(line.op, LogOp::Checkpoint) {
                    lines = 0;
                } else {
                    lines += 1;
                }
                state.apply(line);
            }
            // Only the tail segment can hold a torn write; cut it so the
            // next append starts on a clean line.
            if idx + 1 == segments.len() {
                let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                if len > valid_len {
                    fs::OpenOptions::new()
                        .write(true)
                        .open(path)
                        .and_then(|f| f.set_len(valid_len))
                        .map_err(ShutterboxError::storage)?;
                }
            }
        }

        let active_id = segments.last().map(|(id, _)| *id).unwrap_or(1);
        let segment = ActiveSegment::open(dir, active_id)?;

        tracing::info!(
            "[LOG] opened {} ({} records, {} segments, seq={})",
            dir.display(),
            state.records.len(),
            segments.len().max(1),
            max_seq
        );

        Ok(LocalLog {
            dir: dir.to_path_buf(),
            compact_threshold,
            segment_max_bytes: SEGMENT_MAX_BYTES,
            inner: Mutex::new(Inner {
                state,
                segment,
                next_seq: max_seq + 1,
                lines,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `op` durably, then apply it to the in-memory view.
    fn commit(&self, inner: &mut Inner, op: LogOp) -> Result<()> {
        let line = LogLine::new(inner.next_seq, op);
        inner.segment.write_line(&line)?;
        inner.next_seq += 1;
        inner.lines += 1;
        inner.state.apply(&line);

        // The line is durable at this point; a failed rollover only means the
        // current segment keeps growing until the next commit retries it.
        if inner.segment.size >= self.segment_max_bytes {
            let next_id = inner.segment.id + 1;
            match ActiveSegment::open(&self.dir, next_id) {
                Ok(segment) => inner.segment = segment,
                Err(e) => tracing::warn!(
                    "[LOG] failed to roll over to segment {} in {}: {}",
                    next_id,
                    self.dir.display(),
                    e
                ),
            }
        }
        Ok(())
    }

    /// Persist a freshly captured record. Fails with `Storage` if the line
    /// could not be made durable, in which case nothing was written.
    pub fn append(&self, mut record: Record) -> Result<RecordId> {
        if record.id.trim().is_empty() {
            return Err(ShutterboxError::InvalidRecord("empty record id".into()));
        }
        record.replicated = false;
        record.attempt_count = 0;
        record.last_error = None;
        record.rejections = 0;
        record.dead_lettered = false;

        let mut inner = self.lock();
        if inner.state.records.contains_key(&record.id) {
            return Err(ShutterboxError::InvalidRecord(format!(
                "duplicate record id {}",
                record.id
            )));
        }
        let id = record.id.clone();
        self.commit(&mut inner, LogOp::Append { record })?;
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.lock().state.records.get(id).cloned()
    }

    /// Up to `limit` records awaiting replication, oldest first.
    pub fn list_unreplicated(&self, limit: usize) -> Vec<Record> {
        self.lock()
            .state
            .ordered()
            .filter(|r| r.is_pending())
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count_unreplicated(&self) -> usize {
        self.lock()
            .state
            .records
            .values()
            .filter(|r| r.is_pending())
            .count()
    }

    /// Idempotent: true whenever the record exists, whether or not it was
    /// already marked.
    pub fn mark_replicated(&self, id: &str) -> Result<bool> {
        let exists = self.lock().state.records.contains_key(id);
        if !exists {
            return Ok(false);
        }
        self.mark_replicated_many(&[id.to_string()])?;
        Ok(true)
    }

    /// Flip `replicated` for a whole batch in one durable commit. Returns
    /// only the ids this call flipped.
    pub fn mark_replicated_many(&self, ids: &[RecordId]) -> Result<Vec<RecordId>> {
        self.mark_replicated_with_remote(ids, &BTreeMap::new())
    }

    /// Like [`LocalLog::mark_replicated_many`], also recording the remote
    /// blob pointer of each flipped record in the same commit.
    pub fn mark_replicated_with_remote(
        &self,
        ids: &[RecordId],
        remote_urls: &BTreeMap<RecordId, String>,
    ) -> Result<Vec<RecordId>> {
        let mut inner = self.lock();
        let mut seen = HashSet::new();
        let flipped: Vec<RecordId> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter(|id| {
                inner
                    .state
                    .records
                    .get(id.as_str())
                    .map(|r| !r.replicated)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if flipped.is_empty() {
            return Ok(flipped);
        }
        self.commit(
            &mut inner,
            LogOp::MarkReplicated {
                remote_urls: remote_urls
                    .iter()
                    .filter(|(id, _)| flipped.contains(id))
                    .map(|(id, url)| (id.clone(), url.clone()))
                    .collect(),
                ids: flipped.clone(),
            },
        )?;
        Ok(flipped)
    }

    /// Record failed attempts. Rejections count towards dead-lettering once
    /// they reach `dead_letter_after` (0 disables it). Returns the ids
    /// dead-lettered by this call.
    pub fn record_failures(
        &self,
        failures: &[RecordFailure],
        dead_letter_after: u32,
    ) -> Result<Vec<RecordId>> {
        let mut inner = self.lock();
        let mut patches: Vec<RecordPatch> = Vec::new();
        let mut dead = Vec::new();

        for failure in failures {
            let Some(r) = inner.state.records.get(&failure.id) else {
                continue;
            };
            if r.replicated {
                continue;
            }
            let mut patch = patches
                .iter()
                .position(|p| p.id == failure.id)
                .map(|i| patches.remove(i))
                .unwrap_or_else(|| RecordPatch {
                    id: r.id.clone(),
                    attempt_count: r.attempt_count,
                    last_error: r.last_error.clone(),
                    rejections: r.rejections,
                    dead_lettered: r.dead_lettered,
                });

            patch.attempt_count = patch.attempt_count.saturating_add(1);
            patch.last_error = Some(failure.reason.clone());
            if failure.kind == FailureKind::Rejected {
                patch.rejections = patch.rejections.saturating_add(1);
                if dead_letter_after > 0
                    && patch.rejections >= dead_letter_after
                    && !patch.dead_lettered
                {
                    patch.dead_lettered = true;
                    dead.push(patch.id.clone());
                }
            }
            patches.push(patch);
        }

        if patches.is_empty() {
            return Ok(dead);
        }
        self.commit(&mut inner, LogOp::Patch { patches })?;
        Ok(dead)
    }

    /// Explicit retry request: clears the failure bookkeeping so the record
    /// becomes visible to the worker again. False for unknown or already
    /// replicated records.
    pub fn retry(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.state.records.get(id) {
            Some(r) if !r.replicated => {}
            _ => return Ok(false),
        }
        self.commit(
            &mut inner,
            LogOp::Patch {
                patches: vec![RecordPatch {
                    id: id.to_string(),
                    attempt_count: 0,
                    last_error: None,
                    rejections: 0,
                    dead_lettered: false,
                }],
            },
        )?;
        Ok(true)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.delete_many(&[id.to_string()])? == 1)
    }

    /// Remove a page of records in one durable commit.
    pub fn delete_many(&self, ids: &[RecordId]) -> Result<usize> {
        let mut inner = self.lock();
        let mut seen = HashSet::new();
        let present: Vec<RecordId> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter(|id| inner.state.records.contains_key(id.as_str()))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok(0);
        }
        let n = present.len();
        self.commit(&mut inner, LogOp::Delete { ids: present })?;
        Ok(n)
    }

    /// Records created before `cutoff`, replicated ones first, each group
    /// oldest first.
    pub fn list_expired(&self, cutoff: DateTime<Utc>, limit: usize) -> Vec<Record> {
        let inner = self.lock();
        let expired: Vec<&Record> = inner
            .state
            .order
            .range(..(cutoff, 0))
            .filter_map(|(_, id)| inner.state.records.get(id))
            .collect();

        let (replicated, pending): (Vec<&Record>, Vec<&Record>) =
            expired.into_iter().partition(|r| r.replicated);
        replicated
            .into_iter()
            .chain(pending)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Apply records received from another node: insert-or-replace keyed by
    /// id, all in one commit. Stored copies are authoritative, so they are
    /// marked replicated.
    pub fn upsert_replicas(&self, records: Vec<Record>) -> Result<usize> {
        let mut by_id: Vec<Record> = Vec::with_capacity(records.len());
        for mut record in records {
            if record.id.trim().is_empty() {
                return Err(ShutterboxError::InvalidRecord("empty record id".into()));
            }
            record.replicated = true;
            record.attempt_count = 0;
            record.last_error = None;
            record.rejections = 0;
            record.dead_lettered = false;
            // Later copies of the same id in one batch win.
            by_id.retain(|r| r.id != record.id);
            by_id.push(record);
        }
        if by_id.is_empty() {
            return Ok(0);
        }
        let n = by_id.len();
        let mut inner = self.lock();
        self.commit(&mut inner, LogOp::Upsert { records: by_id })?;
        Ok(n)
    }

    pub fn live_ids(&self) -> HashSet<RecordId> {
        self.lock().state.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.lock();
        let mut stats = LogStats {
            total: inner.state.records.len(),
            segments: segment::list_segments(&self.dir)
                .map(|s| s.len())
                .unwrap_or(0),
            dead_lines: inner
                .lines
                .saturating_sub(inner.state.records.len() as u64),
            ..LogStats::default()
        };
        for r in inner.state.records.values() {
            if r.replicated {
                stats.replicated += 1;
            } else if r.dead_lettered {
                stats.dead_lettered += 1;
            } else {
                stats.unreplicated += 1;
            }
        }
        stats
    }

    /// Compact when superseded lines exceed the configured threshold.
    pub fn maybe_compact(&self) -> Result<bool> {
        let dead = {
            let inner = self.lock();
            inner
                .lines
                .saturating_sub(inner.state.records.len() as u64)
        };
        if dead < self.compact_threshold {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    /// Rewrite live records into a fresh segment behind a checkpoint and
    /// remove the older segments. The new segment only becomes visible via
    /// rename once fully synced, so a crash leaves either the old segments
    /// alone or old + new (where the checkpoint supersedes the old ones).
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.lock();
        let new_id = inner.segment.id + 1;
        let final_path = segment::segment_path(&self.dir, new_id);
        let tmp_path = final_path.with_extension("jsonl.tmp");

        let mut seq = inner.next_seq;
        let mut lines = vec![LogLine::new(seq, LogOp::Checkpoint)];
        for record in inner.state.ordered() {
            seq += 1;
            lines.push(LogLine::new(
                seq,
                LogOp::Append {
                    record: record.clone(),
                },
            ));
        }

        let _ = fs::remove_file(&tmp_path);
        {
            let mut tmp = ActiveSegment::open_path(&tmp_path, new_id)?;
            for line in &lines {
                tmp.write_line(line)?;
            }
        }
        fs::rename(&tmp_path, &final_path).map_err(ShutterboxError::storage)?;

        for (id, path) in segment::list_segments(&self.dir)? {
            if id < new_id {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("[LOG] failed to remove {}: {}", path.display(), e);
                }
            }
        }

        let mut state = LogState::default();
        for line in &lines {
            state.apply(line);
        }
        let live = state.records.len();
        inner.state = state;
        inner.segment = ActiveSegment::open(&self.dir, new_id)?;
        inner.next_seq = seq + 1;
        inner.lines = live as u64;

        tracing::info!(
            "[LOG] compacted {} into segment {} ({} live records)",
            self.dir.display(),
            new_id,
            live
        );
        Ok(())
    }
}
