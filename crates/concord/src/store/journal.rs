// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Short-lived change journal behind [`FileStore`](super::FileStore) notifications.
//!
//! Each entry survives only for the retention window and the journal never
//! holds more than `max_entries`. Expired entries are dropped by rewriting the
//! file (tmp + rename) under `changes.lock`, so values that passed through the
//! store do not stay on disk.
//!
//! A [`JournalTail`] rereads the journal on every poll and recognises entries
//! it already delivered by `(origin, seq)`, so rewrites never repeat or lose
//! an entry that is still retained.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ENTRIES: usize = 256;

/// One change, as written by a store handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub origin: Uuid,
    /// Per-origin sequence number, starting at 1.
    pub seq: u64,
    /// Unix milliseconds, stamped by [`Journal::append`].
    #[serde(default)]
    pub at_ms: u64,
    pub key: String,
    pub value: Option<String>,
}

impl JournalEntry {
    pub fn new(origin: Uuid, seq: u64, key: impl Into<String>, value: Option<String>) -> Self {
        Self { origin, seq, at_ms: 0, key: key.into(), value }
    }
}

/// Writer side: appends entries and drops the ones nobody needs any more.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    lock_path: PathBuf,
    retention: Duration,
    max_entries: usize,
}

impl Journal {
    pub fn new(path: PathBuf) -> Self {
        let lock_path = path.with_extension("lock");
        Self { path, lock_path, retention: DEFAULT_RETENTION, max_entries: DEFAULT_MAX_ENTRIES }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Stamp `entry` with the current time and add it.
    ///
    /// Plain `O_APPEND` write when nothing has expired; otherwise the journal
    /// is rewritten without the stale prefix.
    pub fn append(&self, mut entry: JournalEntry) -> anyhow::Result<()> {
        let _lock = self.lock()?;
        let now = now_ms();
        entry.at_ms = now;

        let mut entries = read_entries(&self.path)?;
        let stale = self.stale_prefix(&entries, now, 1);
        if stale == 0 {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            file.write_all(line.as_bytes())?;
            return Ok(());
        }

        entries.drain(..stale);
        entries.push(entry);
        self.replace(&entries)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn compact(&self) -> anyhow::Result<usize> {
        let _lock = self.lock()?;
        let mut entries = read_entries(&self.path)?;
        let stale = self.stale_prefix(&entries, now_ms(), 0);
        if stale > 0 {
            entries.drain(..stale);
            self.replace(&entries)?;
        }
        Ok(stale)
    }

    /// Leading entries that are past retention, or that must go so the
    /// journal stays within `max_entries` after adding `incoming` more.
    fn stale_prefix(&self, entries: &[JournalEntry], now: u64, incoming: usize) -> usize {
        let retention = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        let expired = entries.iter().take_while(|e| now.saturating_sub(e.at_ms) > retention).count();
        let overflow = (entries.len() + incoming).saturating_sub(self.max_entries);
        expired.max(overflow).min(entries.len())
    }

    /// Write `entries` to a fresh file and rename it over the journal.
    fn replace(&self, entries: &[JournalEntry]) -> anyhow::Result<()> {
        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(entry)?);
            body.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// All mutations serialise on a separate lock file; the journal itself
    /// is replaced by rename and cannot carry the lock.
    fn lock(&self) -> anyhow::Result<Flock<File>> {
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&self.lock_path)?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| anyhow::anyhow!("flock failed: {errno}"))
    }
}

/// Complete, well-formed entries currently in the journal.
fn read_entries(path: &Path) -> anyhow::Result<Vec<JournalEntry>> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(body.lines().filter_map(|line| serde_json::from_str(line).ok()).collect())
}

fn now_ms() -> u64 {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
}

/// Reader side: follows the journal and yields each entry at most once.
pub struct JournalTail {
    path: PathBuf,
    since_ms: u64,
    delivered: HashMap<Uuid, u64>,
    poll_interval: Duration,
}

impl JournalTail {
    /// Follow entries stamped at or after `since`.
    pub fn since(path: PathBuf, since: SystemTime) -> Self {
        let since_ms = since.duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or_default();
        Self {
            path,
            since_ms: u64::try_from(since_ms).unwrap_or(u64::MAX),
            delivered: HashMap::new(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Entries added since the last poll. A trailing line without a newline
    /// is still being written and is left for the next poll.
    ///
    /// The journal is small, so every poll rereads it whole; that also copes
    /// with rewrites.
    pub fn poll(&mut self) -> anyhow::Result<Vec<JournalEntry>> {
        let body = match std::fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let complete = match body.rfind('\n') {
            Some(end) => body.split_at(end + 1).0,
            None => "",
        };

        let mut fresh = Vec::new();
        let mut origins = HashSet::new();
        for line in complete.lines().filter(|l| !l.trim().is_empty()) {
            let entry: JournalEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(path = %self.path.display(), "skipping malformed journal entry: {e}");
                    continue;
                }
            };
            origins.insert(entry.origin);
            if self.is_new(&entry) {
                fresh.push(entry);
            }
        }

        // Origins gone from the journal can only come back with higher
        // sequence numbers.
        self.delivered.retain(|origin, _| origins.contains(origin));
        Ok(fresh)
    }

    fn is_new(&mut self, entry: &JournalEntry) -> bool {
        if entry.at_ms < self.since_ms {
            return false;
        }
        let last = self.delivered.entry(entry.origin).or_insert(0);
        if entry.seq <= *last {
            return false;
        }
        *last = entry.seq;
        true
    }

    /// Send batches of new entries to `entry_tx` until `shutdown` is
    /// cancelled or the receiver goes away.
    pub async fn follow(mut self, entry_tx: mpsc::Sender<Vec<JournalEntry>>, shutdown: CancellationToken) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let _watcher = wake_on_change(&dir, wake_tx);

        let mut ticks = tokio::time::interval(self.poll_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !entry_tx.is_closed() {
            match self.poll() {
                Ok(entries) if !entries.is_empty() => {
                    if entry_tx.send(entries).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(path = %self.path.display(), "journal poll failed: {e}"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = ticks.tick() => {}
            }
        }
    }
}

/// Nudge `wake_tx` on any event in `dir`; polling covers missed events.
/// The returned watcher must be kept alive.
fn wake_on_change(dir: &Path, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;
    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
