// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Directory-backed store shared by sibling processes on one host.
//!
//! Layout under the store directory:
//! - `keys/<key>` holds the current value, replaced atomically (tmp + rename).
//! - `changes.jsonl` is a short-lived change journal (see [`journal`]).
//!   Watchers follow it to learn about writes from other handles, including
//!   writes that were immediately cleared again. Entries expire after the
//!   retention window, so values do not outlive the keys that held them.
//!
//! [`journal`]: crate::store::journal

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{validate_name, ErrorKind};
use crate::store::journal::{Journal, JournalEntry, JournalTail};
use crate::store::{KeyValueStore, SignalStore, StorageChange};

const JOURNAL_FILE: &str = "changes.jsonl";
const KEYS_DIR: &str = "keys";
const CHANGE_CAPACITY: usize = 256;
const MIN_COMPACTION_INTERVAL: Duration = Duration::from_millis(10);

pub struct FileStore {
    dir: PathBuf,
    origin: Uuid,
    /// Last sequence number written; held across the append so entries
    /// from this handle land in order.
    seq: Mutex<u64>,
    journal: Journal,
    poll_interval: Duration,
    changes: broadcast::Sender<StorageChange>,
    /// Set once the journal watcher has been started by [`SignalStore::watch`].
    watcher: Mutex<Option<CancellationToken>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(KEYS_DIR)).map_err(storage_err)?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let journal = Journal::new(dir.join(JOURNAL_FILE));
        Ok(Self {
            dir,
            origin: Uuid::new_v4(),
            seq: Mutex::new(0),
            journal,
            poll_interval: Duration::from_millis(250),
            changes,
            watcher: Mutex::new(None),
        })
    }

    /// Override how often the journal is polled when filesystem events are missed.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long journal entries, and the values in them, are kept.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.journal = self.journal.clone().with_retention(retention);
        self
    }

    /// Upper bound on journal entries regardless of age.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.journal = self.journal.clone().with_max_entries(max_entries);
        self
    }

    /// Drop expired journal entries now. Watchers also do this periodically.
    pub fn compact(&self) -> anyhow::Result<usize> {
        self.journal.compact().map_err(storage_err)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        validate_name(key)?;
        Ok(self.dir.join(KEYS_DIR).join(key))
    }

    fn record(&self, key: &str, value: Option<&str>) -> anyhow::Result<()> {
        let mut seq = self.seq.lock();
        *seq += 1;
        let entry = JournalEntry::new(self.origin, *seq, key, value.map(str::to_owned));
        self.journal.append(entry).map_err(storage_err)
    }

    /// Spawn the journal tail that feeds `self.changes`, and periodic
    /// compaction. Must be called from within a tokio runtime.
    fn start_watcher(&self) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let tail = JournalTail::since(self.journal.path().to_path_buf(), SystemTime::now())
            .with_poll_interval(self.poll_interval);
        let (entry_tx, mut entry_rx) = mpsc::channel::<Vec<JournalEntry>>(16);
        let changes = self.changes.clone();
        let journal = self.journal.clone();
        let origin = self.origin;
        let stop = shutdown.clone();

        tokio::spawn(tail.follow(entry_tx, shutdown.clone()));
        tokio::spawn(async move {
            let mut compaction = tokio::time::interval(journal.retention().max(MIN_COMPACTION_INTERVAL));
            compaction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    batch = entry_rx.recv() => {
                        let Some(entries) = batch else { break };
                        for entry in entries.into_iter().filter(|e| e.origin != origin) {
                            let _ = changes.send(StorageChange { key: entry.key, value: entry.value });
                        }
                    }
                    _ = compaction.tick() => {
                        if let Err(e) = journal.compact() {
                            tracing::debug!("file store: journal compaction failed: {e:#}");
                        }
                    }
                }
            }
        });

        shutdown
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.key_path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.key_path(key)?;
        if self.get(key)?.as_deref() == Some(value) {
            return Ok(());
        }
        write_atomic(&path, value).map_err(storage_err)?;
        self.record(key, Some(value))
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.key_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => self.record(key, None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }
}

impl SignalStore for FileStore {
    fn watch(&self) -> anyhow::Result<BoxStream<'static, StorageChange>> {
        // Subscribe before the watcher can emit anything.
        let rx = self.changes.subscribe();
        {
            let mut watcher = self.watcher.lock();
            if watcher.is_none() {
                *watcher = Some(self.start_watcher());
            }
        }
        let stream = BroadcastStream::new(rx).filter_map(|item| {
            let change = match item {
                Ok(change) => Some(change),
                Err(e) => {
                    tracing::debug!("file store watcher lagged: {e}");
                    None
                }
            };
            futures_util::future::ready(change)
        });
        Ok(stream.boxed())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Some(token) = self.watcher.lock().take() {
            token.cancel();
        }
    }
}

/// Write `value` to `path` atomically (write tmp + rename).
///
/// The temp name carries the PID and a counter so concurrent writers never
/// share a temp file.
fn write_atomic(path: &Path, value: &str) -> std::io::Result<()> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        ".{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, value)?;
    std::fs::rename(&tmp_path, path)
}

fn storage_err(e: impl Into<anyhow::Error>) -> anyhow::Error {
    let err: anyhow::Error = e.into();
    err.context(ErrorKind::Storage)
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
