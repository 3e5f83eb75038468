// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::store::{KeyValueStore, SignalStore, StorageChange};

/// Capacity of the change fan-out channel.
const CHANGE_CAPACITY: usize = 256;

struct Shared {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<(Uuid, StorageChange)>,
}

/// In-process store. Handles created with [`MemoryStore::handle`] share the
/// same values and see each other's changes, but not their own.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    origin: Uuid,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            shared: Arc::new(Shared { values: Mutex::new(HashMap::new()), changes }),
            origin: Uuid::new_v4(),
        }
    }

    /// Open another handle onto the same storage with a distinct origin.
    pub fn handle(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), origin: Uuid::new_v4() }
    }

    fn notify(&self, key: &str, value: Option<String>) {
        let change = StorageChange { key: key.to_owned(), value };
        let _ = self.shared.changes.send((self.origin, change));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.shared.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        // Hold the map lock while notifying so changes fan out in write order.
        let mut values = self.shared.values.lock();
        if values.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        values.insert(key.to_owned(), value.to_owned());
        self.notify(key, Some(value.to_owned()));
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut values = self.shared.values.lock();
        if values.remove(key).is_some() {
            self.notify(key, None);
        }
        Ok(())
    }
}

impl SignalStore for MemoryStore {
    fn watch(&self) -> anyhow::Result<BoxStream<'static, StorageChange>> {
        let origin = self.origin;
        let stream = BroadcastStream::new(self.shared.changes.subscribe()).filter_map(move |item| {
            let change = match item {
                Ok((from, change)) if from != origin => Some(change),
                Ok(_) => None,
                Err(e) => {
                    tracing::debug!("memory store watcher lagged: {e}");
                    None
                }
            };
            futures_util::future::ready(change)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
