// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::lock::LockMode;

/// In-process lock registry. Clones share the same namespace.
///
/// A name's slot lives only while someone holds or waits on it.
#[derive(Clone, Default)]
pub struct LocalLocks {
    slots: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(name.to_owned()).or_default())
    }

    pub(crate) async fn acquire(&self, name: &str, mode: LockMode) -> Option<LocalGuard> {
        let slot = self.slot(name);
        let guard = match mode {
            LockMode::Blocking => slot.lock_owned().await,
            LockMode::IfAvailable => slot.try_lock_owned().ok()?,
        };
        Some(LocalGuard { guard: Some(guard), name: name.to_owned(), locks: self.clone() })
    }

    /// Drop `name`'s slot once nobody holds or waits on it.
    fn prune(&self, name: &str) {
        let mut slots = self.slots.lock();
        if slots.get(name).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(name);
        }
    }

    /// Whether `name` is currently held by anyone sharing this registry.
    pub fn is_held(&self, name: &str) -> bool {
        let slots = self.slots.lock();
        slots.get(name).is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of names with a live slot.
    pub fn tracked(&self) -> usize {
        self.slots.lock().len()
    }
}

/// A held local lock; releasing it prunes the name's slot when idle.
pub(crate) struct LocalGuard {
    guard: Option<OwnedMutexGuard<()>>,
    name: String,
    locks: LocalLocks,
}

impl Drop for LocalGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(&self.name);
    }
}
