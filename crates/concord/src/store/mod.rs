// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Key/value storage shared by agents of one origin.
//!
//! Two roles:
//! - durable session storage (`get`/`set`/`remove` only), and
//! - the fallback bus carrier, which also needs change notifications for
//!   writes made by *other* handles ([`SignalStore::watch`]).
//!
//! Both implementations only notify on real value changes: setting a key to
//! the value it already holds, or removing an absent key, is silent.

pub mod file;
pub mod journal;
pub mod memory;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Durable key/value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// A change observed on a key. `value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageChange {
    pub key: String,
    pub value: Option<String>,
}

/// Storage that reports changes made through other handles.
///
/// A handle never observes its own writes, mirroring how same-origin storage
/// events behave between independent contexts.
pub trait SignalStore: KeyValueStore {
    fn watch(&self) -> anyhow::Result<BoxStream<'static, StorageChange>>;
}
