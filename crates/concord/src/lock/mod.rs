// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Advisory lock manager: named, exclusive, scope-bound locks.
//!
//! A lock is held exactly while the caller's operation runs. There is no
//! separate unlock call: the guard is dropped when the operation completes,
//! panics, or is cancelled, and an OS `flock` is also released when the
//! holding process dies.

pub mod file;
pub mod local;

use std::future::Future;

use nix::fcntl::Flock;

pub use file::FileLocks;
pub use local::LocalLocks;
use local::LocalGuard;

/// How `request` behaves when the lock is held elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Suspend until the lock is free.
    Blocking,
    /// Return [`LockOutcome::Unavailable`] immediately, without queuing.
    IfAvailable,
}

/// Result of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was granted and the operation ran to completion.
    Acquired(T),
    /// Non-blocking request found the lock held elsewhere.
    Unavailable,
}

impl<T> LockOutcome<T> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn acquired(self) -> Option<T> {
        match self {
            Self::Acquired(v) => Some(v),
            Self::Unavailable => None,
        }
    }
}

#[derive(Clone)]
enum Backend {
    Local(LocalLocks),
    File(FileLocks),
}

/// A lock held for the duration of one operation.
enum Held {
    // Fields are only held for their drop side effect.
    Local(#[allow(dead_code)] LocalGuard),
    File(#[allow(dead_code)] Flock<std::fs::File>),
}

/// Per-agent handle onto a lock namespace.
///
/// Agents that must exclude each other need handles onto the same namespace:
/// clones of one [`LocalLocks`] registry within a process, or the same lock
/// directory across processes.
#[derive(Clone)]
pub struct LockManager {
    backend: Backend,
}

impl LockManager {
    /// Locks shared by agents living in this process.
    pub fn local(registry: LocalLocks) -> Self {
        Self { backend: Backend::Local(registry) }
    }

    /// Locks shared by every process that uses `dir`.
    pub fn file(dir: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        Ok(Self { backend: Backend::File(FileLocks::open(dir)?) })
    }

    /// Run `operation` while holding the lock `name`.
    ///
    /// Returns `Err` only when the lock backend itself fails; a lock held
    /// elsewhere in [`LockMode::IfAvailable`] mode is `Ok(Unavailable)`.
    pub async fn request<F, Fut, T>(
        &self,
        name: &str,
        mode: LockMode,
        operation: F,
    ) -> anyhow::Result<LockOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let held = match &self.backend {
            Backend::Local(locks) => locks.acquire(name, mode).await.map(Held::Local),
            Backend::File(locks) => locks.acquire(name, mode).await?.map(Held::File),
        };
        let Some(held) = held else {
            tracing::debug!(lock = name, "lock unavailable");
            return Ok(LockOutcome::Unavailable);
        };

        tracing::trace!(lock = name, "lock acquired");
        let value = operation().await;
        drop(held);
        tracing::trace!(lock = name, "lock released");
        Ok(LockOutcome::Acquired(value))
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
