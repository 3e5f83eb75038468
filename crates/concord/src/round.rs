// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Leader-coordinated rounds.
//!
//! When several agents trigger the same round at once, the one that wins the
//! non-blocking lock runs the task body, appends its result to the shared
//! snapshot, and broadcasts the whole snapshot while still holding the lock.
//! Everyone else waits for that broadcast and replaces their snapshot
//! wholesale. Broadcasts carry the round name, so rounds sharing a topic
//! leave each other's snapshots alone. Followers never retry; if the leader dies before publishing they
//! stay waiting unless a round deadline is configured.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::error::ErrorKind;
use crate::lock::{LockManager, LockMode, LockOutcome};
use crate::topic::Topic;

/// Where this agent is within the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Idle,
    AttemptingLock,
    Executing,
    Broadcasting,
    Waiting,
    Applying,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AttemptingLock => "attempting_lock",
            Self::Executing => "executing",
            Self::Broadcasting => "broadcasting",
            Self::Waiting => "waiting",
            Self::Applying => "applying",
        }
    }
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `trigger` did this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome<T> {
    /// This agent led the round; carries the snapshot it broadcast.
    Leader(Vec<T>),
    /// Another agent holds the round; this one waits for its snapshot.
    Follower,
}

impl<T> RoundOutcome<T> {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }
}

/// Result of waiting for a follower's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Convergence {
    /// A snapshot arrived (or none was awaited).
    Applied,
    /// The round deadline expired first.
    Stale,
}

/// What a leader broadcasts: the round it led and the full new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot<T> {
    pub round: String,
    pub entries: Vec<T>,
}

pub struct RoundRunner<T> {
    name: String,
    topic: Topic,
    bus: Arc<MessageBus>,
    locks: LockManager,
    state: Arc<watch::Sender<Vec<T>>>,
    phase: Arc<watch::Sender<RoundPhase>>,
    deadline: Option<Duration>,
}

impl<T> RoundRunner<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// A runner for the round `name`, publishing on [`Topic::SyncComplete`].
    pub fn new(name: impl Into<String>, bus: Arc<MessageBus>, locks: LockManager) -> Self {
        Self {
            name: name.into(),
            topic: Topic::SyncComplete,
            bus,
            locks,
            state: Arc::new(watch::channel(Vec::new()).0),
            phase: Arc::new(watch::channel(RoundPhase::Idle).0),
            deadline: None,
        }
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    /// How long [`await_convergence`](Self::await_convergence) waits before
    /// reporting the round stale. `None` waits indefinitely.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_initial(self, snapshot: Vec<T>) -> Self {
        self.state.send_replace(snapshot);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.state.borrow().clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<Vec<T>> {
        self.state.subscribe()
    }

    pub fn phase(&self) -> RoundPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<RoundPhase> {
        self.phase.subscribe()
    }

    /// Apply every snapshot broadcast by other agents until the bus closes.
    ///
    /// Subscribes before returning, so call it before the first `trigger`.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let mut snapshots = self.bus.subscribe_as::<RoundSnapshot<T>>(self.topic);
        let state = Arc::clone(&self.state);
        let phase = Arc::clone(&self.phase);
        let name = self.name.clone();
        let agent = self.bus.id();

        tokio::spawn(async move {
            while let Some(RoundSnapshot { round, entries: snapshot }) = snapshots.next().await {
                if round != name {
                    tracing::trace!(%agent, round = %name, other = %round, "ignoring snapshot for another round");
                    continue;
                }
                phase.send_if_modified(|p| match p {
                    RoundPhase::Waiting | RoundPhase::AttemptingLock => {
                        *p = RoundPhase::Applying;
                        true
                    }
                    _ => false,
                });
                tracing::debug!(%agent, round = %name, entries = snapshot.len(), "applying snapshot");
                state.send_replace(snapshot);
                phase.send_if_modified(|p| {
                    if *p == RoundPhase::Applying {
                        *p = RoundPhase::Idle;
                        true
                    } else {
                        false
                    }
                });
            }
            tracing::trace!(%agent, round = %name, "round listener stopped");
        })
    }

    /// Attempt to lead one round.
    ///
    /// The winner runs `task` with the current snapshot; its result is
    /// appended and the new snapshot broadcast. A failing task broadcasts
    /// nothing and its error, tagged [`ErrorKind::OperationFailure`], is
    /// returned here.
    pub async fn trigger<F, Fut>(&self, task: F) -> anyhow::Result<RoundOutcome<T>>
    where
        F: FnOnce(Vec<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let agent = self.bus.id();
        self.phase.send_replace(RoundPhase::AttemptingLock);

        let result = self.locks.request(&self.name, LockMode::IfAvailable, || self.lead(task)).await;
        match result {
            Ok(LockOutcome::Acquired(Ok(snapshot))) => {
                self.phase.send_replace(RoundPhase::Idle);
                Ok(RoundOutcome::Leader(snapshot))
            }
            Ok(LockOutcome::Acquired(Err(e))) => {
                self.phase.send_replace(RoundPhase::Idle);
                tracing::error!(%agent, round = %self.name, "round task failed: {e:#}");
                Err(e)
            }
            Ok(LockOutcome::Unavailable) => {
                // A snapshot may already have landed while we were trying.
                self.phase.send_if_modified(|p| {
                    if *p == RoundPhase::AttemptingLock {
                        *p = RoundPhase::Waiting;
                        true
                    } else {
                        false
                    }
                });
                tracing::debug!(%agent, round = %self.name, "{}; following", ErrorKind::LockUnavailable);
                Ok(RoundOutcome::Follower)
            }
            Err(e) => {
                self.phase.send_replace(RoundPhase::Idle);
                Err(e)
            }
        }
    }

    async fn lead<F, Fut>(&self, task: F) -> anyhow::Result<Vec<T>>
    where
        F: FnOnce(Vec<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let agent = self.bus.id();
        self.phase.send_replace(RoundPhase::Executing);
        tracing::info!(%agent, round = %self.name, "leading round");

        let previous = self.snapshot();
        let entry = task(previous.clone()).await.map_err(|e| e.context(ErrorKind::OperationFailure))?;

        let mut snapshot = previous;
        snapshot.push(entry);

        self.phase.send_replace(RoundPhase::Broadcasting);
        let message = RoundSnapshot { round: self.name.clone(), entries: snapshot };
        self.bus.publish(self.topic, &message);
        let snapshot = message.entries;
        self.state.send_replace(snapshot.clone());
        tracing::info!(%agent, round = %self.name, entries = snapshot.len(), "round complete");
        Ok(snapshot)
    }

    /// Wait for a follower's snapshot to be applied.
    ///
    /// Returns immediately unless this agent is waiting. With a deadline set,
    /// expiry logs a warning, returns the agent to idle, and reports
    /// [`Convergence::Stale`]; nothing is retried.
    pub async fn await_convergence(&self) -> Convergence {
        let mut phases = self.phase.subscribe();
        let applied = async move {
            let settled = phases.wait_for(|p| *p != RoundPhase::Waiting).await.is_ok();
            settled
        };

        let Some(deadline) = self.deadline else {
            applied.await;
            return Convergence::Applied;
        };
        if tokio::time::timeout(deadline, applied).await.is_ok() {
            return Convergence::Applied;
        }

        tracing::warn!(
            agent = %self.bus.id(),
            round = %self.name,
            ?deadline,
            "no snapshot before round deadline; local state may be stale"
        );
        self.phase.send_if_modified(|p| {
            if *p == RoundPhase::Waiting {
                *p = RoundPhase::Idle;
                true
            } else {
                false
            }
        });
        Convergence::Stale
    }
}

#[cfg(test)]
#[path = "round_tests.rs"]
mod tests;
