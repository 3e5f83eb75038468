// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process native multicast for agents that share one address space
//! (embedded hosts, tests). Clones share one broadcast channel.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::deliver;
use crate::topic::{AgentId, Envelope};

const HUB_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct LocalHub {
    tx: broadcast::Sender<Envelope>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(HUB_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Raw view of every envelope on the hub, including each sender's own.
    pub fn tap(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub(crate) fn send(&self, envelope: Envelope) {
        // No receivers just means no other agent is listening yet.
        let _ = self.tx.send(envelope);
    }

    /// Forward hub traffic to this agent's local subscribers until shutdown.
    pub(crate) fn spawn_pump(
        &self,
        me: AgentId,
        local: broadcast::Sender<Envelope>,
        shutdown: CancellationToken,
    ) {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(envelope) => deliver(&local, me, envelope),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(agent = %me, skipped = n, "hub pump lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::trace!(agent = %me, "hub pump stopped");
        });
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}
