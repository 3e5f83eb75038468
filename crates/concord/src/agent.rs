// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One coordination participant: a bus handle plus a lock manager.
//!
//! Construct once per execution context and hand the agent to whatever needs
//! to publish, subscribe, or run rounds. Dropping it releases the bus.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::{MessageBus, TransportKind, TransportOptions};
use crate::lock::{LocalLocks, LockManager};
use crate::round::RoundRunner;
use crate::session::{Navigator, SessionSync};
use crate::store::KeyValueStore;
use crate::topic::AgentId;

/// Everything an agent needs at start.
#[derive(Clone)]
pub struct AgentOptions {
    pub transport: TransportOptions,
    pub locks: LockManager,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self { transport: TransportOptions::default(), locks: LockManager::local(LocalLocks::default()) }
    }
}

impl AgentOptions {
    pub fn new(transport: TransportOptions, locks: LockManager) -> Self {
        Self { transport, locks }
    }
}

pub struct Agent {
    id: AgentId,
    bus: Arc<MessageBus>,
    locks: LockManager,
}

impl Agent {
    /// Select a transport and open this agent's bus.
    pub async fn start(options: AgentOptions) -> Self {
        let id = AgentId::new();
        let bus = MessageBus::open(id, options.transport).await;
        tracing::info!(agent = %id, transport = %bus.kind(), "agent started");
        Self { id, bus: Arc::new(bus), locks: options.locks }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.bus.kind()
    }

    pub fn round_runner<T>(&self, name: impl Into<String>) -> RoundRunner<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        RoundRunner::new(name, self.bus(), self.locks.clone())
    }

    pub fn session(&self, store: Arc<dyn KeyValueStore>, navigator: Arc<dyn Navigator>) -> SessionSync {
        SessionSync::new(self.bus(), store, navigator)
    }

    /// Close the bus and wait for queued publishes to flush. Listeners
    /// spawned from this agent end shortly after.
    pub async fn shutdown(&self) {
        if !self.bus.is_closed() {
            tracing::info!(agent = %self.id, "agent shutting down");
        }
        self.bus.close_and_flush().await;
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.bus.close();
    }
}
