// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport selection, resolved once per agent.
//!
//! 1. If a native source is configured, probe it. Success pins the agent to
//!    the native transport.
//! 2. Otherwise (or if the probe fails) use the storage-signal fallback for
//!    the rest of the agent's lifetime.
//! 3. With neither available the bus is disabled and every operation is a
//!    no-op.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::fallback::{self, DEFAULT_SIGNAL_KEY};
use crate::bus::{nats, LocalHub, MessageBus, Outbound, LOCAL_CAPACITY};
use crate::error::ErrorKind;
use crate::store::SignalStore;
use crate::topic::{AgentId, Envelope};

/// Which transport the bus ended up on. This is the capability flag every
/// bus operation branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Native,
    Fallback,
    Disabled,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Fallback => f.write_str("fallback"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

/// A native multicast primitive to probe for.
#[derive(Clone)]
pub enum NativeSource {
    Hub(LocalHub),
    Nats { url: String, token: Option<String>, subject: String, connect_timeout: Duration },
}

/// Inputs to transport selection.
#[derive(Clone)]
pub struct TransportOptions {
    pub native: Option<NativeSource>,
    pub fallback: Option<Arc<dyn SignalStore>>,
    pub signal_key: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self { native: None, fallback: None, signal_key: DEFAULT_SIGNAL_KEY.to_owned() }
    }
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn native(mut self, source: NativeSource) -> Self {
        self.native = Some(source);
        self
    }

    pub fn fallback(mut self, store: Arc<dyn SignalStore>) -> Self {
        self.fallback = Some(store);
        self
    }

    pub fn signal_key(mut self, key: impl Into<String>) -> Self {
        self.signal_key = key.into();
        self
    }
}

/// Probe the configured transports and open the bus on the first that works.
pub(crate) async fn select(me: AgentId, options: TransportOptions) -> MessageBus {
    let shutdown = CancellationToken::new();
    let (local, _) = broadcast::channel(LOCAL_CAPACITY);

    if let Some(source) = options.native {
        match probe_native(source, me, &local, &shutdown).await {
            Ok(outbound) => {
                tracing::info!(agent = %me, transport = %TransportKind::Native, "message bus open");
                return MessageBus::assemble(me, TransportKind::Native, outbound, local, shutdown);
            }
            Err(e) => {
                tracing::warn!(agent = %me, "{}: {e:#}; switching to fallback", ErrorKind::TransportUnavailable);
            }
        }
    }

    if let Some(store) = options.fallback {
        match fallback::spawn_pump(&store, options.signal_key.clone(), me, local.clone(), shutdown.clone()) {
            Ok(()) => {
                tracing::info!(agent = %me, transport = %TransportKind::Fallback, key = %options.signal_key, "message bus open");
                let outbound = Outbound::Signal { store, key: options.signal_key };
                return MessageBus::assemble(me, TransportKind::Fallback, outbound, local, shutdown);
            }
            Err(e) => {
                tracing::warn!(agent = %me, "fallback transport unavailable: {e:#}");
            }
        }
    }

    tracing::info!(agent = %me, "no transport available; message bus disabled");
    MessageBus::assemble(me, TransportKind::Disabled, Outbound::Disabled, local, shutdown)
}

async fn probe_native(
    source: NativeSource,
    me: AgentId,
    local: &broadcast::Sender<Envelope>,
    shutdown: &CancellationToken,
) -> anyhow::Result<Outbound> {
    match source {
        NativeSource::Hub(hub) => {
            hub.spawn_pump(me, local.clone(), shutdown.clone());
            Ok(Outbound::Hub(hub))
        }
        NativeSource::Nats { url, token, subject, connect_timeout } => {
            let client = nats::connect(&url, token.as_deref(), connect_timeout).await?;
            let (tx, writer) = nats::spawn(client, subject, me, local.clone(), shutdown.clone()).await?;
            Ok(Outbound::Nats { tx, writer: Mutex::new(Some(writer)) })
        }
    }
}
