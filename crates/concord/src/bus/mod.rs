// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topic-based publish/subscribe between agents.
//!
//! Inbound traffic from whichever transport was selected is pumped into a
//! per-agent broadcast channel; subscribers filter it by topic. Envelopes sent
//! by this agent are dropped at that pump, so no consumer ever sees its own
//! publish.

pub mod fallback;
pub mod hub;
pub mod nats;
pub mod transport;

use std::sync::Arc;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::store::SignalStore;
use crate::topic::{AgentId, Envelope, Topic};

pub use hub::LocalHub;
pub use transport::{NativeSource, TransportKind, TransportOptions};

/// Capacity of the per-agent fan-out channel.
const LOCAL_CAPACITY: usize = 1024;

/// Outbound half of the selected transport.
enum Outbound {
    Hub(LocalHub),
    Nats { tx: mpsc::UnboundedSender<Envelope>, writer: Mutex<Option<JoinHandle<()>>> },
    Signal { store: Arc<dyn SignalStore>, key: String },
    Disabled,
}

/// Hand an inbound envelope to local subscribers unless this agent sent it.
fn deliver(local: &broadcast::Sender<Envelope>, me: AgentId, envelope: Envelope) {
    if envelope.sender == me {
        tracing::trace!(agent = %me, topic = %envelope.topic, "suppressed own echo");
        return;
    }
    // No subscribers is fine: delivery is best-effort.
    let _ = local.send(envelope);
}

/// One agent's bus handle. Closing it (explicitly or by drop) stops the
/// transport tasks and ends every subscription stream.
pub struct MessageBus {
    id: AgentId,
    kind: TransportKind,
    outbound: Outbound,
    local: broadcast::Sender<Envelope>,
    shutdown: CancellationToken,
}

impl MessageBus {
    /// Select a transport and open the bus for agent `id`.
    pub async fn open(id: AgentId, options: TransportOptions) -> Self {
        transport::select(id, options).await
    }

    /// A bus with no transport at all: publish and subscribe are no-ops.
    pub fn disabled(id: AgentId) -> Self {
        let (local, _) = broadcast::channel(1);
        Self::assemble(id, TransportKind::Disabled, Outbound::Disabled, local, CancellationToken::new())
    }

    fn assemble(
        id: AgentId,
        kind: TransportKind,
        outbound: Outbound,
        local: broadcast::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { id, kind, outbound, local, shutdown }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != TransportKind::Disabled
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Fire-and-forget publish. Returns without waiting for delivery;
    /// failures are logged and never reach subscribers.
    pub fn publish<T: Serialize + ?Sized>(&self, topic: Topic, payload: &T) {
        if self.shutdown.is_cancelled() {
            tracing::debug!(agent = %self.id, topic = %topic, "bus closed; publish dropped");
            return;
        }
        if !self.is_enabled() {
            tracing::trace!(agent = %self.id, topic = %topic, "bus disabled; publish skipped");
            return;
        }

        let data = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(agent = %self.id, topic = %topic, "{}: dropping payload: {e}", ErrorKind::SerializationFailure);
                return;
            }
        };
        let envelope = Envelope { topic, data, sender: self.id };
        tracing::debug!(agent = %self.id, topic = %topic, transport = %self.kind, "publish");

        match &self.outbound {
            Outbound::Hub(hub) => hub.send(envelope),
            Outbound::Nats { tx, .. } => {
                if tx.send(envelope).is_err() {
                    tracing::debug!(agent = %self.id, "NATS writer gone; publish dropped");
                }
            }
            Outbound::Signal { store, key } => fallback::publish(store.as_ref(), key, &envelope),
            Outbound::Disabled => {}
        }
    }

    /// Stream of payloads published by other agents on `topic`, starting now
    /// and ending when this bus closes. Each call is independent.
    pub fn subscribe(&self, topic: Topic) -> BoxStream<'static, serde_json::Value> {
        self.subscribe_many(&[topic]).map(|(_, data)| data).boxed()
    }

    /// One stream over several topics, in arrival order. Use this instead of
    /// merging per-topic streams when order across topics matters.
    pub fn subscribe_many(&self, topics: &[Topic]) -> BoxStream<'static, (Topic, serde_json::Value)> {
        if !self.is_enabled() {
            return stream::empty().boxed();
        }

        let me = self.id;
        let topics = topics.to_vec();
        BroadcastStream::new(self.local.subscribe())
            .filter_map(move |item| {
                let message = match item {
                    Ok(envelope) if topics.contains(&envelope.topic) => Some((envelope.topic, envelope.data)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        tracing::debug!(agent = %me, skipped = n, "subscriber lagged");
                        None
                    }
                };
                futures_util::future::ready(message)
            })
            .take_until(self.shutdown.clone().cancelled_owned())
            .boxed()
    }

    /// Like [`subscribe`](Self::subscribe), decoding each payload as `T`.
    /// Payloads that fail to decode are logged and skipped.
    pub fn subscribe_as<T>(&self, topic: Topic) -> BoxStream<'static, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let me = self.id;
        self.subscribe(topic)
            .filter_map(move |data| {
                let decoded = match serde_json::from_value::<T>(data) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(agent = %me, topic = %topic, "{}: dropping malformed payload: {e}", ErrorKind::SerializationFailure);
                        None
                    }
                };
                futures_util::future::ready(decoded)
            })
            .boxed()
    }

    /// Release the transport. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(agent = %self.id, transport = %self.kind, "message bus closed");
            self.shutdown.cancel();
        }
    }

    /// Close, then wait until anything already published has left this
    /// process. Only the NATS writer buffers; other transports write inline.
    pub async fn close_and_flush(&self) {
        self.close();
        let writer = match &self.outbound {
            Outbound::Nats { writer, .. } => writer.lock().take(),
            _ => None,
        };
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::debug!(agent = %self.id, "NATS writer ended abnormally: {e}");
            }
        }
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
