// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Storage-signal transport used when no native multicast exists.
//!
//! Publishing writes the encoded envelope to one well-known key and clears it
//! right away. Stores only report real changes, so the clear is what lets an
//! identical follow-up publish notify again. The store is a signal only,
//! never persisted state.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::deliver;
use crate::error::ErrorKind;
use crate::store::SignalStore;
use crate::topic::{AgentId, Envelope};

/// Default signal key shared by every agent of one origin.
pub const DEFAULT_SIGNAL_KEY: &str = "concord.bus";

pub(crate) fn publish(store: &dyn SignalStore, key: &str, envelope: &Envelope) {
    let raw = match envelope.encode() {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("{}: failed to encode envelope: {e}", ErrorKind::SerializationFailure);
            return;
        }
    };
    if let Err(e) = store.set(key, &raw) {
        tracing::warn!(key, "fallback publish failed: {e:#}");
        return;
    }
    if let Err(e) = store.remove(key) {
        tracing::warn!(key, "fallback signal clear failed: {e:#}");
    }
}

/// Decode a signal value into an envelope. Empty values are the clears.
pub fn decode_signal(value: &str) -> Option<anyhow::Result<Envelope>> {
    if value.is_empty() {
        return None;
    }
    Some(Envelope::decode(value.as_bytes()))
}

/// Watch `key` and redeliver every signalled envelope locally until shutdown.
pub(crate) fn spawn_pump(
    store: &Arc<dyn SignalStore>,
    key: String,
    me: AgentId,
    local: broadcast::Sender<Envelope>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut changes = store.watch()?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.next() => {
                    let Some(change) = change else { break };
                    if change.key != key {
                        continue;
                    }
                    let Some(value) = change.value else { continue };
                    match decode_signal(&value) {
                        Some(Ok(envelope)) => deliver(&local, me, envelope),
                        Some(Err(e)) => {
                            tracing::warn!(agent = %me, key = %key, "{}: dropping malformed signal: {e}", ErrorKind::SerializationFailure);
                        }
                        None => {}
                    }
                }
            }
        }
        tracing::trace!(agent = %me, "fallback pump stopped");
    });
    Ok(())
}
