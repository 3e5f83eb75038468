// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS native multicast for sibling processes.
//!
//! Every envelope goes to one subject. A single writer task drains an ordered
//! queue so per-sender order matches `publish` call order; a reader task
//! decodes inbound messages and hands them to the local fan-out.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::deliver;
use crate::error::ErrorKind;
use crate::topic::{AgentId, Envelope};

/// Connect to the NATS server. A failure here is the probe failing.
pub async fn connect(
    url: &str,
    token: Option<&str>,
    connect_timeout: Duration,
) -> anyhow::Result<async_nats::Client> {
    let mut opts = async_nats::ConnectOptions::new().connection_timeout(connect_timeout);
    if let Some(token) = token {
        opts = opts.token(token.to_owned());
    }

    tracing::info!(url, "connecting NATS transport");
    let client = opts.connect(url).await?;
    tracing::info!(url, "NATS transport connected");
    Ok(client)
}

/// Subscribe to `subject` and start the reader and writer tasks.
///
/// Returns the queue feeding the writer and the writer's handle, which
/// finishes once the queue is flushed after shutdown. The subscription is
/// established before this returns, so nothing published afterwards is missed.
pub(crate) async fn spawn(
    client: async_nats::Client,
    subject: String,
    me: AgentId,
    local: broadcast::Sender<Envelope>,
    shutdown: CancellationToken,
) -> anyhow::Result<(mpsc::UnboundedSender<Envelope>, JoinHandle<()>)> {
    let mut sub = client.subscribe(subject.clone()).await?;

    let reader_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_shutdown.cancelled() => break,
                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    match Envelope::decode(&msg.payload) {
                        Ok(envelope) => deliver(&local, me, envelope),
                        Err(e) => {
                            tracing::warn!(agent = %me, "{}: dropping malformed NATS message: {e}", ErrorKind::SerializationFailure);
                        }
                    }
                }
            }
        }
        let _ = sub.unsubscribe().await;
        tracing::debug!(agent = %me, "NATS reader shutting down");
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    publish_one(&client, &subject, &envelope).await;
                }
                _ = shutdown.cancelled() => {
                    // Flush whatever was queued before teardown.
                    while let Ok(envelope) = rx.try_recv() {
                        publish_one(&client, &subject, &envelope).await;
                    }
                    break;
                }
            }
        }
        if let Err(e) = client.flush().await {
            tracing::debug!("NATS flush on shutdown failed: {e}");
        }
        tracing::debug!(agent = %me, "NATS writer shutting down");
    });

    Ok((tx, writer))
}

async fn publish_one(client: &async_nats::Client, subject: &str, envelope: &Envelope) {
    let payload = match envelope.encode() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("{}: failed to encode envelope: {e}", ErrorKind::SerializationFailure);
            return;
        }
    };
    if let Err(e) = client.publish(subject.to_owned(), payload.into()).await {
        tracing::warn!("NATS publish to {subject} failed: {e}");
    }
}
