// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;

use super::{MessageBus, NativeSource, TransportKind, TransportOptions};
use crate::bus::fallback::{decode_signal, DEFAULT_SIGNAL_KEY};
use crate::bus::LocalHub;
use crate::store::{KeyValueStore, MemoryStore, SignalStore};
use crate::topic::{AgentId, Envelope, LoginPayload, Topic};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

async fn next<T>(stream: &mut BoxStream<'static, T>) -> anyhow::Result<T> {
    tokio::time::timeout(WAIT, stream.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("stream ended"))
}

async fn assert_quiet<T: std::fmt::Debug>(stream: &mut BoxStream<'static, T>) {
    let got = tokio::time::timeout(QUIET, stream.next()).await;
    assert!(got.is_err(), "unexpected delivery: {got:?}");
}

async fn hub_bus(hub: &LocalHub) -> MessageBus {
    MessageBus::open(AgentId::new(), TransportOptions::new().native(NativeSource::Hub(hub.clone()))).await
}

async fn fallback_bus(store: &MemoryStore) -> MessageBus {
    let store: Arc<dyn SignalStore> = Arc::new(store.handle());
    MessageBus::open(AgentId::new(), TransportOptions::new().fallback(store)).await
}

#[tokio::test]
async fn native_delivers_to_others_but_not_sender() -> anyhow::Result<()> {
    let hub = LocalHub::new();
    let a = hub_bus(&hub).await;
    let b = hub_bus(&hub).await;
    assert_eq!(a.kind(), TransportKind::Native);

    let mut a_rx = a.subscribe(Topic::Login);
    let mut b_rx = b.subscribe(Topic::Login);

    a.publish(Topic::Login, &LoginPayload { token: "T1".into() });

    assert_eq!(next(&mut b_rx).await?, json!({ "token": "T1" }));
    assert_quiet(&mut a_rx).await;
    Ok(())
}

#[tokio::test]
async fn fallback_delivers_to_others_but_not_sender() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let a = fallback_bus(&store).await;
    let b = fallback_bus(&store).await;
    assert_eq!(a.kind(), TransportKind::Fallback);

    let mut a_rx = a.subscribe(Topic::Logout);
    let mut b_rx = b.subscribe(Topic::Logout);

    a.publish(Topic::Logout, &json!({ "reason": "user" }));

    assert_eq!(next(&mut b_rx).await?, json!({ "reason": "user" }));
    assert_quiet(&mut a_rx).await;
    // The signal key is cleared immediately after each publish.
    assert_eq!(store.get(DEFAULT_SIGNAL_KEY)?, None);
    Ok(())
}

#[tokio::test]
async fn fallback_redelivers_identical_payloads() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let a = fallback_bus(&store).await;
    let b = fallback_bus(&store).await;
    let mut rx = b.subscribe(Topic::DataUpdated);

    a.publish(Topic::DataUpdated, &json!([1, 2]));
    a.publish(Topic::DataUpdated, &json!([1, 2]));

    assert_eq!(next(&mut rx).await?, json!([1, 2]));
    assert_eq!(next(&mut rx).await?, json!([1, 2]));
    Ok(())
}

#[tokio::test]
async fn subscribers_only_see_their_topic() -> anyhow::Result<()> {
    let hub = LocalHub::new();
    let a = hub_bus(&hub).await;
    let b = hub_bus(&hub).await;
    let mut login = b.subscribe(Topic::Login);
    let mut logout = b.subscribe(Topic::Logout);

    a.publish(Topic::Logout, &json!({ "reason": "expired" }));

    assert_eq!(next(&mut logout).await?, json!({ "reason": "expired" }));
    assert_quiet(&mut login).await;
    Ok(())
}

#[tokio::test]
async fn every_subscription_gets_every_message() -> anyhow::Result<()> {
    let hub = LocalHub::new();
    let a = hub_bus(&hub).await;
    let b = hub_bus(&hub).await;
    let mut first = b.subscribe(Topic::SyncComplete);
    let mut second = b.subscribe(Topic::SyncComplete);

    a.publish(Topic::SyncComplete, &json!(["x"]));

    assert_eq!(next(&mut first).await?, json!(["x"]));
    assert_eq!(next(&mut second).await?, json!(["x"]));
    Ok(())
}

#[tokio::test]
async fn per_sender_order_is_preserved() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let a = fallback_bus(&store).await;
    let b = fallback_bus(&store).await;
    let mut rx = b.subscribe(Topic::DataUpdated);

    for i in 0..20 {
        a.publish(Topic::DataUpdated, &i);
    }
    for i in 0..20 {
        assert_eq!(next(&mut rx).await?, json!(i));
    }
    Ok(())
}

#[tokio::test]
async fn malformed_signal_is_dropped() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let a = fallback_bus(&store).await;
    let b = fallback_bus(&store).await;
    let mut rx = b.subscribe(Topic::Login);

    // A foreign writer puts garbage on the signal key.
    let rogue = store.handle();
    rogue.set(DEFAULT_SIGNAL_KEY, "{not json")?;
    rogue.remove(DEFAULT_SIGNAL_KEY)?;
    a.publish(Topic::Login, &LoginPayload { token: "T2".into() });

    assert_eq!(next(&mut rx).await?, json!({ "token": "T2" }));
    Ok(())
}

#[tokio::test]
async fn subscribe_as_skips_payloads_of_the_wrong_shape() -> anyhow::Result<()> {
    let hub = LocalHub::new();
    let a = hub_bus(&hub).await;
    let b = hub_bus(&hub).await;
    let mut rx = b.subscribe_as::<LoginPayload>(Topic::Login);

    a.publish(Topic::Login, &json!({ "nope": 1 }));
    a.publish(Topic::Login, &LoginPayload { token: "T3".into() });

    assert_eq!(next(&mut rx).await?, LoginPayload { token: "T3".into() });
    Ok(())
}

#[tokio::test]
async fn disabled_bus_is_a_no_op() -> anyhow::Result<()> {
    let bus = MessageBus::open(AgentId::new(), TransportOptions::new()).await;
    assert_eq!(bus.kind(), TransportKind::Disabled);
    assert!(!bus.is_enabled());

    bus.publish(Topic::Login, &LoginPayload { token: "T".into() });
    let mut rx = bus.subscribe(Topic::Login);
    assert!(rx.next().await.is_none());

    let explicit = MessageBus::disabled(AgentId::new());
    assert_eq!(explicit.kind(), TransportKind::Disabled);
    Ok(())
}

#[tokio::test]
async fn close_ends_subscriptions_and_drops_publishes() -> anyhow::Result<()> {
    let hub = LocalHub::new();
    let a = hub_bus(&hub).await;
    let b = hub_bus(&hub).await;
    let mut rx = b.subscribe(Topic::Login);
    let mut tap = hub.tap();

    b.close();
    b.close();
    assert!(b.is_closed());
    assert!(tokio::time::timeout(WAIT, rx.next()).await?.is_none());

    b.publish(Topic::Login, &json!({ "token": "late" }));
    a.publish(Topic::Login, &json!({ "token": "ok" }));
    let seen = tokio::time::timeout(WAIT, tap.recv()).await??;
    assert_eq!(seen.sender, a.id());
    Ok(())
}

#[tokio::test]
async fn unreachable_nats_falls_back() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let options = TransportOptions::new()
        .native(NativeSource::Nats {
            url: "nats://127.0.0.1:1".into(),
            token: None,
            subject: "concord.test".into(),
            connect_timeout: Duration::from_millis(200),
        })
        .fallback(Arc::new(store.handle()));

    let bus = MessageBus::open(AgentId::new(), options).await;
    assert_eq!(bus.kind(), TransportKind::Fallback);
    Ok(())
}

#[tokio::test]
async fn custom_signal_key_is_used() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let observer = store.handle();
    let mut changes = observer.watch()?;
    let bus = MessageBus::open(
        AgentId::new(),
        TransportOptions::new().fallback(Arc::new(store.handle())).signal_key("app.signal"),
    )
    .await;

    bus.publish(Topic::Login, &LoginPayload { token: "T".into() });

    let change = next(&mut changes).await?;
    assert_eq!(change.key, "app.signal");
    let raw = change.value.ok_or_else(|| anyhow::anyhow!("expected a set"))?;
    let envelope: Envelope = decode_signal(&raw).ok_or_else(|| anyhow::anyhow!("empty signal"))??;
    assert_eq!(envelope.topic, Topic::Login);
    assert_eq!(envelope.sender, bus.id());
    Ok(())
}

#[tokio::test]
async fn subscribe_many_keeps_order_across_topics() -> anyhow::Result<()> {
    let hub = LocalHub::new();
    let a = hub_bus(&hub).await;
    let b = hub_bus(&hub).await;
    let mut rx = b.subscribe_many(&[Topic::Login, Topic::Logout]);

    a.publish(Topic::Login, &json!({ "token": "T1" }));
    a.publish(Topic::DataUpdated, &json!(1));
    a.publish(Topic::Logout, &json!({ "reason": "user" }));
    a.publish(Topic::Login, &json!({ "token": "T2" }));

    assert_eq!(next(&mut rx).await?.0, Topic::Login);
    assert_eq!(next(&mut rx).await?.0, Topic::Logout);
    assert_eq!(next(&mut rx).await?, (Topic::Login, json!({ "token": "T2" })));
    Ok(())
}
