// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use proptest::prelude::*;

use super::MemoryStore;
use crate::store::{KeyValueStore, SignalStore, StorageChange};

/// Drain every change currently buffered without waiting.
fn drain(stream: &mut BoxStream<'static, StorageChange>) -> Vec<StorageChange> {
    let mut out = Vec::new();
    while let Some(Some(change)) = stream.next().now_or_never() {
        out.push(change);
    }
    out
}

#[test]
fn handles_share_values() -> anyhow::Result<()> {
    let a = MemoryStore::new();
    let b = a.handle();
    a.set("auth_token", "T1")?;
    assert_eq!(b.get("auth_token")?.as_deref(), Some("T1"));
    b.remove("auth_token")?;
    assert_eq!(a.get("auth_token")?, None);
    Ok(())
}

#[test]
fn other_handles_observe_changes_but_writer_does_not() -> anyhow::Result<()> {
    let a = MemoryStore::new();
    let b = a.handle();
    let mut a_changes = a.watch()?;
    let mut b_changes = b.watch()?;

    a.set("k", "v")?;
    a.remove("k")?;

    assert!(drain(&mut a_changes).is_empty());
    assert_eq!(
        drain(&mut b_changes),
        vec![
            StorageChange { key: "k".into(), value: Some("v".into()) },
            StorageChange { key: "k".into(), value: None },
        ]
    );
    Ok(())
}

#[test]
fn unchanged_value_is_silent() -> anyhow::Result<()> {
    let a = MemoryStore::new();
    let b = a.handle();
    let mut changes = b.watch()?;

    a.set("k", "same")?;
    a.set("k", "same")?;
    a.remove("missing")?;

    assert_eq!(drain(&mut changes).len(), 1);
    Ok(())
}

#[test]
fn separate_stores_are_isolated() -> anyhow::Result<()> {
    let a = MemoryStore::new();
    let b = MemoryStore::new();
    let mut changes = b.watch()?;
    a.set("k", "v")?;
    assert_eq!(b.get("k")?, None);
    assert!(drain(&mut changes).is_empty());
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Set(String),
    Remove,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[ab]{0,2}".prop_map(Op::Set),
        Just(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn notifications_track_real_transitions(ops in proptest::collection::vec(op(), 0..32)) {
        let writer = MemoryStore::new();
        let reader = writer.handle();
        let mut changes = reader.watch().map_err(|e| TestCaseError::fail(e.to_string()))?;

        let mut model: Option<String> = None;
        let mut expected = Vec::new();
        for op in &ops {
            match op {
                Op::Set(v) => {
                    writer.set("k", v).map_err(|e| TestCaseError::fail(e.to_string()))?;
                    if model.as_deref() != Some(v.as_str()) {
                        model = Some(v.clone());
                        expected.push(model.clone());
                    }
                }
                Op::Remove => {
                    writer.remove("k").map_err(|e| TestCaseError::fail(e.to_string()))?;
                    if model.take().is_some() {
                        expected.push(None);
                    }
                }
            }
        }

        let seen: Vec<Option<String>> = drain(&mut changes).into_iter().map(|c| c.value).collect();
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(reader.get("k").map_err(|e| TestCaseError::fail(e.to_string()))?, model);
    }
}
