// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;

#[test]
fn envelope_wire_shape() -> anyhow::Result<()> {
    let sender = AgentId::new();
    let env = Envelope { topic: Topic::SyncComplete, data: json!(["a", "b"]), sender };
    let value: serde_json::Value = serde_json::from_str(&env.encode()?)?;
    assert_eq!(value["topic"], "sync_complete");
    assert_eq!(value["data"], json!(["a", "b"]));
    assert_eq!(value["sender"], sender.to_string());
    Ok(())
}

#[test]
fn decode_rejects_unknown_topic() {
    let raw = br#"{"topic":"reboot","data":null,"sender":"00000000-0000-0000-0000-000000000000"}"#;
    assert!(Envelope::decode(raw).is_err());
}

#[test]
fn decode_rejects_missing_sender() {
    assert!(Envelope::decode(br#"{"topic":"login","data":{"token":"t"}}"#).is_err());
}

#[yare::parameterized(
    login = { Topic::Login, "login" },
    logout = { Topic::Logout, "logout" },
    sync_complete = { Topic::SyncComplete, "sync_complete" },
    data_updated = { Topic::DataUpdated, "data_updated" },
)]
fn topic_names_match_serde(topic: Topic, name: &str) {
    assert_eq!(topic.as_str(), name);
    assert_eq!(serde_json::to_value(topic).ok(), Some(json!(name)));
    assert_eq!(name.parse::<Topic>().ok(), Some(topic));
}

#[test]
fn agent_ids_are_distinct() {
    assert_ne!(AgentId::new(), AgentId::new());
}
