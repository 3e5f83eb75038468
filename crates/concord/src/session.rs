// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Login/logout propagation between agents.
//!
//! The agent where the user acts writes durable storage once, publishes, and
//! navigates. Every other agent applies the message through the
//! `on_external_*` handlers, which write storage and navigate but never
//! publish, so a broadcast cannot bounce back and forth.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::store::KeyValueStore;
use crate::topic::{LoginPayload, LogoutPayload, Topic};

/// Default durable key holding the session token.
pub const DEFAULT_SESSION_KEY: &str = "auth_token";

/// Moves the host to a route. Implemented by whatever owns navigation.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

/// Durable session state: either fully set or fully absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: Option<String>,
}

impl AuthSession {
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

/// Where to navigate after each transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routes {
    pub authenticated: String,
    pub login: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self { authenticated: "/".to_owned(), login: "/login".to_owned() }
    }
}

#[derive(Clone)]
pub struct SessionSync {
    bus: Arc<MessageBus>,
    store: Arc<dyn KeyValueStore>,
    navigator: Arc<dyn Navigator>,
    key: String,
    routes: Routes,
}

impl SessionSync {
    pub fn new(bus: Arc<MessageBus>, store: Arc<dyn KeyValueStore>, navigator: Arc<dyn Navigator>) -> Self {
        Self { bus, store, navigator, key: DEFAULT_SESSION_KEY.to_owned(), routes: Routes::default() }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_routes(mut self, routes: Routes) -> Self {
        self.routes = routes;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current(&self) -> anyhow::Result<AuthSession> {
        Ok(AuthSession { token: self.store.get(&self.key)? })
    }

    /// Local login: persist, tell the other agents, then navigate.
    pub fn login(&self, token: &str) -> anyhow::Result<()> {
        self.store.set(&self.key, token)?;
        self.bus.publish(Topic::Login, &LoginPayload { token: token.to_owned() });
        tracing::info!(agent = %self.bus.id(), "logged in");
        self.navigator.navigate(&self.routes.authenticated);
        Ok(())
    }

    /// Local logout: clear, tell the other agents, then navigate.
    pub fn logout(&self, reason: &str) -> anyhow::Result<()> {
        self.store.remove(&self.key)?;
        self.bus.publish(Topic::Logout, &LogoutPayload { reason: reason.to_owned() });
        tracing::info!(agent = %self.bus.id(), reason, "logged out");
        self.navigator.navigate(&self.routes.login);
        Ok(())
    }

    pub fn on_external_login(&self, token: &str) -> anyhow::Result<()> {
        self.store.set(&self.key, token)?;
        tracing::info!(agent = %self.bus.id(), "login applied from another agent");
        self.navigator.navigate(&self.routes.authenticated);
        Ok(())
    }

    pub fn on_external_logout(&self, reason: &str) -> anyhow::Result<()> {
        self.store.remove(&self.key)?;
        tracing::info!(agent = %self.bus.id(), reason, "logout applied from another agent");
        self.navigator.navigate(&self.routes.login);
        Ok(())
    }

    /// Apply login/logout broadcasts from other agents until the bus closes.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let mut messages = self.bus.subscribe_many(&[Topic::Login, Topic::Logout]);
        let session = self.clone();

        tokio::spawn(async move {
            while let Some((topic, data)) = messages.next().await {
                if let Err(e) = session.apply(topic, data) {
                    tracing::warn!(agent = %session.bus.id(), %topic, "failed to apply session message: {e:#}");
                }
            }
            tracing::trace!(agent = %session.bus.id(), "session listener stopped");
        })
    }

    fn apply(&self, topic: Topic, data: serde_json::Value) -> anyhow::Result<()> {
        match topic {
            Topic::Login => {
                let payload: LoginPayload = serde_json::from_value(data)?;
                self.on_external_login(&payload.token)
            }
            Topic::Logout => {
                let payload: LogoutPayload = serde_json::from_value(data)?;
                self.on_external_logout(&payload.reason)
            }
            Topic::SyncComplete | Topic::DataUpdated => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
