// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: builders, mocks, and assertion helpers.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::agent::{Agent, AgentOptions};
use crate::bus::{LocalHub, NativeSource, TransportOptions};
use crate::lock::{LocalLocks, LockManager};
use crate::session::Navigator;
use crate::store::{KeyValueStore, SignalStore};

/// Assert that an expression is `Err` and its message contains a substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}

/// Builder for agents in tests. Defaults to a disabled bus and a private
/// lock registry.
#[derive(Default)]
pub struct AgentBuilder {
    transport: TransportOptions,
    locks: Option<LockManager>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub(mut self, hub: &LocalHub) -> Self {
        self.transport = self.transport.native(NativeSource::Hub(hub.clone()));
        self
    }

    pub fn fallback(mut self, store: Arc<dyn SignalStore>) -> Self {
        self.transport = self.transport.fallback(store);
        self
    }

    pub fn transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    pub fn locks(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn registry(self, registry: &LocalLocks) -> Self {
        self.locks(LockManager::local(registry.clone()))
    }

    pub async fn build(self) -> Agent {
        let locks = self.locks.unwrap_or_else(|| LockManager::local(LocalLocks::new()));
        Agent::start(AgentOptions::new(self.transport, locks)).await
    }
}

/// Start `n` agents on one hub sharing one lock registry.
pub async fn hub_agents(n: usize) -> (LocalHub, LocalLocks, Vec<Agent>) {
    let hub = LocalHub::new();
    let registry = LocalLocks::new();
    let mut agents = Vec::with_capacity(n);
    for _ in 0..n {
        agents.push(AgentBuilder::new().hub(&hub).registry(&registry).build().await);
    }
    (hub, registry, agents)
}

/// Navigator that records every path it is sent to.
#[derive(Default)]
pub struct RecordingNavigator {
    paths: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }

    pub fn last(&self) -> Option<String> {
        self.paths.lock().last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str) {
        self.paths.lock().push(path.to_owned());
    }
}

/// Store wrapper that counts writes (`set` and `remove`) made through it.
pub struct CountingStore {
    inner: Arc<dyn KeyValueStore>,
    writes: AtomicU32,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Arc<Self> {
        Arc::new(Self { inner, writes: AtomicU32::new(0) })
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for CountingStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key)
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every regular file under `dir` (recursively) whose bytes contain `needle`.
pub fn files_containing(dir: &Path, needle: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(next) = pending.pop() {
        for entry in std::fs::read_dir(&next)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            // Temp files may vanish between listing and reading.
            match std::fs::read(&path) {
                Ok(bytes) if String::from_utf8_lossy(&bytes).contains(needle) => found.push(path),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(found)
}

/// A `nats-server` child process on a free local port, killed on drop.
pub struct NatsServer {
    child: Child,
    port: u16,
}

impl NatsServer {
    /// Start a server, or `None` when `nats-server` is not installed or
    /// never accepts connections.
    pub fn start() -> Option<Self> {
        let port = TcpListener::bind("127.0.0.1:0").ok()?.local_addr().ok()?.port();
        let child = Command::new("nats-server")
            .args(["-a", "127.0.0.1", "-p", &port.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;
        let mut server = Self { child, port };

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return Some(server);
            }
            if matches!(server.child.try_wait(), Ok(Some(_))) {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        None
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.port)
    }
}

impl Drop for NatsServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
