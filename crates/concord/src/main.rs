// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use concord::agent::{Agent, AgentOptions};
use concord::config::{AgentConfig, Command, Config, WatchArgs};
use concord::lock::LockManager;
use concord::round::{Convergence, RoundOutcome, RoundRunner};
use concord::session::{Navigator, SessionSync};
use concord::store::FileStore;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr; stdout carries the JSON event lines.
    match config.log_format.as_str() {
        "json" => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init();
        }
        _ => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
}

/// Prints each navigation as a JSON line on stdout.
struct StdoutNavigator;

impl Navigator for StdoutNavigator {
    fn navigate(&self, path: &str) {
        emit(serde_json::json!({ "event": "navigate", "path": path }));
    }
}

fn emit(line: serde_json::Value) {
    println!("{line}");
}

async fn run(config: Config) -> anyhow::Result<()> {
    let agent_config = config.agent;
    let store = Arc::new(
        FileStore::open(&agent_config.store_dir)?
            .with_poll_interval(agent_config.poll_interval())
            .with_retention(agent_config.journal_retention()),
    );
    let locks = LockManager::file(agent_config.lock_dir())?;
    let transport = agent_config.transport_options(store.clone())?;

    let agent = Agent::start(AgentOptions::new(transport, locks)).await;
    let session =
        agent.session(store, Arc::new(StdoutNavigator)).with_key(agent_config.session_key.clone());

    let result = match config.command {
        Command::Login { token } => session.login(&token),
        Command::Logout { reason } => session.logout(&reason),
        Command::Watch(args) => watch(&agent, &session, &agent_config, args).await,
    };

    agent.shutdown().await;
    result
}

async fn watch(agent: &Agent, session: &SessionSync, config: &AgentConfig, args: WatchArgs) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    info!(agent = %agent.id(), transport = %agent.transport_kind(), "watching");
    let current = session.current()?;
    emit(serde_json::json!({ "event": "session", "authenticated": current.is_authenticated() }));
    session.spawn_listener();

    let runner: RoundRunner<String> = agent.round_runner(args.round_name.clone()).with_deadline(config.round_deadline());
    runner.spawn_listener();
    spawn_snapshot_printer(&runner, shutdown.clone());

    let Some(every) = args.round_every() else {
        shutdown.cancelled().await;
        return Ok(());
    };

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match runner.trigger(|_| run_task(&args.command)).await {
            Ok(RoundOutcome::Leader(snapshot)) => {
                info!(round = %runner.name(), entries = snapshot.len(), "led round");
            }
            Ok(RoundOutcome::Follower) => {
                let convergence = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    c = runner.await_convergence() => c,
                };
                if convergence == Convergence::Stale {
                    emit(serde_json::json!({ "event": "stale", "round": runner.name() }));
                }
            }
            // A failed round is reported and the next tick tries again.
            Err(e) => warn!(round = %runner.name(), "round failed: {e:#}"),
        }
    }
    Ok(())
}

fn spawn_snapshot_printer(runner: &RoundRunner<String>, shutdown: CancellationToken) {
    let mut snapshots = runner.snapshots();
    let round = runner.name().to_owned();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let entries = snapshots.borrow_and_update().clone();
                    emit(serde_json::json!({ "event": "snapshot", "round": round, "entries": entries }));
                }
            }
        }
    });
}

/// Run the leader's task command; its trimmed stdout is the new entry.
async fn run_task(command: &[String]) -> anyhow::Result<String> {
    let (program, args) = command.split_first().ok_or_else(|| anyhow::anyhow!("no round command"))?;
    let output = tokio::process::Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{program} exited with {}: {}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
                shutdown.cancel();
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
                shutdown.cancel();
            }
        }
    });
}
