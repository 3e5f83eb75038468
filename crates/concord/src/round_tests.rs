// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;

use super::{Convergence, RoundOutcome, RoundPhase, RoundRunner};
use crate::error::{kind_of, ErrorKind};
use crate::lock::LockManager;
use crate::test_support::{hub_agents, AgentBuilder};
use crate::topic::Topic;

const HOLD: Duration = Duration::from_millis(200);
const WAIT: Duration = Duration::from_secs(2);

async fn work(runs: &AtomicU32, previous: Vec<String>) -> anyhow::Result<String> {
    runs.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(HOLD).await;
    Ok(format!("entry-{}", previous.len()))
}

#[tokio::test]
async fn exactly_one_agent_executes_and_all_converge() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(3).await;
    let runners: Vec<RoundRunner<String>> = agents.iter().map(|a| a.round_runner("sync")).collect();
    for runner in &runners {
        runner.spawn_listener();
    }

    let runs = AtomicU32::new(0);
    let (a, b, c) = tokio::join!(
        runners[0].trigger(|prev| work(&runs, prev)),
        runners[1].trigger(|prev| work(&runs, prev)),
        runners[2].trigger(|prev| work(&runs, prev)),
    );
    let outcomes = [a?, b?, c?];

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_leader()).count(), 1);

    for runner in &runners {
        assert_eq!(tokio::time::timeout(WAIT, runner.await_convergence()).await?, Convergence::Applied);
    }
    let expected = vec!["entry-0".to_owned()];
    for runner in &runners {
        let mut snapshots = runner.snapshots();
        tokio::time::timeout(WAIT, snapshots.wait_for(|s| *s == expected)).await??;
        assert_eq!(runner.phase(), RoundPhase::Idle);
    }
    Ok(())
}

#[tokio::test]
async fn next_round_builds_on_the_received_snapshot() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(2).await;
    let first: RoundRunner<u32> = agents[0].round_runner("sync");
    let second: RoundRunner<u32> = agents[1].round_runner("sync");
    first.spawn_listener();
    second.spawn_listener();

    let outcome = first.trigger(|prev| async move { Ok(prev.len() as u32 + 10) }).await?;
    assert_eq!(outcome, RoundOutcome::Leader(vec![10]));
    tokio::time::timeout(WAIT, second.snapshots().wait_for(|s| s.len() == 1)).await??;

    let outcome = second.trigger(|prev| async move { Ok(prev.len() as u32 + 10) }).await?;
    assert_eq!(outcome, RoundOutcome::Leader(vec![10, 11]));
    tokio::time::timeout(WAIT, first.snapshots().wait_for(|s| *s == [10, 11])).await??;
    Ok(())
}

#[tokio::test]
async fn failing_task_broadcasts_nothing() -> anyhow::Result<()> {
    let (hub, _registry, agents) = hub_agents(2).await;
    let leader: RoundRunner<String> = agents[0].round_runner("sync");
    let mut tap = hub.tap();

    let result = leader.trigger(|_| async { Err::<String, _>(anyhow::anyhow!("upstream refused")) }).await;

    let Err(err) = result else {
        anyhow::bail!("expected the round to fail");
    };
    assert_eq!(kind_of(&err), Some(ErrorKind::OperationFailure));
    assert!(format!("{err:#}").contains("upstream refused"));
    assert!(leader.snapshot().is_empty());
    assert_eq!(leader.phase(), RoundPhase::Idle);
    assert!(matches!(tap.try_recv(), Err(TryRecvError::Empty)));
    Ok(())
}

#[tokio::test]
async fn lock_is_released_after_a_failed_round() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(1).await;
    let runner: RoundRunner<String> = agents[0].round_runner("sync");

    assert!(runner.trigger(|_| async { Err::<String, _>(anyhow::anyhow!("boom")) }).await.is_err());
    let outcome = runner.trigger(|_| async { Ok("ok".to_owned()) }).await?;
    assert!(outcome.is_leader());
    Ok(())
}

#[tokio::test]
async fn deadline_reports_stale_without_retrying() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(2).await;
    let leader: RoundRunner<String> = agents[0].round_runner("sync");
    let follower: RoundRunner<String> =
        agents[1].round_runner("sync").with_deadline(Some(Duration::from_millis(50)));
    follower.spawn_listener();

    let runs = AtomicU32::new(0);
    let (led, followed) = tokio::join!(leader.trigger(|prev| work(&runs, prev)), async {
        let outcome = follower.trigger(|prev| work(&runs, prev)).await?;
        assert_eq!(follower.phase(), RoundPhase::Waiting);
        let convergence = follower.await_convergence().await;
        assert_eq!(follower.phase(), RoundPhase::Idle);
        Ok::<_, anyhow::Error>((outcome, convergence))
    });

    assert!(led?.is_leader());
    let (outcome, convergence) = followed?;
    assert_eq!(outcome, RoundOutcome::Follower);
    assert_eq!(convergence, Convergence::Stale);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The late snapshot still lands.
    tokio::time::timeout(WAIT, follower.snapshots().wait_for(|s| s.len() == 1)).await??;
    Ok(())
}

#[tokio::test]
async fn convergence_without_a_pending_round_is_immediate() -> anyhow::Result<()> {
    let agent = AgentBuilder::new().build().await;
    let runner: RoundRunner<String> = agent.round_runner("sync").with_deadline(Some(Duration::from_millis(10)));
    assert_eq!(runner.await_convergence().await, Convergence::Applied);
    Ok(())
}

#[tokio::test]
async fn phases_track_the_leader() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(1).await;
    let runner: RoundRunner<String> = agents[0].round_runner("sync");
    let phases = runner.watch_phase();

    let outcome = runner
        .trigger(|_| async move {
            assert_eq!(*phases.borrow(), RoundPhase::Executing);
            Ok("done".to_owned())
        })
        .await?;

    assert_eq!(outcome, RoundOutcome::Leader(vec!["done".to_owned()]));
    assert_eq!(runner.phase(), RoundPhase::Idle);
    Ok(())
}

#[tokio::test]
async fn custom_topic_and_initial_snapshot() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(2).await;
    let leader: RoundRunner<String> =
        agents[0].round_runner("data").with_topic(Topic::DataUpdated).with_initial(vec!["seed".into()]);
    let follower: RoundRunner<String> = agents[1].round_runner("data").with_topic(Topic::DataUpdated);
    follower.spawn_listener();
    let mut other_topic = agents[1].bus().subscribe(Topic::SyncComplete);

    leader.trigger(|prev| async move { Ok(format!("after-{}", prev.join(","))) }).await?;

    let expected = vec!["seed".to_owned(), "after-seed".to_owned()];
    tokio::time::timeout(WAIT, follower.snapshots().wait_for(|s| *s == expected)).await??;
    let nothing = tokio::time::timeout(Duration::from_millis(50), futures_util::StreamExt::next(&mut other_topic)).await;
    assert!(nothing.is_err());
    Ok(())
}

#[tokio::test]
async fn lock_backend_errors_propagate() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let agent = AgentBuilder::new().locks(LockManager::file(dir.path())?).build().await;
    let runner: RoundRunner<String> = agent.round_runner("bad/name");

    let err = match runner.trigger(|_| async { Ok("never".to_owned()) }).await {
        Ok(outcome) => anyhow::bail!("expected an error, got {outcome:?}"),
        Err(e) => e,
    };
    assert_eq!(kind_of(&err), Some(ErrorKind::InvalidName));
    assert_eq!(runner.phase(), RoundPhase::Idle);
    Ok(())
}

#[tokio::test]
async fn rounds_sharing_a_topic_keep_their_own_snapshots() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(2).await;
    let billing: RoundRunner<String> = agents[1].round_runner("billing").with_initial(vec!["b1".into(), "b2".into()]);
    let profile_follower: RoundRunner<String> = agents[1].round_runner("profile");
    let profile_leader: RoundRunner<String> = agents[0].round_runner("profile");
    billing.spawn_listener();
    profile_follower.spawn_listener();

    profile_leader.trigger(|_| async { Ok("p1".to_owned()) }).await?;

    let expected = vec!["p1".to_owned()];
    tokio::time::timeout(WAIT, profile_follower.snapshots().wait_for(|s| *s == expected)).await??;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(billing.snapshot(), ["b1", "b2"]);
    assert_eq!(billing.phase(), RoundPhase::Idle);
    Ok(())
}

#[tokio::test]
async fn broadcast_names_the_round() -> anyhow::Result<()> {
    let (_hub, _registry, agents) = hub_agents(2).await;
    let mut raw = agents[1].bus().subscribe(Topic::SyncComplete);
    let leader: RoundRunner<u32> = agents[0].round_runner("nightly");

    leader.trigger(|_| async { Ok(7) }).await?;

    let message = tokio::time::timeout(WAIT, futures_util::StreamExt::next(&mut raw))
        .await?
        .ok_or_else(|| anyhow::anyhow!("subscription closed"))?;
    assert_eq!(message, serde_json::json!({ "round": "nightly", "entries": [7] }));
    Ok(())
}
