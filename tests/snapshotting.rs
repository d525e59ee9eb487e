//! Snapshot taking, chunked installation on lagging followers, and restoring
//! from persisted chunks.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use eventraft::testing::{query_last, set};
use eventraft::{Config, QueryPolicy};
use fixtures::{commit_index, LocalRaftGroup, MessageKind};

/// A config which snapshots after every 10 commits.
fn snapshot_config() -> Config {
    Config::build()
        .leader_election_timeout_millis(150)
        .leader_heartbeat_period_millis(50)
        .leader_heartbeat_timeout_millis(600)
        .leader_backoff_duration_millis(40)
        .append_entries_request_batch_size(5)
        .max_uncommitted_log_entry_count(64)
        .commit_count_to_take_snapshot(10)
        .raft_node_report_publish_period_secs(60)
        .validate()
        .expect("snapshot config must be valid")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_compact_their_logs_after_enough_commits() -> Result<()> {
    let group = LocalRaftGroup::with_config(3, snapshot_config(), false);
    let leader = group.wait_until_leader_elected().await;

    for i in 1..=25 {
        leader.replicate(set(format!("value{i}"))).await?;
    }

    let report = leader.report().await?;
    assert!(report.log.take_snapshot_count >= 1, "the leader never compacted");
    assert!(report.log.snapshot_index >= 10);
    assert!(report.log.commit_index >= 25);

    // Compaction must not lose state.
    let read = leader.query(query_last(), QueryPolicy::LeaderLocal, 0).await?;
    assert_eq!(read.result.as_deref(), Some("value25"));

    // Followers compact on their own commit advance as well.
    let leader_commit_index = commit_index(&leader).await;
    for node in group.nodes() {
        group.wait_until_commit_index(node.id(), leader_commit_index).await;
        let report = node.report().await?;
        assert!(
            report.log.take_snapshot_count >= 1,
            "node {} never compacted",
            node.id()
        );
    }

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_catches_up_through_a_chunked_snapshot() -> Result<()> {
    let group = LocalRaftGroup::with_config(3, snapshot_config(), false);
    let leader = group.wait_until_leader_elected().await;

    // Let the whole group settle first so every match index is known.
    for i in 1..=2 {
        leader.replicate(set(format!("value{i}"))).await?;
    }
    let settled = commit_index(&leader).await;
    for node in group.nodes() {
        group.wait_until_commit_index(node.id(), settled).await;
    }

    // Starve one follower while the group commits far past the snapshot
    // threshold, so its position is compacted away on the leader.
    let lagging = group.any_follower(leader.id()).await;
    group.drop_messages(leader.id(), lagging.id(), MessageKind::AppendEntriesRequest);
    group.drop_messages(leader.id(), lagging.id(), MessageKind::InstallSnapshotRequest);
    for i in 3..=32 {
        leader.replicate(set(format!("value{i}"))).await?;
    }
    let leader_report = leader.report().await?;
    assert!(leader_report.log.snapshot_index > settled, "the leader should have compacted");

    // Once traffic flows again, the follower can only catch up by snapshot.
    group.allow_all_messages(leader.id(), lagging.id());
    group.wait_until_commit_index(lagging.id(), leader_report.log.commit_index).await;

    let lagging_report = lagging.report().await?;
    assert!(
        lagging_report.log.install_snapshot_count >= 1,
        "the follower should have installed a snapshot"
    );
    assert!(lagging_report.log.snapshot_index >= leader_report.log.snapshot_index - 10);

    let read = lagging.query(query_last(), QueryPolicy::AnyLocal, 0).await?;
    assert_eq!(read.result.as_deref(), Some("value32"));

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_restores_state_from_persisted_snapshot_chunks() -> Result<()> {
    let mut group = LocalRaftGroup::with_config(3, snapshot_config(), false);
    let leader = group.wait_until_leader_elected().await;

    for i in 1..=25 {
        leader.replicate(set(format!("value{i}"))).await?;
    }
    let leader_commit_index = commit_index(&leader).await;

    let follower = group.any_follower(leader.id()).await;
    let follower_id = follower.id();
    group.wait_until_commit_index(follower_id, leader_commit_index).await;

    // Wait for the follower to have compacted, then crash and restart it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if follower.report().await?.log.take_snapshot_count >= 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "the follower never compacted");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let restarted = group.restart_node(follower_id).await;
    let report = restarted.report().await?;
    assert!(report.log.snapshot_index >= 10, "the snapshot must survive the restart");
    assert!(
        report.log.commit_index >= report.log.snapshot_index,
        "restoring a snapshot implies its commit index"
    );

    // The restored state machine carries the snapshotted values.
    let read = restarted.query(query_last(), QueryPolicy::AnyLocal, 0).await?;
    assert!(read.result.is_some(), "restored state machine must hold the snapshot data");

    // And the node keeps participating.
    let ordered = leader.replicate(set("after-restart")).await?;
    group.wait_until_commit_index(follower_id, ordered.commit_index).await;
    let read = restarted.query(query_last(), QueryPolicy::AnyLocal, 0).await?;
    assert_eq!(read.result.as_deref(), Some("after-restart"));

    group.destroy().await;
    Ok(())
}
