//! Leader election behavior: initial elections, pre-voting, leader
//! stickiness, and failover.

mod fixtures;

use std::time::Duration;

use anyhow::Result;
use eventraft::testing::{query_last, set};
use eventraft::{QueryPolicy, RaftRole};
use fixtures::{commit_index, LocalRaftGroup, MessageKind};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_election_produces_a_single_agreed_leader() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;

    let leader_report = leader.report().await?;
    assert_eq!(leader_report.role, RaftRole::Leader);
    for node in group.nodes() {
        let report = node.report().await?;
        assert_eq!(report.leader, Some(leader.id()));
        assert_eq!(report.term, leader_report.term);
        if node.id() != leader.id() {
            assert_eq!(report.role, RaftRole::Follower);
        }
    }

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_member_group_elects_itself() -> Result<()> {
    let group = LocalRaftGroup::new(1);
    let leader = group.wait_until_leader_elected().await;

    let ordered = leader.replicate(set("solo")).await?;
    assert_eq!(ordered.result.as_deref(), Some("solo"));

    let read = leader.query(query_last(), QueryPolicy::LeaderLocal, 0).await?;
    assert_eq!(read.result.as_deref(), Some("solo"));
    assert_eq!(read.commit_index, ordered.commit_index);

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_fails_over_when_the_leader_is_cut_off() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let old_leader = group.wait_until_leader_elected().await;
    old_leader.replicate(set("value1")).await?;

    group.split([old_leader.id()]);
    let new_leader = group.wait_until_new_leader_elected(old_leader.id()).await;
    assert_ne!(new_leader.id(), old_leader.id());

    let old_term = old_leader.report().await?.term;
    let new_term = new_leader.report().await?.term;
    assert!(new_term > old_term, "a failover must move to a later term");

    // After healing, the old leader follows the new one.
    group.merge();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let report = old_leader.report().await?;
        if report.role == RaftRole::Follower && report.leader == Some(new_leader.id()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "the deposed leader never rejoined as follower"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let ordered = new_leader.replicate(set("value2")).await?;
    group.wait_until_commit_index(old_leader.id(), ordered.commit_index).await;

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_follower_does_not_disrupt_a_healthy_leader() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;
    leader.replicate(set("value1")).await?;
    let term_before = leader.report().await?.term;

    // Cut one follower off long enough for it to start election rounds.
    let follower = group.any_follower(leader.id()).await;
    group.split([follower.id()]);
    tokio::time::sleep(Duration::from_secs(2)).await;
    group.merge();

    // Pre-voting keeps the partitioned node from inflating anyone's term, so
    // the leader survives with its term intact.
    let report = leader.report().await?;
    assert_eq!(report.role, RaftRole::Leader);
    assert_eq!(report.term, term_before);

    // And the returning follower falls back in line.
    let leader_commit_index = commit_index(&leader).await;
    group.wait_until_commit_index(follower.id(), leader_commit_index).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let report = follower.report().await?;
        if report.role == RaftRole::Follower && report.leader == Some(leader.id()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "the partitioned follower never rejoined"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sticky_votes_protect_a_healthy_leader_from_a_deaf_follower() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;
    leader.replicate(set("value1")).await?;
    let term_before = leader.report().await?.term;

    // Starve one follower of heartbeats only. Its log stays as fresh as
    // everyone else's, so once its heartbeat timeout fires it starts asking
    // for (pre-)votes — which the other nodes refuse while their own leader
    // is healthy.
    let follower = group.any_follower(leader.id()).await;
    group.drop_messages(leader.id(), follower.id(), MessageKind::AppendEntriesRequest);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let report = leader.report().await?;
    assert_eq!(report.role, RaftRole::Leader);
    assert_eq!(report.term, term_before, "a deaf follower must not inflate the term");

    // Once heartbeats flow again the follower falls back in line.
    group.allow_all_messages(leader.id(), follower.id());
    let leader_commit_index = commit_index(&leader).await;
    group.wait_until_commit_index(follower.id(), leader_commit_index).await;

    group.destroy().await;
    Ok(())
}
