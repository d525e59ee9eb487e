//! Single-server membership changes and leadership transfer.

mod fixtures;

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use eventraft::testing::set;
use eventraft::{MembershipChangeMode, RaftError, RaftRole};
use fixtures::{commit_index, LocalRaftGroup};
use maplit::btreeset;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_change_requires_a_committed_entry_of_the_current_term() -> Result<()> {
    // No new-term operation here: nothing of the leader's term is committed
    // until the application replicates something.
    let mut group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;

    let err = leader
        .change_membership(4, MembershipChangeMode::AddMember, 0)
        .await
        .expect_err("no entry of the current term is committed yet");
    assert!(matches!(err, RaftError::CannotReplicate { .. }), "got {err:?}");

    // Committing any entry of the current term unblocks the change.
    leader.replicate(set("value1")).await?;
    let ordered = leader.change_membership(4, MembershipChangeMode::AddMember, 0).await?;
    assert_eq!(ordered.result.members, btreeset! {1, 2, 3, 4});
    assert_eq!(
        ordered.result.log_index, ordered.commit_index,
        "the committed member list records the change's log index"
    );

    let report = leader.report().await?;
    assert_eq!(report.committed_members.members, btreeset! {1, 2, 3, 4});
    assert_eq!(report.effective_members.members, btreeset! {1, 2, 3, 4});

    // A stale expectation is refused.
    let err = leader
        .change_membership(5, MembershipChangeMode::AddMember, 0)
        .await
        .expect_err("the expectation is stale after the first change");
    assert!(
        matches!(err, RaftError::MismatchingGroupMembersCommitIndex { .. }),
        "got {err:?}"
    );

    // The new node joins and catches up.
    group.start_node(4, btreeset! {1, 2, 3, 4});
    let ordered = leader.replicate(set("value2")).await?;
    group.wait_until_commit_index(4, ordered.commit_index).await;

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_term_operation_unblocks_membership_changes() -> Result<()> {
    let mut group = LocalRaftGroup::with_new_term_operation(3);
    let leader = group.wait_until_leader_elected().await;

    // The no-op appended on election win commits an entry of the current
    // term; the change goes through as soon as that happens.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let ordered = loop {
        match leader.change_membership(4, MembershipChangeMode::AddMember, 0).await {
            Ok(ordered) => break ordered,
            Err(RaftError::CannotReplicate { .. }) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "the new-term entry never committed"
                );
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    };
    assert_eq!(ordered.result.members, btreeset! {1, 2, 3, 4});

    group.start_node(4, btreeset! {1, 2, 3, 4});
    let ordered = leader.replicate(set("value1")).await?;
    group.wait_until_commit_index(4, ordered.commit_index).await;

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removing_a_follower_shrinks_the_quorum() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;
    leader.replicate(set("value1")).await?;

    let removed = group.any_follower(leader.id()).await;
    let ordered = leader
        .change_membership(removed.id(), MembershipChangeMode::RemoveMember, 0)
        .await?;
    let mut expected: BTreeSet<u64> = btreeset! {1, 2, 3};
    expected.remove(&removed.id());
    assert_eq!(ordered.result.members, expected);

    // The two remaining members still form a quorum.
    let ordered = leader.replicate(set("value2")).await?;
    for id in &expected {
        if *id != leader.id() {
            group.wait_until_commit_index(*id, ordered.commit_index).await;
        }
    }

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adding_an_existing_member_is_refused() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;
    leader.replicate(set("value1")).await?;

    let err = leader
        .change_membership(leader.id(), MembershipChangeMode::AddMember, 0)
        .await
        .expect_err("the endpoint is already a member");
    assert!(matches!(err, RaftError::Internal(_)), "got {err:?}");

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer_moves_the_leader_to_the_target() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let old_leader = group.wait_until_leader_elected().await;
    old_leader.replicate(set("value1")).await?;

    let target = group.any_follower(old_leader.id()).await;
    let leader_commit_index = commit_index(&old_leader).await;
    group.wait_until_commit_index(target.id(), leader_commit_index).await;

    old_leader.transfer_leadership(target.id()).await?;

    // The transfer future resolving means the old leader saw the new term;
    // the target should now establish itself.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let report = target.report().await?;
        if report.role == RaftRole::Leader {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "the target never became leader");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let ordered = target.replicate(set("value2")).await?;
    assert_eq!(ordered.result.as_deref(), Some("value2"));

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer_to_self_completes_immediately() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;

    let ordered = leader.transfer_leadership(leader.id()).await?;
    assert_eq!(ordered.commit_index, commit_index(&leader).await);
    assert_eq!(leader.report().await?.role, RaftRole::Leader);

    group.destroy().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leadership_transfer_from_a_follower_fails() -> Result<()> {
    let group = LocalRaftGroup::new(3);
    let leader = group.wait_until_leader_elected().await;
    let follower = group.any_follower(leader.id()).await;

    let err = follower
        .transfer_leadership(leader.id())
        .await
        .expect_err("only the leader can transfer leadership");
    assert!(matches!(err, RaftError::NotLeader { .. }), "got {err:?}");

    group.destroy().await;
    Ok(())
}
