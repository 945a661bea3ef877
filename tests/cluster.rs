//! Two-node cluster formation: gossip join, voter reconciliation, and log
//! replication over the multiplexed transport.

use std::time::Duration;

use taskvault::agent::Agent;
use taskvault::command::Command;
use taskvault::config::AgentConfig;

async fn eventually<F>(within: Duration, what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(within, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn follower_joins_becomes_voter_and_replicates() {
    // Leader bootstraps alone; threshold 1 so reconciliation is unrestricted
    // in this two-node bring-up.
    let mut leader_cfg = AgentConfig::for_testing("node-a");
    leader_cfg.bootstrap_expect = 1;
    leader_cfg.self_join_threshold = 1;
    let leader = Agent::start(leader_cfg).await.unwrap();

    eventually(Duration::from_secs(5), "leader election", || {
        leader.raft().is_leader()
    })
    .await;

    // Follower joins through gossip; the reconciler must add it as a voter.
    let mut follower_cfg = AgentConfig::for_testing("node-b");
    follower_cfg.self_join_threshold = 1;
    follower_cfg.start_join = vec![leader.membership().bound_addr().to_string()];
    let follower = Agent::start(follower_cfg).await.unwrap();

    eventually(Duration::from_secs(20), "two-voter configuration", || {
        leader.raft().configuration().len() == 2
    })
    .await;

    // Both nodes agree on the configuration.
    eventually(
        Duration::from_secs(10),
        "configuration replication to the follower",
        || follower.raft().configuration().len() == 2,
    )
    .await;

    // A write on the leader becomes visible on the follower.
    let frame = Command::SetPair {
        key: "replicated".to_string(),
        value: "yes".to_string(),
    }
    .encode();
    let applied = leader.raft().apply(frame).await.unwrap();
    assert!(applied.ok);

    eventually(
        Duration::from_secs(10),
        "write replication to the follower",
        || follower.kv().get("replicated").as_deref() == Some("yes"),
    )
    .await;

    follower.stop().await;
    leader.stop().await;
}
