//! Single-node bootstrap over the full stack: mux, Raft, gossip, gRPC.

use std::time::Duration;

use taskvault::agent::Agent;
use taskvault::command::Command;
use taskvault::config::AgentConfig;
use taskvault::grpc::proto::task_vault_client::TaskVaultClient;
use taskvault::grpc::proto::{
    CreateValueRequest, DeleteValueRequest, GetAllPairsRequest, GetValueRequest,
    RaftGetConfigurationRequest, UpdateValueRequest,
};

async fn wait_for_leadership(agent: &Agent, within: Duration) {
    tokio::time::timeout(within, async {
        while !agent.raft().is_leader() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node never became leader");
}

#[tokio::test]
async fn bootstrap_expect_one_elects_leader_and_serves_kv() {
    let mut cfg = AgentConfig::for_testing("solo");
    cfg.bootstrap_expect = 1;
    let agent = Agent::start(cfg).await.unwrap();

    wait_for_leadership(&agent, Duration::from_secs(5)).await;

    let mut client = TaskVaultClient::connect(format!("http://{}", agent.rpc_addr()))
        .await
        .unwrap();

    // Exactly one voter, carrying this node's name, and it is the leader.
    let config = client
        .raft_get_configuration(RaftGetConfigurationRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.servers[0].id, "solo");
    assert!(config.servers[0].leader);

    // SetPair("x", "1") followed by GetValue("x") returns "1".
    let created = client
        .create_value(CreateValueRequest {
            key: "x".to_string(),
            value: "1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(created.ok);

    let got = client
        .get_value(GetValueRequest {
            key: "x".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(got.found);
    assert_eq!(got.value, "1");

    // Update overwrites; GetAllPairs lists; delete removes and a repeated
    // delete still succeeds.
    client
        .update_value(UpdateValueRequest {
            key: "x".to_string(),
            value: "2".to_string(),
        })
        .await
        .unwrap();
    let all = client
        .get_all_pairs(GetAllPairsRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.pairs.len(), 1);
    assert_eq!(all.pairs[0].value, "2");

    let deleted = client
        .delete_value(DeleteValueRequest {
            key: "x".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(deleted.ok);
    let deleted_again = client
        .delete_value(DeleteValueRequest {
            key: "x".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(deleted_again.ok);

    let got = client
        .get_value(GetValueRequest {
            key: "x".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!got.found);

    agent.stop().await;
}

#[tokio::test]
async fn apply_through_the_handle_reaches_the_store() {
    let mut cfg = AgentConfig::for_testing("handle-node");
    cfg.bootstrap = true;
    let agent = Agent::start(cfg).await.unwrap();

    wait_for_leadership(&agent, Duration::from_secs(5)).await;

    let frame = Command::SetPair {
        key: "direct".to_string(),
        value: "write".to_string(),
    }
    .encode();
    let applied = agent.raft().apply(frame).await.unwrap();
    assert!(applied.ok);
    assert_eq!(agent.kv().get("direct").as_deref(), Some("write"));

    agent.stop().await;
}

#[tokio::test]
async fn mutations_on_a_leaderless_node_return_failed_precondition() {
    // No bootstrap: the node stays a follower with no leader to forward to.
    let cfg = AgentConfig::for_testing("lonely-follower");
    let agent = Agent::start(cfg).await.unwrap();

    let mut client = TaskVaultClient::connect(format!("http://{}", agent.rpc_addr()))
        .await
        .unwrap();
    let err = client
        .create_value(CreateValueRequest {
            key: "k".to_string(),
            value: "v".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);

    // Reads still answer from the (empty) local map.
    let got = client
        .get_value(GetValueRequest {
            key: "k".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!got.found);

    agent.stop().await;
}
