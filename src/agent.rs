//! Agent composition.
//!
//! Wires the subsystems together: the multiplexed RPC listener, the Raft
//! node, gossip membership, the member-event dispatcher, the leadership
//! monitor, the gRPC service, and the health endpoint. Each runs as its own
//! task; they communicate over channels and shut down through one shared
//! watch signal.
//!
//! Shutdown ordering in [`Agent::stop`]: Raft shutdown, then the backing
//! store flush, then gossip leave, then gossip shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use openraft::BasicNode;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::grpc::{spawn_grpc_server, TaskVaultService};
use crate::http::{start_health_server, HealthState};
use crate::membership::{
    Member, MemberEvent, Membership, MembershipConfig, TAG_BOOTSTRAP, TAG_EXPECT, TAG_ID,
    TAG_PORT, TAG_ROLE, TAG_RPC_ADDR,
};
use crate::raft::{raft_node_id, NodeId, RaftHandle};
use crate::reconcile::LeadershipMonitor;
use crate::store::KvStore;
use crate::transport::{spawn_mux, AddressDirectory};

const MEMBER_SIGNAL_DEPTH: usize = 256;

/// One running server node.
pub struct Agent {
    cfg: AgentConfig,
    membership: Membership,
    raft: RaftHandle,
    kv: KvStore,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    /// Start every subsystem. Any error here is startup-fatal and should
    /// exit the process non-zero.
    pub async fn start(cfg: AgentConfig) -> Result<Agent> {
        cfg.validate()?;
        let mut cfg = cfg;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Shared RPC listener; a bind failure aborts startup.
        let listener = TcpListener::bind(cfg.rpc_bind())
            .await
            .map_err(|e| Error::Config(format!("bind {}: {e}", cfg.rpc_bind())))?;
        let bound = listener.local_addr()?;
        if cfg.rpc_port == 0 {
            cfg.rpc_port = bound.port();
        }
        let (grpc_incoming, raft_listener) = spawn_mux(listener, shutdown_rx.clone());

        // Raft node over the stream half of the mux.
        let directory = AddressDirectory::new();
        let (raft, kv) =
            RaftHandle::start(&cfg, raft_listener, directory.clone(), shutdown_rx.clone())
                .await?;
        directory.insert(raft.node_id(), cfg.rpc_advertise());

        // Gossip membership, advertising the server tags peers reconcile on.
        let membership = Membership::start(MembershipConfig {
            cluster: cfg.cluster.clone(),
            node_name: cfg.node_name.clone(),
            bind: cfg.gossip_bind(),
            advertise: cfg.gossip_advertise(),
            profile: cfg.profile,
            key: cfg.encryption_key()?,
            reconnect_timeout: cfg.reconnect_timeout,
            tags: server_tags(&cfg),
        })
        .await?;

        // Event dispatcher: updates the address directory and feeds the
        // reconciler; also drives expect-N auto-bootstrap.
        let (member_tx, member_rx) = mpsc::channel(MEMBER_SIGNAL_DEPTH);
        spawn_event_dispatcher(
            membership.clone(),
            membership.events(),
            directory.clone(),
            member_tx,
            raft.clone(),
            cfg.clone(),
            shutdown_rx.clone(),
        );

        // Leadership monitor owns the reconciler lifecycle.
        let monitor = LeadershipMonitor::new(
            Arc::new(raft.clone()),
            membership.clone(),
            raft.leader_changes(),
            member_rx,
            shutdown_rx.clone(),
            cfg.cluster.clone(),
            cfg.refresh_interval,
            cfg.self_join_threshold,
        );
        tokio::spawn(monitor.run());

        // Client-facing gRPC over the HTTP/2 half of the mux.
        spawn_grpc_server(
            TaskVaultService::new(raft.clone(), kv.clone(), membership.clone()),
            grpc_incoming,
            shutdown_rx.clone(),
        );

        // Admin health endpoint.
        let http_addr = cfg
            .http_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid http addr '{}': {e}", cfg.http_addr)))?;
        let health = HealthState {
            node_name: cfg.node_name.clone(),
            cluster: cfg.cluster.clone(),
            raft: raft.clone(),
            membership: membership.clone(),
        };
        tokio::spawn(start_health_server(http_addr, health));

        // Initial join plus the independent retry-join loop.
        if !cfg.start_join.is_empty() {
            let contacted = membership.join(&cfg.start_join).await;
            info!(contacted, seeds = cfg.start_join.len(), "Initial join attempted");
        }
        if !cfg.retry_join.is_empty() {
            spawn_retry_join(membership.clone(), cfg.clone(), shutdown_rx.clone());
        }

        info!(
            node = %cfg.node_name,
            rpc = %cfg.rpc_advertise(),
            gossip = %membership.bound_addr(),
            "Agent started"
        );

        Ok(Agent {
            cfg,
            membership,
            raft,
            kv,
            shutdown: shutdown_tx,
        })
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// The address clients should dial for gRPC.
    pub fn rpc_addr(&self) -> String {
        self.cfg.rpc_advertise()
    }

    /// Graceful shutdown: Raft first, then the store, then gossip.
    pub async fn stop(self) {
        info!(node = %self.cfg.node_name, "Agent stopping");
        let _ = self.shutdown.send(true);
        self.raft.shutdown().await;
        self.membership.leave().await;
        self.membership.shutdown();
        info!(node = %self.cfg.node_name, "Agent stopped");
    }
}

/// The reserved gossip tags advertising this node as a cluster server.
fn server_tags(cfg: &AgentConfig) -> HashMap<String, String> {
    let mut tags = cfg.tags.clone();
    tags.insert(TAG_ROLE.to_string(), cfg.cluster.clone());
    tags.insert(TAG_ID.to_string(), cfg.node_name.clone());
    tags.insert(
        TAG_PORT.to_string(),
        cfg.advertise_rpc_port.unwrap_or(cfg.rpc_port).to_string(),
    );
    tags.insert(TAG_RPC_ADDR.to_string(), cfg.rpc_advertise());
    if cfg.bootstrap {
        tags.insert(TAG_BOOTSTRAP.to_string(), "1".to_string());
    }
    if cfg.bootstrap_expect > 0 {
        tags.insert(TAG_EXPECT.to_string(), cfg.bootstrap_expect.to_string());
    }
    tags
}

/// Classify member events: refresh the address directory before signaling
/// the reconciler, and form the initial cluster once the expected number of
/// servers is visible.
fn spawn_event_dispatcher(
    membership: Membership,
    mut events: broadcast::Receiver<MemberEvent>,
    directory: AddressDirectory,
    member_tx: mpsc::Sender<Member>,
    raft: RaftHandle,
    cfg: AgentConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut bootstrapped = cfg.bootstraps_alone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                event = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Member event stream lagged; relying on periodic sweep");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    };

                    match &event {
                        MemberEvent::Join(m) | MemberEvent::Update(m) => {
                            // The directory must know the peer's advertised
                            // address before any reconciliation is signaled.
                            if let Some(identity) = m.server_identity(&cfg.cluster) {
                                directory.insert(
                                    raft_node_id(&identity.name),
                                    identity.rpc_addr.clone(),
                                );
                            }
                            if !bootstrapped {
                                bootstrapped =
                                    try_expect_bootstrap(&membership, &raft, &cfg).await;
                            }
                        }
                        MemberEvent::Reap(m) => {
                            if let Some(identity) = m.server_identity(&cfg.cluster) {
                                directory.remove(raft_node_id(&identity.name));
                            }
                        }
                        MemberEvent::Leave(_) | MemberEvent::Failed(_) => {}
                    }

                    if member_tx.send(event.member().clone()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// With `--bootstrap-expect=N` (N > 1), form the initial configuration once
/// N live servers are visible. The server with the lowest Raft ID issues the
/// initialization; everyone else waits for replication.
async fn try_expect_bootstrap(membership: &Membership, raft: &RaftHandle, cfg: &AgentConfig) -> bool {
    if cfg.bootstrap_expect <= 1 {
        return true;
    }

    let mut servers: std::collections::BTreeMap<NodeId, BasicNode> = membership
        .members()
        .into_iter()
        .filter(|m| m.status == crate::membership::MemberStatus::Alive)
        .filter_map(|m| m.server_identity(&cfg.cluster))
        .map(|identity| {
            (
                raft_node_id(&identity.name),
                BasicNode {
                    addr: identity.rpc_addr,
                },
            )
        })
        .collect();
    servers.insert(
        raft.node_id(),
        BasicNode {
            addr: cfg.rpc_advertise(),
        },
    );

    if servers.len() < cfg.bootstrap_expect {
        debug!(
            visible = servers.len(),
            expect = cfg.bootstrap_expect,
            "Waiting for expected servers before bootstrap"
        );
        return false;
    }

    let min_id = servers.keys().next().copied();
    if min_id == Some(raft.node_id()) {
        info!(
            servers = servers.len(),
            "Expected server count reached; initializing cluster"
        );
        if let Err(e) = raft.initialize(servers).await {
            warn!(error = %e, "Cluster initialization failed");
            return false;
        }
    }
    true
}

/// Retry joining the configured seeds until another server is visible or
/// shutdown. Join failures are warnings, never fatal.
fn spawn_retry_join(
    membership: Membership,
    cfg: AgentConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            let knows_peers = membership
                .members()
                .iter()
                .any(|m| m.name != cfg.node_name && m.is_server(&cfg.cluster));
            if knows_peers {
                debug!("Retry-join finished; peers are known");
                return;
            }

            let contacted = membership.join(&cfg.retry_join).await;
            if contacted == 0 {
                warn!(
                    seeds = cfg.retry_join.len(),
                    "Retry-join could not contact any seed"
                );
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(cfg.retry_interval) => {}
            }
        }
    });
}
