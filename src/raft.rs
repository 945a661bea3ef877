//! Replicated log plumbing.
//!
//! Leader election, log replication, and membership changes are provided by
//! the `openraft` crate (version 0.9). Each node runs an embedded Raft
//! instance; no external consensus service is involved.
//!
//! ## Storage
//!
//! `storage.rs` implements the combined v1 `RaftStorage` trait; openraft's
//! `Adaptor` bridges it into the v2 `RaftLogStorage` + `RaftStateMachine`
//! split required by `Raft::new`.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and carried over the framed Raft stream protocol of
//! `transport.rs`, multiplexed with gRPC on the shared RPC port. Outbound
//! connections go to the address a peer advertises through gossip (the
//! `AddressDirectory`), falling back to the address in the Raft
//! configuration.
//!
//! ## Implementation note on async traits
//!
//! openraft 0.9 traits use RPITIT, not `async_trait::async_trait`.
//! Implementations must use plain `async fn` to match the signatures.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    CheckIsLeaderError, ClientWriteError, InstallSnapshotError, RPCError, RaftError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::Adaptor;
use openraft::{AnyError, BasicNode, Entry, ServerState, TokioRuntime};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::storage::{StateStore, StorageProfile};
use crate::store::{Applied, KvStore};
use crate::transport::{read_frame, write_frame, AddressDirectory, RaftListener};

/// Timeout for command application and per-RPC transport calls.
pub const RAFT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for the leadership-acquisition write barrier.
pub const BARRIER_WRITE_TIMEOUT: Duration = Duration::from_secs(120);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// Frame kinds on the Raft stream.
const RPC_APPEND_ENTRIES: u8 = 0x01;
const RPC_VOTE: u8 = 0x02;
const RPC_INSTALL_SNAPSHOT: u8 = 0x03;
const STATUS_OK: u8 = 0x00;
const STATUS_ERR: u8 = 0x01;

// ── Type configuration ────────────────────────────────────────────────────────

/// Application log entry: an opaque command frame, decoded by the state
/// machine on apply (see `command.rs` for the framing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCommand(pub Vec<u8>);

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = RawCommand,
        R            = Applied,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Current role of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        }
    }
}

/// One entry of the Raft voter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voter {
    pub id: NodeId,
    pub addr: String,
}

/// Derive a stable u64 node ID from the human-readable node name.
pub fn raft_node_id(name: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut h);
    h.finish()
}

// ── Error mapping ─────────────────────────────────────────────────────────────

fn write_error(e: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>) -> Error {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(f)) => Error::NotLeader {
            leader: f.leader_node.map(|n| n.addr),
        },
        other => Error::Raft(other.to_string()),
    }
}

fn read_error(e: RaftError<NodeId, CheckIsLeaderError<NodeId, BasicNode>>) -> Error {
    match e {
        RaftError::APIError(CheckIsLeaderError::ForwardToLeader(f)) => Error::NotLeader {
            leader: f.leader_node.map(|n| n.addr),
        },
        other => Error::Raft(other.to_string()),
    }
}

// ── Stream transport: client side ─────────────────────────────────────────────

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-peer client over the framed Raft stream. The connection is established
/// lazily and reused across RPCs; any transport error drops it so the next
/// call redials.
pub struct RaftPeerClient {
    target: NodeId,
    fallback_addr: String,
    directory: AddressDirectory,
    conn: Option<TcpStream>,
}

impl RaftPeerClient {
    /// The gossip-advertised address wins; the configured address is only
    /// the fallback.
    fn target_addr(&self) -> String {
        self.directory
            .lookup(self.target)
            .unwrap_or_else(|| self.fallback_addr.clone())
    }

    async fn call(&mut self, kind: u8, payload: &[u8]) -> std::io::Result<Vec<u8>> {
        if self.conn.is_none() {
            let addr = self.target_addr();
            self.conn = Some(RaftListener::dial(&addr, CONNECT_TIMEOUT).await?);
        }
        // Present after the branch above.
        let conn = self.conn.as_mut().expect("connection just established");

        let exchange = async {
            write_frame(conn, kind, payload).await?;
            read_frame(conn).await
        };
        let result = tokio::time::timeout(RAFT_TIMEOUT, exchange).await;

        match result {
            Ok(Ok((STATUS_OK, body))) => Ok(body),
            Ok(Ok((_, body))) => Err(std::io::Error::other(
                String::from_utf8_lossy(&body).into_owned(),
            )),
            Ok(Err(e)) => {
                self.conn = None;
                Err(e)
            }
            Err(_) => {
                self.conn = None;
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("raft rpc to {} timed out", self.target_addr()),
                ))
            }
        }
    }
}

impl RaftNetwork<TypeConfig> for RaftPeerClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        AppendEntriesResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let body = self
            .call(RPC_APPEND_ENTRIES, &payload)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&body).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> std::result::Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let body = self
            .call(RPC_VOTE, &payload)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&body).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let body = self
            .call(RPC_INSTALL_SNAPSHOT, &payload)
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&body).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates [`RaftPeerClient`]s per target peer.
pub struct StreamNetworkFactory {
    directory: AddressDirectory,
}

impl StreamNetworkFactory {
    pub fn new(directory: AddressDirectory) -> Self {
        Self { directory }
    }
}

impl RaftNetworkFactory<TypeConfig> for StreamNetworkFactory {
    type Network = RaftPeerClient;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        RaftPeerClient {
            target,
            fallback_addr: node.addr.clone(),
            directory: self.directory.clone(),
            conn: None,
        }
    }
}

// ── Stream transport: server side ─────────────────────────────────────────────

/// Accept loop for the Raft half of the mux. Each connection carries a
/// sequence of framed RPCs dispatched to the local Raft instance.
pub fn spawn_raft_server(
    mut listener: RaftListener,
    raft: RaftInstance,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => {
                    let Some(conn) = accepted else { return };
                    let raft = raft.clone();
                    tokio::spawn(async move {
                        serve_raft_connection(conn, raft).await;
                    });
                }
            }
        }
    });
}

async fn serve_raft_connection(mut conn: crate::transport::PeekedStream, raft: RaftInstance) {
    loop {
        let (kind, payload) = match read_frame(&mut conn).await {
            Ok(frame) => frame,
            // Peer hung up or sent garbage framing; either way we are done.
            Err(_) => return,
        };

        let (status, body) = dispatch_raft_rpc(&raft, kind, &payload).await;
        if write_frame(&mut conn, status, &body).await.is_err() {
            return;
        }
    }
}

async fn dispatch_raft_rpc(raft: &RaftInstance, kind: u8, payload: &[u8]) -> (u8, Vec<u8>) {
    match kind {
        RPC_APPEND_ENTRIES => {
            match serde_json::from_slice::<AppendEntriesRequest<TypeConfig>>(payload) {
                Ok(req) => match raft.append_entries(req).await {
                    Ok(resp) => ok_body(&resp),
                    Err(e) => err_body(e),
                },
                Err(e) => err_body(e),
            }
        }
        RPC_VOTE => match serde_json::from_slice::<VoteRequest<NodeId>>(payload) {
            Ok(req) => match raft.vote(req).await {
                Ok(resp) => ok_body(&resp),
                Err(e) => err_body(e),
            },
            Err(e) => err_body(e),
        },
        RPC_INSTALL_SNAPSHOT => {
            match serde_json::from_slice::<InstallSnapshotRequest<TypeConfig>>(payload) {
                Ok(req) => match raft.install_snapshot(req).await {
                    Ok(resp) => ok_body(&resp),
                    Err(e) => err_body(e),
                },
                Err(e) => err_body(e),
            }
        }
        other => (
            STATUS_ERR,
            format!("unknown raft rpc kind 0x{other:02x}").into_bytes(),
        ),
    }
}

fn ok_body<T: Serialize>(resp: &T) -> (u8, Vec<u8>) {
    match serde_json::to_vec(resp) {
        Ok(body) => (STATUS_OK, body),
        Err(e) => (STATUS_ERR, e.to_string().into_bytes()),
    }
}

fn err_body(e: impl std::fmt::Display) -> (u8, Vec<u8>) {
    (STATUS_ERR, e.to_string().into_bytes())
}

// ── RaftHandle ────────────────────────────────────────────────────────────────

/// Handle to the running Raft node: command application, barriers,
/// configuration reads and changes, leadership observation, shutdown.
/// Cheap to clone.
#[derive(Clone)]
pub struct RaftHandle {
    raft: RaftInstance,
    node_id: NodeId,
    node_name: String,
    advertise: String,
    directory: AddressDirectory,
    leader_rx: watch::Receiver<bool>,
    db: Option<sled::Db>,
}

impl RaftHandle {
    /// Build storage, construct the Raft instance, start the stream server,
    /// and bootstrap a single-server configuration when appropriate.
    /// Construction failures are startup-fatal.
    pub async fn start(
        cfg: &AgentConfig,
        listener: RaftListener,
        directory: AddressDirectory,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(RaftHandle, KvStore)> {
        let node_id = raft_node_id(&cfg.node_name);
        let advertise = cfg.rpc_advertise();

        let multiplier = cfg.raft_multiplier;
        let raft_config = Arc::new(
            openraft::Config {
                cluster_name: cfg.cluster.clone(),
                heartbeat_interval: 500 * multiplier,
                election_timeout_min: 1_500 * multiplier,
                election_timeout_max: 3_000 * multiplier,
                ..Default::default()
            }
            .validate()
            .map_err(|e| Error::Raft(format!("invalid raft config: {e}")))?,
        );

        let profile = if cfg.dev {
            StorageProfile::Dev
        } else {
            let dir = cfg
                .data_dir
                .as_ref()
                .ok_or_else(|| Error::Config("data dir missing".to_string()))?
                .join("raft");
            StorageProfile::Durable { dir }
        };
        let (mut store, kv, db) = StateStore::open(profile)?;
        let pristine = store.is_pristine();
        let (log_store, state_machine) = Adaptor::new(store);

        let raft = openraft::Raft::new(
            node_id,
            raft_config,
            StreamNetworkFactory::new(directory.clone()),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| Error::Raft(format!("failed to construct raft: {e}")))?;

        spawn_raft_server(listener, raft.clone(), shutdown);

        // Single-server bootstrap: only on a node with no prior state.
        if cfg.bootstraps_alone() {
            if pristine {
                let mut members = BTreeMap::new();
                members.insert(
                    node_id,
                    BasicNode {
                        addr: advertise.clone(),
                    },
                );
                match raft.initialize(members).await {
                    Ok(()) => info!(node_id, "Bootstrapped single-server configuration"),
                    Err(e) => info!(error = %e, "Raft already initialized; skipping bootstrap"),
                }
            } else {
                debug!("Durable state present; skipping bootstrap");
            }
        }

        let leader_rx = spawn_state_watcher(&raft, node_id, cfg.node_name.clone());

        let handle = RaftHandle {
            raft,
            node_id,
            node_name: cfg.node_name.clone(),
            advertise,
            directory,
            leader_rx,
            db,
        };
        info!(
            node_id,
            node = %handle.node_name,
            "Raft node started"
        );
        Ok((handle, kv))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Submit a command frame to the replicated log and wait for it to be
    /// committed and applied locally.
    pub async fn apply(&self, frame: Vec<u8>) -> Result<Applied> {
        let write = self.raft.client_write(RawCommand(frame));
        match tokio::time::timeout(RAFT_TIMEOUT, write).await {
            Err(_) => Err(Error::Timeout(RAFT_TIMEOUT)),
            Ok(Err(e)) => Err(write_error(e)),
            Ok(Ok(resp)) => Ok(resp.data),
        }
    }

    /// Write barrier: returns once the local node has applied everything
    /// committed before the call. Used by a fresh leader before it starts
    /// issuing configuration changes.
    pub async fn barrier(&self) -> Result<()> {
        let linearize = self.raft.ensure_linearizable();
        match tokio::time::timeout(BARRIER_WRITE_TIMEOUT, linearize).await {
            Err(_) => Err(Error::Timeout(BARRIER_WRITE_TIMEOUT)),
            Ok(Err(e)) => Err(read_error(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Point-in-time view of the voter configuration.
    pub fn configuration(&self) -> Vec<Voter> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config;
        membership
            .membership()
            .voter_ids()
            .map(|id| Voter {
                id,
                addr: membership
                    .membership()
                    .get_node(&id)
                    .map(|n| n.addr.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Add (or repair) a voter: join as learner first so the log catches up,
    /// then promote.
    pub async fn add_voter(&self, id: NodeId, addr: String) -> Result<()> {
        let node = BasicNode { addr };
        let add = self.raft.add_learner(id, node, true);
        match tokio::time::timeout(RAFT_TIMEOUT, add).await {
            Err(_) => return Err(Error::Timeout(RAFT_TIMEOUT)),
            Ok(Err(e)) => return Err(write_error(e)),
            Ok(Ok(_)) => {}
        }

        let mut ids = BTreeSet::new();
        ids.insert(id);
        let promote = self
            .raft
            .change_membership(openraft::ChangeMembers::AddVoterIds(ids), false);
        match tokio::time::timeout(RAFT_TIMEOUT, promote).await {
            Err(_) => Err(Error::Timeout(RAFT_TIMEOUT)),
            Ok(Err(e)) => Err(write_error(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Remove a server from the voter configuration.
    pub async fn remove_server(&self, id: NodeId) -> Result<()> {
        let mut ids = BTreeSet::new();
        ids.insert(id);
        let remove = self
            .raft
            .change_membership(openraft::ChangeMembers::RemoveVoters(ids), false);
        match tokio::time::timeout(RAFT_TIMEOUT, remove).await {
            Err(_) => Err(Error::Timeout(RAFT_TIMEOUT)),
            Ok(Err(e)) => Err(write_error(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Form the initial cluster from the expected member set. Safe to call on
    /// an already-initialized cluster (logged and ignored).
    pub async fn initialize(&self, members: BTreeMap<NodeId, BasicNode>) -> Result<()> {
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!("Initialized cluster configuration");
                Ok(())
            }
            Err(e) => {
                info!(error = %e, "Raft already initialized (ignoring)");
                Ok(())
            }
        }
    }

    /// Stream of leadership transitions: `true` on acquire, `false` on loss.
    pub fn leader_changes(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn state(&self) -> NodeRole {
        match self.raft.metrics().borrow().state {
            ServerState::Leader => NodeRole::Leader,
            ServerState::Candidate => NodeRole::Candidate,
            _ => NodeRole::Follower,
        }
    }

    /// Advertised address of the current leader, if one is known.
    pub fn leader(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let id = metrics.current_leader?;
        if id == self.node_id {
            return Some(self.advertise.clone());
        }
        self.directory.lookup(id).or_else(|| {
            metrics
                .membership_config
                .membership()
                .get_node(&id)
                .map(|n| n.addr.clone())
        })
    }

    /// Shut down Raft and flush the backing store.
    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!(error = %e, "Raft shutdown error");
        }
        if let Some(db) = &self.db {
            if let Err(e) = db.flush() {
                warn!(error = %e, "Failed to flush durable store");
            }
        }
    }
}

fn spawn_state_watcher(
    raft: &RaftInstance,
    node_id: NodeId,
    node_name: String,
) -> watch::Receiver<bool> {
    let (leader_tx, leader_rx) = watch::channel(false);
    let mut metrics = raft.metrics();
    tokio::spawn(async move {
        loop {
            if metrics.changed().await.is_err() {
                return;
            }
            let m = metrics.borrow().clone();
            let is_leader = m.state == ServerState::Leader;
            let was_leader = *leader_tx.borrow();
            // Only forward actual transitions; metrics change far more often.
            if was_leader != is_leader {
                let _ = leader_tx.send(is_leader);
                info!(
                    node_id,
                    node = %node_name,
                    state = if is_leader { "leader" } else { "follower" },
                    term = m.current_term,
                    leader = ?m.current_leader,
                    "Raft leadership changed"
                );
            }
        }
    });
    leader_rx
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic() {
        assert_eq!(raft_node_id("vault-a"), raft_node_id("vault-a"));
    }

    #[test]
    fn different_node_ids_differ() {
        assert_ne!(raft_node_id("vault-a"), raft_node_id("vault-b"));
    }

    #[test]
    fn raw_command_serializes_roundtrip() {
        let cmd = RawCommand(vec![1, 2, 3, 4]);
        let json = serde_json::to_string(&cmd).unwrap();
        let back: RawCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0, vec![1, 2, 3, 4]);
    }
}
