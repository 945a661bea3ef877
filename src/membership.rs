//! Gossip membership and failure detection.
//!
//! Peers discover each other and detect liveness through a small anti-entropy
//! gossip protocol over UDP. Every node periodically pushes its full member
//! table (name, address, incarnation, heartbeat, status, tags) to a few
//! random peers; receivers merge, keeping whichever record carries the higher
//! `(incarnation, heartbeat)`. A member whose heartbeat stops advancing is
//! marked failed; failed and departed members are reaped after the configured
//! reconnect timeout.
//!
//! Tags carry everything the rest of the agent needs to know about a peer:
//! its role, Raft server ID, Raft port, and advertised RPC address. Tag
//! changes bump the local incarnation so they win merges everywhere.
//!
//! When an encryption key is configured, every datagram is sealed with
//! XChaCha20-Poly1305 under the shared key; datagrams that fail to open are
//! dropped. Nodes without the key (or with a different one) simply never
//! exchange state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::Profile;
use crate::error::{Error, Result};

// Reserved tag names.
pub const TAG_ROLE: &str = "role";
pub const TAG_ID: &str = "id";
pub const TAG_PORT: &str = "port";
pub const TAG_RPC_ADDR: &str = "rpc_addr";
pub const TAG_BOOTSTRAP: &str = "bootstrap";
pub const TAG_EXPECT: &str = "expect";

/// Peers contacted per gossip round.
const GOSSIP_FANOUT: usize = 3;
/// XChaCha20 nonce length prepended to every sealed datagram.
const NONCE_LEN: usize = 24;
const MAX_DATAGRAM: usize = 60 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 512;

// ── Member model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
        }
    }
}

/// One known peer, as seen by the local gossip table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub status: MemberStatus,
    pub tags: HashMap<String, String>,
}

impl Member {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// Whether this member advertises itself as a server of `cluster`.
    pub fn is_server(&self, cluster: &str) -> bool {
        self.tag(TAG_ROLE) == Some(cluster)
    }

    /// Whether this member was launched in single-node bootstrap mode.
    pub fn is_bootstrap(&self) -> bool {
        self.tag(TAG_BOOTSTRAP) == Some("1")
    }

    /// Parse the server-identifying tags. Returns `None` when the member is
    /// not a server of this cluster or its tags are incomplete/invalid, in
    /// which case the reconciler ignores it.
    pub fn server_identity(&self, cluster: &str) -> Option<ServerIdentity> {
        if !self.is_server(cluster) {
            return None;
        }
        let name = self.tag(TAG_ID)?.to_string();
        if name.is_empty() {
            return None;
        }
        let port: u16 = self.tag(TAG_PORT)?.parse().ok()?;
        // Prefer the advertised RPC address; fall back to the gossip host
        // plus the Raft port tag.
        let rpc_addr = match self.tag(TAG_RPC_ADDR) {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => format!("{}:{}", self.addr.ip(), port),
        };
        Some(ServerIdentity {
            name,
            rpc_addr,
            bootstrap: self.is_bootstrap(),
            expect: self
                .tag(TAG_EXPECT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// The server-shaped view of a member's tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    /// Raft server ID (the peer's node name).
    pub name: String,
    /// Address peers dial for Raft and gRPC traffic.
    pub rpc_addr: String,
    pub bootstrap: bool,
    pub expect: usize,
}

/// Member-change events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    Join(Member),
    Update(Member),
    Leave(Member),
    Failed(Member),
    Reap(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Join(m)
            | MemberEvent::Update(m)
            | MemberEvent::Leave(m)
            | MemberEvent::Failed(m)
            | MemberEvent::Reap(m) => m,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MemberEvent::Join(_) => "join",
            MemberEvent::Update(_) => "update",
            MemberEvent::Leave(_) => "leave",
            MemberEvent::Failed(_) => "failed",
            MemberEvent::Reap(_) => "reap",
        }
    }
}

// ── Wire format ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMember {
    name: String,
    addr: SocketAddr,
    incarnation: u64,
    heartbeat: u64,
    status: MemberStatus,
    tags: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Packet {
    /// First contact with a seed; the receiver replies with its own table.
    Join(Vec<WireMember>),
    /// Periodic anti-entropy push.
    Sync(Vec<WireMember>),
    /// Graceful departure announcement.
    Leave { name: String, incarnation: u64 },
}

struct MemberState {
    member: Member,
    incarnation: u64,
    heartbeat: u64,
    last_seen: Instant,
}

impl MemberState {
    fn to_wire(&self) -> WireMember {
        WireMember {
            name: self.member.name.clone(),
            addr: self.member.addr,
            incarnation: self.incarnation,
            heartbeat: self.heartbeat,
            status: self.member.status,
            tags: self.member.tags.clone(),
        }
    }
}

// ── Datagram sealing ──────────────────────────────────────────────────────────

struct Seal {
    cipher: XChaCha20Poly1305,
}

impl Seal {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mut out = nonce.to_vec();
        match self.cipher.encrypt(XNonce::from_slice(&nonce), plaintext) {
            Ok(ciphertext) => {
                out.extend_from_slice(&ciphertext);
                out
            }
            // AEAD encryption over an in-memory buffer cannot fail.
            Err(_) => Vec::new(),
        }
    }

    fn open(&self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .ok()
    }
}

// ── Membership service ────────────────────────────────────────────────────────

/// Configuration for the gossip layer, derived from the agent config.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub cluster: String,
    pub node_name: String,
    pub bind: SocketAddr,
    pub advertise: SocketAddr,
    pub profile: Profile,
    pub key: Option<[u8; 32]>,
    pub reconnect_timeout: Duration,
    pub tags: HashMap<String, String>,
}

struct Table {
    members: HashMap<String, MemberState>,
    /// Local incarnation; bumped on tag changes and to refute stale reports
    /// about ourselves.
    incarnation: u64,
    heartbeat: u64,
}

struct Inner {
    cfg: MembershipConfig,
    socket: UdpSocket,
    table: Mutex<Table>,
    events: broadcast::Sender<MemberEvent>,
    shutdown: watch::Sender<bool>,
}

/// Shared handle to the gossip layer. Cheap to clone.
#[derive(Clone)]
pub struct Membership {
    inner: Arc<Inner>,
}

impl Membership {
    /// Bind the gossip socket and start the receive and tick pumps.
    /// A bind failure is startup-fatal.
    pub async fn start(mut cfg: MembershipConfig) -> Result<Membership> {
        let socket = UdpSocket::bind(cfg.bind)
            .await
            .map_err(|e| Error::Membership(format!("gossip bind {}: {e}", cfg.bind)))?;
        let local = socket.local_addr()?;
        // Ephemeral bind: advertise the actual port.
        if cfg.advertise.port() == 0 {
            cfg.advertise.set_port(local.port());
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let self_state = MemberState {
            member: Member {
                name: cfg.node_name.clone(),
                addr: cfg.advertise,
                status: MemberStatus::Alive,
                tags: cfg.tags.clone(),
            },
            incarnation: 0,
            heartbeat: 0,
            last_seen: Instant::now(),
        };
        let mut members = HashMap::new();
        members.insert(cfg.node_name.clone(), self_state);

        let inner = Arc::new(Inner {
            cfg,
            socket,
            table: Mutex::new(Table {
                members,
                incarnation: 0,
                heartbeat: 0,
            }),
            events,
            shutdown,
        });

        let membership = Membership { inner };
        membership.spawn_recv_pump();
        membership.spawn_tick_pump();

        info!(
            addr = %local,
            cluster = %membership.inner.cfg.cluster,
            encrypted = membership.inner.cfg.key.is_some(),
            "Gossip membership started"
        );
        Ok(membership)
    }

    /// The actual gossip socket address (useful with ephemeral binds).
    pub fn bound_addr(&self) -> SocketAddr {
        self.inner.socket.local_addr().unwrap_or(self.inner.cfg.bind)
    }

    pub fn events(&self) -> broadcast::Receiver<MemberEvent> {
        self.inner.events.subscribe()
    }

    pub fn members(&self) -> Vec<Member> {
        let table = self.inner.table.lock().unwrap();
        table.members.values().map(|s| s.member.clone()).collect()
    }

    pub fn local_member(&self) -> Member {
        let table = self.inner.table.lock().unwrap();
        table.members[&self.inner.cfg.node_name].member.clone()
    }

    /// Merge `tags` into the local member's tag set and bump the incarnation
    /// so the change propagates on the next gossip round.
    pub fn set_tags(&self, tags: HashMap<String, String>) {
        let mut table = self.inner.table.lock().unwrap();
        table.incarnation += 1;
        let incarnation = table.incarnation;
        if let Some(state) = table.members.get_mut(&self.inner.cfg.node_name) {
            state.member.tags.extend(tags);
            state.incarnation = incarnation;
        }
    }

    /// Contact each seed once. Returns the number of seeds a join datagram
    /// was delivered to; failures are warnings, never fatal.
    pub async fn join(&self, seeds: &[String]) -> usize {
        let snapshot = self.wire_snapshot();
        let packet = Packet::Join(snapshot);
        let mut contacted = 0;
        for seed in seeds {
            let addr = match tokio::net::lookup_host(seed.as_str()).await {
                Ok(mut addrs) => addrs.next(),
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Failed to resolve join address");
                    continue;
                }
            };
            let Some(addr) = addr else {
                warn!(seed = %seed, "Join address resolved to nothing");
                continue;
            };
            match self.send_packet(addr, &packet).await {
                Ok(()) => contacted += 1,
                Err(e) => warn!(seed = %seed, error = %e, "Failed to contact seed"),
            }
        }
        if contacted == 0 && !seeds.is_empty() {
            warn!("Could not contact any join seed; retry-join will keep trying");
        }
        contacted
    }

    /// Gracefully leave: announce departure to every known peer, then mark
    /// ourselves left. The caller shuts the pumps down afterwards.
    pub async fn leave(&self) {
        let (packet, targets) = {
            let mut table = self.inner.table.lock().unwrap();
            table.incarnation += 1;
            let incarnation = table.incarnation;
            let name = self.inner.cfg.node_name.clone();
            if let Some(state) = table.members.get_mut(&name) {
                state.member.status = MemberStatus::Leaving;
                state.incarnation = incarnation;
            }
            let targets: Vec<SocketAddr> = table
                .members
                .values()
                .filter(|s| s.member.name != name)
                .map(|s| s.member.addr)
                .collect();
            (Packet::Leave { name, incarnation }, targets)
        };

        for addr in targets {
            if let Err(e) = self.send_packet(addr, &packet).await {
                debug!(peer = %addr, error = %e, "Failed to announce leave");
            }
        }

        let mut table = self.inner.table.lock().unwrap();
        if let Some(state) = table.members.get_mut(&self.inner.cfg.node_name) {
            state.member.status = MemberStatus::Left;
        }
        info!("Left the gossip cluster");
    }

    /// Stop the gossip pumps.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    // ── Pumps ─────────────────────────────────────────────────────────────

    fn spawn_recv_pump(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut shutdown = this.inner.shutdown.subscribe();
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    recv = this.inner.socket.recv_from(&mut buf) => {
                        let (len, from) = match recv {
                            Ok(ok) => ok,
                            Err(e) => {
                                debug!(error = %e, "Gossip recv error");
                                continue;
                            }
                        };
                        this.handle_datagram(&buf[..len], from).await;
                    }
                }
            }
        });
    }

    fn spawn_tick_pump(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut shutdown = this.inner.shutdown.subscribe();
            let mut tick = tokio::time::interval(this.inner.cfg.profile.gossip_interval());
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tick.tick() => this.gossip_round().await,
                }
            }
        });
    }

    async fn gossip_round(&self) {
        let (snapshot, targets, events) = {
            let mut table = self.inner.table.lock().unwrap();
            table.heartbeat += 1;
            let heartbeat = table.heartbeat;
            let name = self.inner.cfg.node_name.clone();
            if let Some(state) = table.members.get_mut(&name) {
                state.heartbeat = heartbeat;
                state.last_seen = Instant::now();
            }

            let events = self.detect_failures(&mut table);

            let snapshot: Vec<WireMember> =
                table.members.values().map(MemberState::to_wire).collect();
            let mut candidates: Vec<SocketAddr> = table
                .members
                .values()
                .filter(|s| {
                    s.member.name != name
                        && matches!(
                            s.member.status,
                            MemberStatus::Alive | MemberStatus::Failed
                        )
                })
                .map(|s| s.member.addr)
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(GOSSIP_FANOUT);
            (snapshot, candidates, events)
        };

        self.emit(events);

        let packet = Packet::Sync(snapshot);
        for addr in targets {
            if let Err(e) = self.send_packet(addr, &packet).await {
                debug!(peer = %addr, error = %e, "Gossip send failed");
            }
        }
    }

    /// Mark silent members failed; reap failed/left members past the
    /// reconnect timeout. Runs under the table lock.
    fn detect_failures(&self, table: &mut Table) -> Vec<MemberEvent> {
        let failure_timeout = self.inner.cfg.profile.failure_timeout();
        let reconnect_timeout = self.inner.cfg.reconnect_timeout;
        let local = &self.inner.cfg.node_name;
        let mut events = Vec::new();
        let mut reap = Vec::new();

        for state in table.members.values_mut() {
            if &state.member.name == local {
                continue;
            }
            let silent = state.last_seen.elapsed();
            match state.member.status {
                MemberStatus::Alive | MemberStatus::Leaving => {
                    if silent > failure_timeout {
                        state.member.status = MemberStatus::Failed;
                        events.push(MemberEvent::Failed(state.member.clone()));
                    }
                }
                MemberStatus::Failed | MemberStatus::Left => {
                    if silent > reconnect_timeout {
                        reap.push(state.member.name.clone());
                    }
                }
            }
        }

        for name in reap {
            if let Some(state) = table.members.remove(&name) {
                events.push(MemberEvent::Reap(state.member));
            }
        }
        events
    }

    async fn handle_datagram(&self, frame: &[u8], from: SocketAddr) {
        let plaintext = match self.inner.cfg.key {
            Some(key) => match Seal::new(&key).open(frame) {
                Some(p) => p,
                None => {
                    debug!(peer = %from, "Dropping undecryptable gossip datagram");
                    return;
                }
            },
            None => frame.to_vec(),
        };

        let packet: Packet = match bincode::deserialize(&plaintext) {
            Ok(p) => p,
            Err(e) => {
                debug!(peer = %from, error = %e, "Dropping malformed gossip datagram");
                return;
            }
        };

        match packet {
            Packet::Join(list) => {
                let events = self.merge(list);
                self.emit(events);
                // A joiner knows nothing yet; answer with our table.
                let reply = Packet::Sync(self.wire_snapshot());
                if let Err(e) = self.send_packet(from, &reply).await {
                    debug!(peer = %from, error = %e, "Failed to answer join");
                }
            }
            Packet::Sync(list) => {
                let events = self.merge(list);
                self.emit(events);
            }
            Packet::Leave { name, incarnation } => {
                let mut events = Vec::new();
                {
                    let mut table = self.inner.table.lock().unwrap();
                    if let Some(state) = table.members.get_mut(&name) {
                        if incarnation >= state.incarnation
                            && state.member.status != MemberStatus::Left
                        {
                            state.incarnation = incarnation;
                            state.member.status = MemberStatus::Left;
                            state.last_seen = Instant::now();
                            events.push(MemberEvent::Leave(state.member.clone()));
                        }
                    }
                }
                self.emit(events);
            }
        }
    }

    /// Merge a remote member list into the local table, returning the events
    /// the merge produced.
    fn merge(&self, list: Vec<WireMember>) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        let mut table = self.inner.table.lock().unwrap();
        let local = self.inner.cfg.node_name.clone();

        for wm in list {
            if wm.name == local {
                // Refute stale reports claiming we are gone.
                if wm.status != MemberStatus::Alive && wm.incarnation >= table.incarnation {
                    table.incarnation = wm.incarnation + 1;
                    let incarnation = table.incarnation;
                    if let Some(state) = table.members.get_mut(&local) {
                        if state.member.status == MemberStatus::Alive {
                            state.incarnation = incarnation;
                        }
                    }
                }
                continue;
            }

            match table.members.get_mut(&wm.name) {
                None => {
                    let is_alive = wm.status == MemberStatus::Alive;
                    let member = Member {
                        name: wm.name.clone(),
                        addr: wm.addr,
                        status: wm.status,
                        tags: wm.tags.clone(),
                    };
                    table.members.insert(
                        wm.name.clone(),
                        MemberState {
                            member: member.clone(),
                            incarnation: wm.incarnation,
                            heartbeat: wm.heartbeat,
                            last_seen: Instant::now(),
                        },
                    );
                    if is_alive {
                        events.push(MemberEvent::Join(member));
                    }
                }
                Some(state) => {
                    let newer = (wm.incarnation, wm.heartbeat)
                        > (state.incarnation, state.heartbeat);
                    if !newer {
                        continue;
                    }
                    state.incarnation = wm.incarnation;
                    state.heartbeat = wm.heartbeat;
                    state.last_seen = Instant::now();
                    state.member.addr = wm.addr;

                    let old_status = state.member.status;
                    let tags_changed = state.member.tags != wm.tags;
                    state.member.tags = wm.tags;

                    match (old_status, wm.status) {
                        (a, b) if a == b => {
                            if tags_changed {
                                events.push(MemberEvent::Update(state.member.clone()));
                            }
                        }
                        (_, MemberStatus::Left) => {
                            state.member.status = MemberStatus::Left;
                            events.push(MemberEvent::Leave(state.member.clone()));
                        }
                        (MemberStatus::Failed, MemberStatus::Alive)
                        | (MemberStatus::Left, MemberStatus::Alive) => {
                            state.member.status = MemberStatus::Alive;
                            events.push(MemberEvent::Join(state.member.clone()));
                        }
                        (_, MemberStatus::Failed) => {
                            state.member.status = MemberStatus::Failed;
                            events.push(MemberEvent::Failed(state.member.clone()));
                        }
                        (_, new_status) => {
                            state.member.status = new_status;
                            events.push(MemberEvent::Update(state.member.clone()));
                        }
                    }
                }
            }
        }
        events
    }

    fn emit(&self, events: Vec<MemberEvent>) {
        for event in events {
            debug!(
                kind = event.kind(),
                member = %event.member().name,
                status = event.member().status.as_str(),
                "Membership event"
            );
            // Send only fails when nobody is subscribed, which is fine.
            let _ = self.inner.events.send(event);
        }
    }

    fn wire_snapshot(&self) -> Vec<WireMember> {
        let table = self.inner.table.lock().unwrap();
        table.members.values().map(MemberState::to_wire).collect()
    }

    async fn send_packet(&self, to: SocketAddr, packet: &Packet) -> Result<()> {
        let plaintext =
            bincode::serialize(packet).map_err(|e| Error::Membership(e.to_string()))?;
        let frame = match self.inner.cfg.key {
            Some(key) => Seal::new(&key).seal(&plaintext),
            None => plaintext,
        };
        self.inner
            .socket
            .send_to(&frame, to)
            .await
            .map_err(|e| Error::Membership(format!("send to {to}: {e}")))?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(name: &str, key: Option<[u8; 32]>) -> MembershipConfig {
        MembershipConfig {
            cluster: "taskvault".to_string(),
            node_name: name.to_string(),
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            advertise: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            profile: Profile::Local,
            key,
            reconnect_timeout: Duration::from_secs(60),
            tags: HashMap::new(),
        }
    }

    fn server_tags(name: &str, rpc_addr: &str) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert(TAG_ROLE.to_string(), "taskvault".to_string());
        tags.insert(TAG_ID.to_string(), name.to_string());
        tags.insert(TAG_PORT.to_string(), "6868".to_string());
        tags.insert(TAG_RPC_ADDR.to_string(), rpc_addr.to_string());
        tags
    }

    #[test]
    fn seal_roundtrip_and_wrong_key() {
        let seal = Seal::new(&[3u8; 32]);
        let frame = seal.seal(b"hello gossip");
        assert_eq!(seal.open(&frame).as_deref(), Some(&b"hello gossip"[..]));

        let other = Seal::new(&[4u8; 32]);
        assert!(other.open(&frame).is_none());
        assert!(seal.open(&frame[..NONCE_LEN]).is_none());
    }

    #[test]
    fn server_identity_requires_complete_tags() {
        let mut member = Member {
            name: "n1".to_string(),
            addr: "127.0.0.1:8946".parse().unwrap(),
            status: MemberStatus::Alive,
            tags: HashMap::new(),
        };
        assert!(member.server_identity("taskvault").is_none());

        member.tags = server_tags("n1", "10.0.0.1:6868");
        let identity = member.server_identity("taskvault").unwrap();
        assert_eq!(identity.name, "n1");
        assert_eq!(identity.rpc_addr, "10.0.0.1:6868");
        assert!(!identity.bootstrap);

        // Wrong role: not a server of this cluster.
        member
            .tags
            .insert(TAG_ROLE.to_string(), "other-cluster".to_string());
        assert!(member.server_identity("taskvault").is_none());

        // Unparseable port invalidates the identity.
        member.tags = server_tags("n1", "10.0.0.1:6868");
        member.tags.insert(TAG_PORT.to_string(), "not-a-port".to_string());
        assert!(member.server_identity("taskvault").is_none());
    }

    #[test]
    fn server_identity_falls_back_to_gossip_host() {
        let mut tags = server_tags("n1", "");
        tags.remove(TAG_RPC_ADDR);
        let member = Member {
            name: "n1".to_string(),
            addr: "10.9.8.7:8946".parse().unwrap(),
            status: MemberStatus::Alive,
            tags,
        };
        let identity = member.server_identity("taskvault").unwrap();
        assert_eq!(identity.rpc_addr, "10.9.8.7:6868");
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other() {
        let a = Membership::start(test_config("a", None)).await.unwrap();
        let b = Membership::start(test_config("b", None)).await.unwrap();
        let mut events = a.events();

        let seed = a.bound_addr().to_string();
        assert_eq!(b.join(&[seed]).await, 1);

        // a should observe b joining.
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(MemberEvent::Join(m)) if m.name == "b" => return,
                    Ok(_) => continue,
                    Err(_) => panic!("event channel closed"),
                }
            }
        });
        deadline.await.expect("a never saw b join");

        assert!(a.members().iter().any(|m| m.name == "b"));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn encrypted_nodes_ignore_plaintext_peers() {
        let sealed = Membership::start(test_config("sealed", Some([9u8; 32])))
            .await
            .unwrap();
        let plain = Membership::start(test_config("plain", None)).await.unwrap();

        let seed = sealed.bound_addr().to_string();
        plain.join(&[seed]).await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        // The sealed node drops the plaintext datagrams.
        assert!(!sealed.members().iter().any(|m| m.name == "plain"));

        sealed.shutdown();
        plain.shutdown();
    }

    #[tokio::test]
    async fn leave_propagates_to_peers() {
        let a = Membership::start(test_config("a", None)).await.unwrap();
        let b = Membership::start(test_config("b", None)).await.unwrap();
        let mut events = a.events();

        let seed = a.bound_addr().to_string();
        b.join(&[seed]).await;

        // Wait until a knows b, then have b leave.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if a.members().iter().any(|m| m.name == "b") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("a never learned about b");

        b.leave().await;

        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(MemberEvent::Leave(m)) if m.name == "b" => return,
                    Ok(_) => continue,
                    Err(_) => panic!("event channel closed"),
                }
            }
        });
        deadline.await.expect("a never saw b leave");

        let member = a
            .members()
            .into_iter()
            .find(|m| m.name == "b")
            .expect("b still known");
        assert_eq!(member.status, MemberStatus::Left);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn set_tags_propagates_as_update() {
        let a = Membership::start(test_config("a", None)).await.unwrap();
        let b = Membership::start(test_config("b", None)).await.unwrap();
        let mut events = a.events();

        let seed = a.bound_addr().to_string();
        b.join(&[seed]).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if a.members().iter().any(|m| m.name == "b") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("a never learned about b");

        let mut tags = HashMap::new();
        tags.insert("rack".to_string(), "r7".to_string());
        b.set_tags(tags);

        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(MemberEvent::Update(m))
                        if m.name == "b" && m.tag("rack") == Some("r7") =>
                    {
                        return
                    }
                    Ok(_) => continue,
                    Err(_) => panic!("event channel closed"),
                }
            }
        });
        deadline.await.expect("a never saw b's tag update");

        a.shutdown();
        b.shutdown();
    }
}
