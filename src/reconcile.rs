//! Voter reconciliation and leadership monitoring.
//!
//! The reconciler mirrors gossip membership into the Raft voter
//! configuration. It runs only on the leader: the leadership monitor watches
//! leader-state transitions and starts exactly one reconciler loop on
//! acquire, stopping it (and waiting for it to exit) on loss.
//!
//! The loop is a two-phase machine:
//!
//! ```text
//! Refresh: write barrier -> full sweep          (errors fall through to Wait)
//! Wait:    stop | global shutdown | periodic tick -> Refresh
//!          | incremental member event -> reconcile that member
//! ```
//!
//! The stop signal is checked immediately before and after the sweep, so the
//! loop exits promptly on leadership loss. All configuration mutations are
//! idempotent against steady state; a failed sweep is simply retried on the
//! next tick, and a failed incremental event is dropped because the next
//! sweep reconverges.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::membership::{Member, MemberStatus, Membership, ServerIdentity};
use crate::raft::{raft_node_id, NodeId, RaftHandle, Voter};

// ── Raft control seam ─────────────────────────────────────────────────────────

/// The slice of the Raft surface the reconciler needs. `RaftHandle` is the
/// real implementation; tests drive the policy with a fake.
#[async_trait]
pub trait RaftControl: Send + Sync + 'static {
    fn self_id(&self) -> NodeId;
    async fn barrier(&self) -> Result<()>;
    async fn configuration(&self) -> Result<Vec<Voter>>;
    async fn add_voter(&self, id: NodeId, addr: String) -> Result<()>;
    async fn remove_server(&self, id: NodeId) -> Result<()>;
}

#[async_trait]
impl RaftControl for RaftHandle {
    fn self_id(&self) -> NodeId {
        self.node_id()
    }

    async fn barrier(&self) -> Result<()> {
        RaftHandle::barrier(self).await
    }

    async fn configuration(&self) -> Result<Vec<Voter>> {
        Ok(RaftHandle::configuration(self))
    }

    async fn add_voter(&self, id: NodeId, addr: String) -> Result<()> {
        RaftHandle::add_voter(self, id, addr).await
    }

    async fn remove_server(&self, id: NodeId) -> Result<()> {
        RaftHandle::remove_server(self, id).await
    }
}

// ── Reconciler ────────────────────────────────────────────────────────────────

pub struct Reconciler<R: RaftControl> {
    control: Arc<R>,
    cluster: String,
    self_join_threshold: usize,
}

impl<R: RaftControl> Reconciler<R> {
    pub fn new(control: Arc<R>, cluster: impl Into<String>, self_join_threshold: usize) -> Self {
        Self {
            control,
            cluster: cluster.into(),
            self_join_threshold,
        }
    }

    /// Full sweep over `members`, in membership order. The first failure
    /// aborts the sweep and surfaces to the caller; the monitor retries on
    /// the next tick.
    pub async fn refresh(&self, members: &[Member]) -> Result<()> {
        for member in members {
            self.refresh_member(member, members).await?;
        }
        Ok(())
    }

    /// Reconcile a single member against the current configuration.
    pub async fn refresh_member(&self, member: &Member, members: &[Member]) -> Result<()> {
        // Members without complete server tags are not ours to manage.
        let Some(identity) = member.server_identity(&self.cluster) else {
            return Ok(());
        };
        match member.status {
            MemberStatus::Alive => self.ensure_voter(&identity, members).await,
            MemberStatus::Left => self.remove_voter(&identity).await,
            // Failed members keep their vote until they leave or are reaped;
            // leaving members resolve to left shortly.
            MemberStatus::Leaving | MemberStatus::Failed => Ok(()),
        }
    }

    async fn ensure_voter(&self, identity: &ServerIdentity, members: &[Member]) -> Result<()> {
        let id = raft_node_id(&identity.name);

        if identity.bootstrap {
            let conflicting = bootstrap_members(members, &self.cluster);
            if conflicting.len() > 1 {
                error!(
                    members = ?conflicting,
                    "Members are both in bootstrap mode; refusing to reconcile them \
                     until the operator resolves the conflict"
                );
                return Ok(());
            }
        }

        // Self-join guard: during a small-cluster bring-up the bootstrap
        // configuration already contains us; re-adding races the join.
        if id == self.control.self_id() {
            let config = self.control.configuration().await?;
            if config.len() < self.self_join_threshold {
                debug!(
                    servers = config.len(),
                    threshold = self.self_join_threshold,
                    "Skipping self-join while the configuration is small"
                );
                return Ok(());
            }
        }

        let config = self.control.configuration().await?;
        if config
            .iter()
            .any(|v| v.id == id && v.addr == identity.rpc_addr)
        {
            return Ok(());
        }

        // A server already claims this address under a different ID: a stale
        // entry from a reused host. Drop it before adding the new voter.
        if let Some(stale) = config
            .iter()
            .find(|v| v.addr == identity.rpc_addr && v.id != id)
        {
            warn!(
                addr = %identity.rpc_addr,
                stale_id = stale.id,
                new = %identity.name,
                "Removing stale voter entry for reused address"
            );
            self.control.remove_server(stale.id).await?;
        }

        info!(member = %identity.name, addr = %identity.rpc_addr, "Adding voter");
        self.control.add_voter(id, identity.rpc_addr.clone()).await
    }

    async fn remove_voter(&self, identity: &ServerIdentity) -> Result<()> {
        let id = raft_node_id(&identity.name);

        if id == self.control.self_id() {
            // Self-removal must be issued by a different leader after
            // leadership has moved away.
            warn!(
                member = %identity.name,
                "Refusing to remove ourselves from the configuration"
            );
            return Ok(());
        }

        let config = self.control.configuration().await?;
        if config.iter().any(|v| v.id == id) {
            info!(member = %identity.name, "Removing departed voter");
            self.control.remove_server(id).await?;
        }
        Ok(())
    }
}

/// Names of live server members advertising bootstrap mode.
fn bootstrap_members(members: &[Member], cluster: &str) -> Vec<String> {
    let mut names: Vec<String> = members
        .iter()
        .filter(|m| m.status == MemberStatus::Alive)
        .filter_map(|m| m.server_identity(cluster))
        .filter(|identity| identity.bootstrap)
        .map(|identity| identity.name)
        .collect();
    names.sort();
    names.dedup();
    names
}

// ── Leadership monitor ────────────────────────────────────────────────────────

/// Watches leadership transitions and maintains the invariant that at most
/// one reconciler loop exists at any time.
pub struct LeadershipMonitor<R: RaftControl> {
    control: Arc<R>,
    membership: Membership,
    leader_rx: watch::Receiver<bool>,
    /// Incremental member events; owned here between reconciler runs and
    /// handed to the loop task while one is running.
    member_events: Option<mpsc::Receiver<Member>>,
    shutdown: watch::Receiver<bool>,
    cluster: String,
    refresh_interval: Duration,
    self_join_threshold: usize,
    running: Option<(watch::Sender<bool>, JoinHandle<mpsc::Receiver<Member>>)>,
}

impl<R: RaftControl> LeadershipMonitor<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<R>,
        membership: Membership,
        leader_rx: watch::Receiver<bool>,
        member_events: mpsc::Receiver<Member>,
        shutdown: watch::Receiver<bool>,
        cluster: impl Into<String>,
        refresh_interval: Duration,
        self_join_threshold: usize,
    ) -> Self {
        Self {
            control,
            membership,
            leader_rx,
            member_events: Some(member_events),
            shutdown,
            cluster: cluster.into(),
            refresh_interval,
            self_join_threshold,
            running: None,
        }
    }

    pub async fn run(mut self) {
        // Leadership may have been acquired before we subscribed.
        if *self.leader_rx.borrow_and_update() {
            self.acquire();
        }

        loop {
            tokio::select! {
                changed = self.leader_rx.changed() => {
                    if changed.is_err() {
                        self.release().await;
                        return;
                    }
                    let is_leader = *self.leader_rx.borrow_and_update();
                    if is_leader {
                        self.acquire();
                    } else {
                        self.release().await;
                    }
                }
                _ = self.shutdown.changed() => {
                    // Return immediately; the reconciler loop observes the
                    // same shutdown signal and exits on its own.
                    return;
                }
            }
        }
    }

    fn acquire(&mut self) {
        if self.running.is_some() {
            error!("Duplicate leadership acquire; reconciler already running");
            return;
        }
        let Some(events) = self.member_events.take() else {
            error!("Member event channel unavailable; cannot start reconciler");
            return;
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let reconciler = Arc::new(Reconciler::new(
            self.control.clone(),
            self.cluster.clone(),
            self.self_join_threshold,
        ));
        let handle = tokio::spawn(reconcile_loop(
            reconciler,
            self.control.clone(),
            self.membership.clone(),
            events,
            stop_rx,
            self.shutdown.clone(),
            self.refresh_interval,
        ));
        self.running = Some((stop_tx, handle));
        info!("Leadership acquired; reconciler started");
    }

    async fn release(&mut self) {
        match self.running.take() {
            None => error!("Duplicate leadership release; no reconciler running"),
            Some((stop_tx, handle)) => {
                let _ = stop_tx.send(true);
                match handle.await {
                    Ok(events) => self.member_events = Some(events),
                    Err(e) => error!(error = %e, "Reconciler task failed"),
                }
                info!("Leadership released; reconciler stopped");
            }
        }
    }
}

enum Phase {
    Refresh,
    Wait,
}

/// The reconciler loop body. Returns the member event receiver so the
/// monitor can hand it to the next incarnation.
async fn reconcile_loop<R: RaftControl>(
    reconciler: Arc<Reconciler<R>>,
    control: Arc<R>,
    membership: Membership,
    mut events: mpsc::Receiver<Member>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    refresh_interval: Duration,
) -> mpsc::Receiver<Member> {
    let mut phase = Phase::Refresh;
    let mut events_open = true;
    let mut tick = tokio::time::interval(refresh_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick completes immediately; the Refresh phase below
    // is that first run.
    tick.tick().await;

    loop {
        match phase {
            Phase::Refresh => {
                if *stop.borrow() || *shutdown.borrow() {
                    break;
                }
                match control.barrier().await {
                    Err(e) => {
                        warn!(error = %e, "Write barrier failed; waiting for next tick");
                    }
                    Ok(()) => {
                        let members = membership.members();
                        if let Err(e) = reconciler.refresh(&members).await {
                            warn!(error = %e, "Reconciliation sweep failed; waiting for next tick");
                        }
                    }
                }
                if *stop.borrow() || *shutdown.borrow() {
                    break;
                }
                phase = Phase::Wait;
            }
            Phase::Wait => {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        phase = Phase::Refresh;
                    }
                    member = events.recv(), if events_open => {
                        match member {
                            Some(member) => {
                                let members = membership.members();
                                if let Err(e) =
                                    reconciler.refresh_member(&member, &members).await
                                {
                                    // Dropped; the periodic sweep reconverges.
                                    warn!(
                                        member = %member.name,
                                        error = %e,
                                        "Incremental reconciliation failed"
                                    );
                                }
                            }
                            None => events_open = false,
                        }
                    }
                }
            }
        }
    }
    events
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::membership::{
        MembershipConfig, TAG_BOOTSTRAP, TAG_ID, TAG_PORT, TAG_ROLE, TAG_RPC_ADDR,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    const CLUSTER: &str = "taskvault";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Barrier,
        AddVoter(NodeId, String),
        RemoveServer(NodeId),
    }

    struct FakeRaft {
        self_id: NodeId,
        voters: Mutex<Vec<Voter>>,
        ops: Mutex<Vec<Op>>,
        fail_adds_for: Mutex<Vec<NodeId>>,
    }

    impl FakeRaft {
        fn new(self_name: &str) -> Arc<Self> {
            Arc::new(Self {
                self_id: raft_node_id(self_name),
                voters: Mutex::new(Vec::new()),
                ops: Mutex::new(Vec::new()),
                fail_adds_for: Mutex::new(Vec::new()),
            })
        }

        fn with_voter(self: Arc<Self>, name: &str, addr: &str) -> Arc<Self> {
            self.voters.lock().unwrap().push(Voter {
                id: raft_node_id(name),
                addr: addr.to_string(),
            });
            self
        }

        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn voter_ids(&self) -> Vec<NodeId> {
            self.voters.lock().unwrap().iter().map(|v| v.id).collect()
        }
    }

    #[async_trait]
    impl RaftControl for FakeRaft {
        fn self_id(&self) -> NodeId {
            self.self_id
        }

        async fn barrier(&self) -> Result<()> {
            self.ops.lock().unwrap().push(Op::Barrier);
            Ok(())
        }

        async fn configuration(&self) -> Result<Vec<Voter>> {
            Ok(self.voters.lock().unwrap().clone())
        }

        async fn add_voter(&self, id: NodeId, addr: String) -> Result<()> {
            if self.fail_adds_for.lock().unwrap().contains(&id) {
                return Err(Error::Raft("injected add failure".to_string()));
            }
            self.ops.lock().unwrap().push(Op::AddVoter(id, addr.clone()));
            let mut voters = self.voters.lock().unwrap();
            voters.retain(|v| v.id != id);
            voters.push(Voter { id, addr });
            Ok(())
        }

        async fn remove_server(&self, id: NodeId) -> Result<()> {
            self.ops.lock().unwrap().push(Op::RemoveServer(id));
            self.voters.lock().unwrap().retain(|v| v.id != id);
            Ok(())
        }
    }

    fn server_member(name: &str, addr: &str, status: MemberStatus) -> Member {
        let mut tags = HashMap::new();
        tags.insert(TAG_ROLE.to_string(), CLUSTER.to_string());
        tags.insert(TAG_ID.to_string(), name.to_string());
        tags.insert(TAG_PORT.to_string(), "6868".to_string());
        tags.insert(TAG_RPC_ADDR.to_string(), addr.to_string());
        Member {
            name: name.to_string(),
            addr: "127.0.0.1:8946".parse().unwrap(),
            status,
            tags,
        }
    }

    fn bootstrap_member(name: &str, addr: &str) -> Member {
        let mut member = server_member(name, addr, MemberStatus::Alive);
        member
            .tags
            .insert(TAG_BOOTSTRAP.to_string(), "1".to_string());
        member
    }

    fn reconciler(control: Arc<FakeRaft>) -> Reconciler<FakeRaft> {
        Reconciler::new(control, CLUSTER, 3)
    }

    #[tokio::test]
    async fn members_without_server_tags_are_ignored() {
        let fake = FakeRaft::new("self");
        let r = reconciler(fake.clone());

        let plain = Member {
            name: "client-1".to_string(),
            addr: "127.0.0.1:8946".parse().unwrap(),
            status: MemberStatus::Alive,
            tags: HashMap::new(),
        };
        r.refresh(&[plain]).await.unwrap();
        assert!(fake.ops().is_empty());
    }

    #[tokio::test]
    async fn alive_server_is_added_as_voter() {
        let fake = FakeRaft::new("self");
        let r = reconciler(fake.clone());

        let m = server_member("peer-1", "10.0.0.1:6868", MemberStatus::Alive);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();

        assert_eq!(
            fake.ops(),
            vec![Op::AddVoter(
                raft_node_id("peer-1"),
                "10.0.0.1:6868".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn present_voter_is_left_alone() {
        let fake = FakeRaft::new("self").with_voter("peer-1", "10.0.0.1:6868");
        let r = reconciler(fake.clone());

        let m = server_member("peer-1", "10.0.0.1:6868", MemberStatus::Alive);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert!(fake.ops().is_empty());
    }

    #[tokio::test]
    async fn stale_entry_for_reused_address_is_replaced() {
        let fake = FakeRaft::new("self").with_voter("old-peer", "10.0.0.1:6868");
        let r = reconciler(fake.clone());

        let m = server_member("new-peer", "10.0.0.1:6868", MemberStatus::Alive);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();

        assert_eq!(
            fake.ops(),
            vec![
                Op::RemoveServer(raft_node_id("old-peer")),
                Op::AddVoter(raft_node_id("new-peer"), "10.0.0.1:6868".to_string()),
            ]
        );
        // No two voters share the address afterwards.
        assert_eq!(fake.voter_ids(), vec![raft_node_id("new-peer")]);
    }

    #[tokio::test]
    async fn bootstrap_conflict_skips_conflicting_members_only() {
        let fake = FakeRaft::new("self");
        let r = reconciler(fake.clone());

        let members = vec![
            bootstrap_member("boot-a", "10.0.0.1:6868"),
            bootstrap_member("boot-b", "10.0.0.2:6868"),
            server_member("normal", "10.0.0.3:6868", MemberStatus::Alive),
        ];
        r.refresh(&members).await.unwrap();

        // Only the non-conflicting member was reconciled.
        assert_eq!(
            fake.ops(),
            vec![Op::AddVoter(
                raft_node_id("normal"),
                "10.0.0.3:6868".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn single_bootstrap_member_reconciles_normally() {
        let fake = FakeRaft::new("self");
        let r = reconciler(fake.clone());

        let m = bootstrap_member("boot-a", "10.0.0.1:6868");
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert_eq!(fake.ops().len(), 1);
    }

    #[tokio::test]
    async fn self_join_is_skipped_while_configuration_is_small() {
        let fake = FakeRaft::new("self").with_voter("self", "10.0.0.9:6868");
        let r = reconciler(fake.clone());

        // Self with a changed address; configuration has one server, below
        // the threshold of three, so nothing happens.
        let m = server_member("self", "10.0.0.10:6868", MemberStatus::Alive);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert!(fake.ops().is_empty());
    }

    #[tokio::test]
    async fn self_join_threshold_is_tunable() {
        let fake = FakeRaft::new("self");
        let r = Reconciler::new(fake.clone(), CLUSTER, 1);

        let m = server_member("self", "10.0.0.10:6868", MemberStatus::Alive);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert_eq!(
            fake.ops(),
            vec![Op::AddVoter(
                raft_node_id("self"),
                "10.0.0.10:6868".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn left_member_is_removed() {
        let fake = FakeRaft::new("self").with_voter("peer-1", "10.0.0.1:6868");
        let r = reconciler(fake.clone());

        let m = server_member("peer-1", "10.0.0.1:6868", MemberStatus::Left);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert_eq!(fake.ops(), vec![Op::RemoveServer(raft_node_id("peer-1"))]);
    }

    #[tokio::test]
    async fn left_member_not_in_configuration_is_noop() {
        let fake = FakeRaft::new("self");
        let r = reconciler(fake.clone());

        let m = server_member("stranger", "10.0.0.1:6868", MemberStatus::Left);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert!(fake.ops().is_empty());
    }

    #[tokio::test]
    async fn leader_never_removes_itself() {
        let fake = FakeRaft::new("self").with_voter("self", "10.0.0.9:6868");
        let r = reconciler(fake.clone());

        let m = server_member("self", "10.0.0.9:6868", MemberStatus::Left);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert!(fake.ops().is_empty());
        assert_eq!(fake.voter_ids(), vec![raft_node_id("self")]);
    }

    #[tokio::test]
    async fn failed_member_keeps_its_vote() {
        let fake = FakeRaft::new("self").with_voter("peer-1", "10.0.0.1:6868");
        let r = reconciler(fake.clone());

        let m = server_member("peer-1", "10.0.0.1:6868", MemberStatus::Failed);
        r.refresh(std::slice::from_ref(&m)).await.unwrap();
        assert!(fake.ops().is_empty());
    }

    #[tokio::test]
    async fn sweep_aborts_on_first_failure() {
        let fake = FakeRaft::new("self");
        fake.fail_adds_for
            .lock()
            .unwrap()
            .push(raft_node_id("bad-peer"));
        let r = reconciler(fake.clone());

        let members = vec![
            server_member("bad-peer", "10.0.0.1:6868", MemberStatus::Alive),
            server_member("good-peer", "10.0.0.2:6868", MemberStatus::Alive),
        ];
        assert!(r.refresh(&members).await.is_err());
        // The member after the failure was never processed.
        assert!(fake
            .ops()
            .iter()
            .all(|op| !matches!(op, Op::AddVoter(id, _) if *id == raft_node_id("good-peer"))));
    }

    // ── Monitor lifecycle ─────────────────────────────────────────────────

    async fn test_membership(name: &str) -> Membership {
        Membership::start(MembershipConfig {
            cluster: CLUSTER.to_string(),
            node_name: name.to_string(),
            bind: "127.0.0.1:0".parse().unwrap(),
            advertise: "127.0.0.1:0".parse().unwrap(),
            profile: crate::config::Profile::Local,
            key: None,
            reconnect_timeout: Duration::from_secs(60),
            tags: HashMap::new(),
        })
        .await
        .unwrap()
    }

    fn barrier_count(fake: &FakeRaft) -> usize {
        fake.ops()
            .iter()
            .filter(|op| matches!(op, Op::Barrier))
            .count()
    }

    #[tokio::test]
    async fn monitor_starts_and_stops_reconciler_with_leadership() {
        let fake = FakeRaft::new("self");
        let membership = test_membership("self").await;
        let (leader_tx, leader_rx) = watch::channel(false);
        let (_event_tx, event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = LeadershipMonitor::new(
            fake.clone(),
            membership.clone(),
            leader_rx,
            event_rx,
            shutdown_rx,
            CLUSTER,
            Duration::from_millis(50),
            3,
        );
        let monitor_task = tokio::spawn(monitor.run());

        // Acquire: the loop runs a barrier + sweep.
        leader_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while barrier_count(&fake) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconciler never ran a barrier");

        // Release: the loop stops; barrier count settles.
        leader_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let settled = barrier_count(&fake);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(barrier_count(&fake), settled, "reconciler kept running after release");

        // Re-acquire works with the recovered event channel.
        leader_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while barrier_count(&fake) <= settled {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconciler did not restart on re-acquire");

        membership.shutdown();
        monitor_task.abort();
    }

    #[tokio::test]
    async fn incremental_member_events_are_reconciled() {
        let fake = FakeRaft::new("self");
        let membership = test_membership("self").await;
        let (leader_tx, leader_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = LeadershipMonitor::new(
            fake.clone(),
            membership.clone(),
            leader_rx,
            event_rx,
            shutdown_rx,
            CLUSTER,
            // Long interval so only the incremental path can explain the add.
            Duration::from_secs(3600),
            3,
        );
        let monitor_task = tokio::spawn(monitor.run());

        leader_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while barrier_count(&fake) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconciler never started");

        let member = server_member("joiner", "10.0.0.5:6868", MemberStatus::Alive);
        event_tx.send(member).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if fake
                    .ops()
                    .iter()
                    .any(|op| matches!(op, Op::AddVoter(id, _) if *id == raft_node_id("joiner")))
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("incremental event was not reconciled");

        membership.shutdown();
        monitor_task.abort();
    }

    #[tokio::test]
    async fn global_shutdown_stops_the_loop() {
        let fake = FakeRaft::new("self");
        let membership = test_membership("self").await;
        let (leader_tx, leader_rx) = watch::channel(false);
        let (_event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = LeadershipMonitor::new(
            fake.clone(),
            membership.clone(),
            leader_rx,
            event_rx,
            shutdown_rx,
            CLUSTER,
            Duration::from_millis(50),
            3,
        );
        let monitor_task = tokio::spawn(monitor.run());

        leader_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while barrier_count(&fake) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reconciler never started");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), monitor_task)
            .await
            .expect("monitor did not exit on shutdown")
            .unwrap();

        // The loop observed shutdown too; the sweep counter settles.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let settled = barrier_count(&fake);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(barrier_count(&fake), settled);

        membership.shutdown();
    }
}
