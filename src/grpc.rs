//! The TaskVault gRPC service.
//!
//! Thin handlers over the replicated log: mutating RPCs encode a log command
//! and submit it through the Raft handle; reads come straight from the local
//! KV map. Administrative RPCs expose the voter configuration, peer removal,
//! and graceful departure.
//!
//! Mutating calls on a non-leader node answer `FAILED_PRECONDITION` with the
//! leader's advertised address in the message; clients re-dial the leader.
//! The server runs over the gRPC half of the connection multiplexer, so it
//! shares its TCP port with the Raft stream protocol.

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::command::Command;
use crate::error::Error;
use crate::membership::Membership;
use crate::raft::{raft_node_id, RaftHandle};
use crate::store::KvStore;
use crate::transport::GrpcIncoming;

/// Generated protobuf types and gRPC service stubs for `TaskVault`.
pub mod proto {
    tonic::include_proto!("taskvault");
}

use proto::task_vault_server::{TaskVault, TaskVaultServer};
use proto::*;

// ── Service implementation ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TaskVaultService {
    raft: RaftHandle,
    kv: KvStore,
    membership: Membership,
}

impl TaskVaultService {
    pub fn new(raft: RaftHandle, kv: KvStore, membership: Membership) -> Self {
        Self {
            raft,
            kv,
            membership,
        }
    }

    /// Submit a mutating command to the replicated log.
    async fn write(&self, command: Command) -> Result<crate::store::Applied, Status> {
        self.raft
            .apply(command.encode())
            .await
            .map_err(status_from_error)
    }

    /// Resolve a Raft server id back to its node name via gossip tags.
    fn name_for(&self, id: u64) -> Option<String> {
        let cluster = self.membership_cluster();
        self.membership
            .members()
            .into_iter()
            .filter_map(|m| m.server_identity(&cluster))
            .find(|identity| raft_node_id(&identity.name) == id)
            .map(|identity| identity.name)
    }

    /// The local role tag is the cluster identifier the agent advertises.
    fn membership_cluster(&self) -> String {
        let local = self.membership.local_member();
        local
            .tag(crate::membership::TAG_ROLE)
            .unwrap_or("taskvault")
            .to_string()
    }
}

fn status_from_error(e: Error) -> Status {
    match e {
        Error::NotLeader { .. } => Status::failed_precondition(e.to_string()),
        Error::Timeout(_) => Status::deadline_exceeded(e.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl TaskVault for TaskVaultService {
    async fn create_value(
        &self,
        req: Request<CreateValueRequest>,
    ) -> Result<Response<CreateValueResponse>, Status> {
        let inner = req.into_inner();
        let applied = self
            .write(Command::SetPair {
                key: inner.key,
                value: inner.value,
            })
            .await?;
        Ok(Response::new(CreateValueResponse {
            ok: applied.ok,
            detail: applied.detail,
        }))
    }

    async fn get_value(
        &self,
        req: Request<GetValueRequest>,
    ) -> Result<Response<GetValueResponse>, Status> {
        let key = req.into_inner().key;
        match self.kv.get(&key) {
            Some(value) => Ok(Response::new(GetValueResponse { found: true, value })),
            None => Ok(Response::new(GetValueResponse {
                found: false,
                value: String::new(),
            })),
        }
    }

    async fn update_value(
        &self,
        req: Request<UpdateValueRequest>,
    ) -> Result<Response<UpdateValueResponse>, Status> {
        let inner = req.into_inner();
        let applied = self
            .write(Command::SetPair {
                key: inner.key,
                value: inner.value,
            })
            .await?;
        Ok(Response::new(UpdateValueResponse {
            ok: applied.ok,
            detail: applied.detail,
        }))
    }

    async fn delete_value(
        &self,
        req: Request<DeleteValueRequest>,
    ) -> Result<Response<DeleteValueResponse>, Status> {
        let inner = req.into_inner();
        let applied = self.write(Command::DeletePair { key: inner.key }).await?;
        Ok(Response::new(DeleteValueResponse {
            ok: applied.ok,
            detail: applied.detail,
        }))
    }

    async fn get_all_pairs(
        &self,
        _req: Request<GetAllPairsRequest>,
    ) -> Result<Response<GetAllPairsResponse>, Status> {
        let mut pairs: Vec<Pair> = self
            .kv
            .dump()
            .into_iter()
            .map(|(key, value)| Pair { key, value })
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Response::new(GetAllPairsResponse { pairs }))
    }

    async fn leave(&self, _req: Request<LeaveRequest>) -> Result<Response<LeaveResponse>, Status> {
        info!("Leave requested over gRPC");
        self.membership.leave().await;
        Ok(Response::new(LeaveResponse { ok: true }))
    }

    async fn raft_get_configuration(
        &self,
        _req: Request<RaftGetConfigurationRequest>,
    ) -> Result<Response<RaftGetConfigurationResponse>, Status> {
        let leader = self.raft.leader();
        let servers = self
            .raft
            .configuration()
            .into_iter()
            .map(|voter| {
                let leader = leader.as_deref() == Some(voter.addr.as_str());
                RaftServer {
                    id: self
                        .name_for(voter.id)
                        .unwrap_or_else(|| voter.id.to_string()),
                    address: voter.addr,
                    leader,
                }
            })
            .collect();
        Ok(Response::new(RaftGetConfigurationResponse { servers }))
    }

    async fn raft_remove_peer_by_id(
        &self,
        req: Request<RaftRemovePeerByIdRequest>,
    ) -> Result<Response<RaftRemovePeerByIdResponse>, Status> {
        let name = req.into_inner().id;
        if name.is_empty() {
            return Err(Status::invalid_argument("peer id cannot be empty"));
        }
        if name == self.raft.node_name() {
            return Err(Status::failed_precondition(
                "refusing to remove the local node; issue this on another leader",
            ));
        }
        warn!(peer = %name, "Removing peer from configuration by operator request");
        self.raft
            .remove_server(raft_node_id(&name))
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(RaftRemovePeerByIdResponse {
            ok: true,
            detail: format!("removed {name}"),
        }))
    }
}

// ── Server startup ────────────────────────────────────────────────────────────

/// Serve the gRPC half of the multiplexer until shutdown flips.
pub fn spawn_grpc_server(
    service: TaskVaultService,
    incoming: GrpcIncoming,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        info!("gRPC server starting on the multiplexed listener");
        let result = Server::builder()
            .add_service(TaskVaultServer::new(service))
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "gRPC server error");
        }
    });
}
