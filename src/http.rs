//! Cluster health HTTP endpoint.
//!
//! Serves `GET /health/cluster` on the admin port with the node's current
//! Raft role, known leader, and membership counts. Load balancers and
//! operators poll this; everything else on the admin surface lives outside
//! the agent.

use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tracing::{error, info};

use crate::membership::{Membership, MemberStatus};
use crate::raft::RaftHandle;

#[derive(Clone)]
pub struct HealthState {
    pub node_name: String,
    pub cluster: String,
    pub raft: RaftHandle,
    pub membership: Membership,
}

#[derive(serde::Serialize)]
struct HealthResponse {
    node: String,
    cluster: String,
    state: String,
    leader: Option<String>,
    members_alive: usize,
    members_known: usize,
    voters: usize,
}

async fn health_handler(
    req: Request<Body>,
    state: HealthState,
) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != "/health/cluster" {
        return Ok(Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap());
    }

    let members = state.membership.members();
    let response = HealthResponse {
        node: state.node_name.clone(),
        cluster: state.cluster.clone(),
        state: state.raft.state().as_str().to_string(),
        leader: state.raft.leader(),
        members_alive: members
            .iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .count(),
        members_known: members.len(),
        voters: state.raft.configuration().len(),
    };

    let body = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

/// Start the health server. Runs until the process exits; spawn it.
pub async fn start_health_server(addr: SocketAddr, state: HealthState) {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                async move { health_handler(req, state).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "Health endpoint started; GET /health/cluster");

    if let Err(e) = server.await {
        error!(error = %e, "Health server error");
    }
}
