//! taskvault: a small, strongly-consistent, replicated key-value store.
//!
//! A cluster of peer server nodes ("agents") linearizes writes through a
//! Raft-replicated log (`openraft`) and discovers membership through an
//! encrypted gossip layer. The leader mirrors gossip membership into the
//! Raft voter configuration automatically. Client gRPC traffic and the Raft
//! stream protocol share one multiplexed TCP port.

pub mod agent;
pub mod command;
pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod membership;
pub mod raft;
pub mod reconcile;
pub mod storage;
pub mod store;
pub mod transport;
