//! Error types shared across the agent.
//!
//! Startup-fatal conditions (bad encryption key, bind failure, unknown
//! profile, raft construction failure) bubble up out of `Agent::start` and
//! turn into a non-zero exit code in `main`. Everything else is transient
//! and handled where it occurs.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid encryption key: {0}")]
    EncryptionKey(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("membership error: {0}")]
    Membership(String),

    /// Returned to submitters of mutating operations on a non-leader node.
    /// Carries the leader's advertised address when one is known.
    #[error("not the leader{}", leader_hint(.leader))]
    NotLeader { leader: Option<String> },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent is shutting down")]
    Shutdown,
}

fn leader_hint(leader: &Option<String>) -> String {
    match leader {
        Some(addr) => format!(" (leader is at {addr})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_includes_hint_when_known() {
        let err = Error::NotLeader {
            leader: Some("10.0.0.1:6868".to_string()),
        };
        assert!(err.to_string().contains("10.0.0.1:6868"));

        let err = Error::NotLeader { leader: None };
        assert_eq!(err.to_string(), "not the leader");
    }
}
