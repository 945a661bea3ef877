//! Agent configuration.
//!
//! Built from CLI flags in `main.rs`; everything has a default so the struct
//! is always constructable in tests. Validation catches the startup-fatal
//! cases early: a malformed encryption key, an unknown timing profile, an
//! empty node name.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};

pub const DEFAULT_GOSSIP_PORT: u16 = 8946;
pub const DEFAULT_RPC_PORT: u16 = 6868;
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Gossip timing profile. Selects probe interval and failure timeout
/// constants appropriate for the deployment's network distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Lan,
    Wan,
    Local,
}

impl Profile {
    /// How often the gossip pump runs a round.
    pub fn gossip_interval(&self) -> Duration {
        match self {
            Profile::Local => Duration::from_millis(250),
            Profile::Lan => Duration::from_millis(500),
            Profile::Wan => Duration::from_millis(1500),
        }
    }

    /// How long a member's heartbeat may stall before it is marked failed.
    pub fn failure_timeout(&self) -> Duration {
        match self {
            Profile::Local => Duration::from_secs(2),
            Profile::Lan => Duration::from_secs(5),
            Profile::Wan => Duration::from_secs(15),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Lan => "lan",
            Profile::Wan => "wan",
            Profile::Local => "local",
        }
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lan" => Ok(Profile::Lan),
            "wan" => Ok(Profile::Wan),
            "local" => Ok(Profile::Local),
            other => Err(Error::Config(format!(
                "unknown profile '{other}': use 'lan', 'wan', or 'local'"
            ))),
        }
    }
}

/// Parse a human duration: `10s`, `5m`, `2h`, `1d`, or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("duration cannot be empty".to_string()));
    }

    let (value_str, multiplier) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 60 * 60),
        Some('d') => (&s[..s.len() - 1], 24 * 60 * 60),
        Some(c) if c.is_ascii_digit() => (s, 1),
        Some(c) => {
            return Err(Error::Config(format!(
                "unknown duration unit '{c}': use 's', 'm', 'h', or 'd'"
            )))
        }
        None => unreachable!(),
    };

    let value: u64 = value_str
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration value '{value_str}'")))?;
    Ok(Duration::from_secs(value * multiplier))
}

/// Everything an agent needs to start. One instance per process, immutable
/// after startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Logical cluster identifier. A gossip member counts as a server only
    /// when its `role` tag equals this value.
    pub cluster: String,

    /// Stable node identity; also the Raft server ID.
    pub node_name: String,

    /// Address to bind the gossip and RPC listeners to.
    pub bind_addr: IpAddr,

    /// Address advertised to peers. Defaults to `bind_addr`.
    pub advertise_addr: Option<IpAddr>,

    pub gossip_port: u16,

    /// The multiplexed TCP port carrying both gRPC and the Raft stream.
    pub rpc_port: u16,
    pub advertise_rpc_port: Option<u16>,

    /// Admin/health HTTP listener.
    pub http_addr: String,

    /// Durable state directory. Required unless `dev` is set.
    pub data_dir: Option<PathBuf>,

    /// In-memory stores and a discard snapshot sink. Tests and demos only.
    pub dev: bool,

    pub bootstrap: bool,
    pub bootstrap_expect: usize,

    pub start_join: Vec<String>,
    pub retry_join: Vec<String>,
    pub retry_interval: Duration,

    /// Base64-encoded 32-byte gossip encryption key.
    pub encrypt: Option<String>,

    pub profile: Profile,

    /// How long failed/left members linger before being reaped.
    pub reconnect_timeout: Duration,

    /// Reconciler full-sweep period.
    pub refresh_interval: Duration,

    /// Skip re-adding self while the configuration has fewer servers than this.
    pub self_join_threshold: usize,

    /// Multiplier applied to the Raft library's default heartbeat/election
    /// timeouts.
    pub raft_multiplier: u64,

    /// Extra gossip tags advertised alongside the reserved ones.
    pub tags: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster: "taskvault".to_string(),
            node_name: hostname(),
            bind_addr: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            advertise_addr: None,
            gossip_port: DEFAULT_GOSSIP_PORT,
            rpc_port: DEFAULT_RPC_PORT,
            advertise_rpc_port: None,
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            data_dir: None,
            dev: false,
            bootstrap: false,
            bootstrap_expect: 0,
            start_join: Vec::new(),
            retry_join: Vec::new(),
            retry_interval: Duration::from_secs(30),
            encrypt: None,
            profile: Profile::Lan,
            reconnect_timeout: Duration::from_secs(24 * 60 * 60),
            refresh_interval: Duration::from_secs(30),
            self_join_threshold: 3,
            raft_multiplier: 1,
            tags: HashMap::new(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "taskvault-node".to_string())
}

impl AgentConfig {
    /// Gossip bind address.
    pub fn gossip_bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.gossip_port)
    }

    /// Gossip address advertised to peers.
    pub fn gossip_advertise(&self) -> SocketAddr {
        SocketAddr::new(
            self.advertise_addr.unwrap_or(self.bind_addr),
            self.gossip_port,
        )
    }

    /// Multiplexed RPC bind address.
    pub fn rpc_bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.rpc_port)
    }

    /// The `host:port` peers should dial for Raft and gRPC traffic.
    pub fn rpc_advertise(&self) -> String {
        let host = self.advertise_addr.unwrap_or(self.bind_addr);
        let port = self.advertise_rpc_port.unwrap_or(self.rpc_port);
        format!("{host}:{port}")
    }

    /// Whether this node forms a single-server cluster on first start.
    pub fn bootstraps_alone(&self) -> bool {
        self.bootstrap || self.bootstrap_expect == 1
    }

    /// Decode the gossip encryption key. A present-but-malformed key is
    /// startup-fatal; absence means unencrypted gossip.
    pub fn encryption_key(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = &self.encrypt else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::EncryptionKey(format!("not valid base64: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::EncryptionKey(format!("key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Some(key))
    }

    /// Startup validation. Every failure here aborts the process.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::Config("node name cannot be empty".to_string()));
        }
        if self.cluster.trim().is_empty() {
            return Err(Error::Config("cluster name cannot be empty".to_string()));
        }
        if !self.dev && self.data_dir.is_none() {
            return Err(Error::Config(
                "--data-dir is required unless --dev is set".to_string(),
            ));
        }
        if self.raft_multiplier == 0 {
            return Err(Error::Config(
                "raft multiplier must be at least 1".to_string(),
            ));
        }
        if self.self_join_threshold == 0 {
            return Err(Error::Config(
                "self-join threshold must be at least 1".to_string(),
            ));
        }
        // Fail on a malformed key now rather than at the first gossip packet.
        self.encryption_key()?;
        Ok(())
    }

    /// A loopback, in-memory config on ephemeral ports, for tests.
    pub fn for_testing(name: &str) -> Self {
        Self {
            node_name: name.to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            gossip_port: 0,
            rpc_port: 0,
            http_addr: "127.0.0.1:0".to_string(),
            dev: true,
            profile: Profile::Local,
            refresh_interval: Duration::from_millis(200),
            retry_interval: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn profile_from_str() {
        assert_eq!("lan".parse::<Profile>().unwrap(), Profile::Lan);
        assert_eq!("WAN".parse::<Profile>().unwrap(), Profile::Wan);
        assert_eq!("local".parse::<Profile>().unwrap(), Profile::Local);
        assert!("metro".parse::<Profile>().is_err());
    }

    #[test]
    fn encryption_key_roundtrip() {
        let mut cfg = AgentConfig::for_testing("n1");
        cfg.encrypt = Some(BASE64.encode([7u8; 32]));
        assert_eq!(cfg.encryption_key().unwrap(), Some([7u8; 32]));
    }

    #[test]
    fn malformed_encryption_key_is_fatal() {
        let mut cfg = AgentConfig::for_testing("n1");
        cfg.encrypt = Some("not-base64!!!".to_string());
        assert!(matches!(cfg.validate(), Err(Error::EncryptionKey(_))));

        cfg.encrypt = Some(BASE64.encode([1u8; 16]));
        assert!(matches!(cfg.validate(), Err(Error::EncryptionKey(_))));
    }

    #[test]
    fn data_dir_required_outside_dev_mode() {
        let mut cfg = AgentConfig::for_testing("n1");
        cfg.dev = false;
        assert!(cfg.validate().is_err());

        cfg.data_dir = Some(PathBuf::from("/tmp/taskvault"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rpc_advertise_prefers_advertise_addr_and_port() {
        let mut cfg = AgentConfig::for_testing("n1");
        cfg.bind_addr = "0.0.0.0".parse().unwrap();
        cfg.advertise_addr = Some("10.1.2.3".parse().unwrap());
        cfg.rpc_port = 6868;
        cfg.advertise_rpc_port = Some(7878);
        assert_eq!(cfg.rpc_advertise(), "10.1.2.3:7878");
    }

    #[test]
    fn bootstraps_alone_matches_flag_or_expect_one() {
        let mut cfg = AgentConfig::for_testing("n1");
        assert!(!cfg.bootstraps_alone());
        cfg.bootstrap_expect = 1;
        assert!(cfg.bootstraps_alone());
        cfg.bootstrap_expect = 0;
        cfg.bootstrap = true;
        assert!(cfg.bootstraps_alone());
    }
}
