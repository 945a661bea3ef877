//! taskvault command line entry point.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use taskvault::agent::Agent;
use taskvault::config::{
    parse_duration, AgentConfig, Profile, DEFAULT_GOSSIP_PORT, DEFAULT_HTTP_ADDR,
    DEFAULT_RPC_PORT,
};
use taskvault::error::{Error, Result};

#[derive(Parser)]
#[command(name = "taskvault", version, about = "Replicated key-value store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster server node.
    Agent(AgentArgs),
}

#[derive(Args)]
struct AgentArgs {
    /// Enable the server role. Required; client-only agents are not supported.
    #[arg(long)]
    server: bool,

    /// Stable node name; defaults to the hostname.
    #[arg(long)]
    node_name: Option<String>,

    /// Logical cluster identifier carried in the gossip role tag.
    #[arg(long, default_value = "taskvault")]
    cluster: String,

    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: IpAddr,

    #[arg(long)]
    advertise_addr: Option<IpAddr>,

    #[arg(long, default_value_t = DEFAULT_GOSSIP_PORT)]
    gossip_port: u16,

    /// Multiplexed TCP port carrying gRPC and the Raft stream.
    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    rpc_port: u16,

    #[arg(long)]
    advertise_rpc_port: Option<u16>,

    /// Admin HTTP listener (health endpoint).
    #[arg(long, default_value = DEFAULT_HTTP_ADDR)]
    http_addr: String,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// In-memory stores; for demos and tests only.
    #[arg(long)]
    dev: bool,

    /// Bootstrap a single-server cluster immediately.
    #[arg(long)]
    bootstrap: bool,

    /// Form the cluster automatically once this many servers are visible.
    #[arg(long, default_value_t = 0)]
    bootstrap_expect: usize,

    /// Seed address to join at startup. Repeatable.
    #[arg(long = "start-join")]
    start_join: Vec<String>,

    /// Seed address to keep retrying until joined. Repeatable.
    #[arg(long = "retry-join")]
    retry_join: Vec<String>,

    /// Backoff between retry-join attempts.
    #[arg(long, default_value = "30s")]
    retry_interval: String,

    /// Base64-encoded 32-byte gossip encryption key.
    #[arg(long)]
    encrypt: Option<String>,

    /// Gossip timing profile: lan, wan, or local.
    #[arg(long, default_value = "lan")]
    profile: String,

    /// How long failed/left members linger before being reaped.
    #[arg(long = "serf-reconnect-timeout", default_value = "24h")]
    serf_reconnect_timeout: String,

    /// Reconciler full-sweep period.
    #[arg(long, default_value = "30s")]
    refresh_interval: String,

    /// Skip self re-add while the configuration has fewer servers than this.
    #[arg(long, default_value_t = 3)]
    self_join_threshold: usize,

    /// Multiplier on the Raft library's default timing.
    #[arg(long, default_value_t = 1)]
    raft_multiplier: u64,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Extra gossip tag, `key=value`. Repeatable.
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

fn parse_tag(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid tag '{s}': expected key=value")),
    }
}

impl AgentArgs {
    fn into_config(self) -> Result<AgentConfig> {
        if !self.server {
            return Err(Error::Config(
                "the agent must run with --server; client-only mode is not supported"
                    .to_string(),
            ));
        }

        let defaults = AgentConfig::default();
        Ok(AgentConfig {
            cluster: self.cluster,
            node_name: self.node_name.unwrap_or(defaults.node_name),
            bind_addr: self.bind_addr,
            advertise_addr: self.advertise_addr,
            gossip_port: self.gossip_port,
            rpc_port: self.rpc_port,
            advertise_rpc_port: self.advertise_rpc_port,
            http_addr: self.http_addr,
            data_dir: self.data_dir,
            dev: self.dev,
            bootstrap: self.bootstrap,
            bootstrap_expect: self.bootstrap_expect,
            start_join: self.start_join,
            retry_join: self.retry_join,
            retry_interval: parse_duration(&self.retry_interval)?,
            encrypt: self.encrypt,
            profile: self.profile.parse::<Profile>()?,
            reconnect_timeout: parse_duration(&self.serf_reconnect_timeout)?,
            refresh_interval: parse_duration(&self.refresh_interval)?,
            self_join_threshold: self.self_join_threshold,
            raft_multiplier: self.raft_multiplier,
            tags: self.tags.into_iter().collect(),
        })
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    init_tracing(&args.log_level);
    let config = args.into_config()?;
    config.validate()?;

    let agent = Agent::start(config).await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Config(format!("failed to install signal handler: {e}")))?;
    info!("Interrupt received; shutting down");
    agent.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(args) => {
            if let Err(e) = run_agent(args).await {
                eprintln!("taskvault: {e}");
                std::process::exit(1);
            }
        }
    }
}
