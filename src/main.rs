use clap::Parser;
use distlog::{AclAuthorizer, Agent, AgentConfig, AllowAll, Authorizer, RaftOptions, SegmentOptions};
use slog::Drain;
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// Runs one node of a replicated commit log.
#[derive(Parser, Debug)]
#[command(name = "distlog")]
#[command(version)]
struct Args {
    /// Unique node name. Defaults to the host name.
    #[arg(long)]
    node_name: Option<String>,

    /// Directory for the commit log and raft state
    #[arg(long, default_value = "/tmp/distlog")]
    data_dir: PathBuf,

    /// Gossip address
    #[arg(long, default_value = "127.0.0.1:8401")]
    bind_addr: SocketAddr,

    /// Port of the shared RPC listener
    #[arg(long, default_value_t = 8400)]
    rpc_port: u16,

    /// Host other nodes dial for RPCs
    #[arg(long)]
    advertise_host: Option<IpAddr>,

    /// Gossip addresses of existing members, comma separated
    #[arg(long, value_delimiter = ',')]
    start_join_addrs: Vec<SocketAddr>,

    /// Start a new cluster with this node as its only voter
    #[arg(long)]
    bootstrap: bool,

    /// ACL policy file with `p, <subject>, <object>, <action>` lines. Everything is allowed without one.
    #[arg(long)]
    acl_policy_file: Option<PathBuf>,

    #[arg(long, requires = "server_tls_key_file")]
    server_tls_cert_file: Option<PathBuf>,

    #[arg(long, requires = "server_tls_cert_file")]
    server_tls_key_file: Option<PathBuf>,

    /// CA used to verify client certificates
    #[arg(long, requires = "server_tls_cert_file")]
    server_tls_ca_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let node_name = match args.node_name.clone() {
        Some(name) => name,
        None => hostname()?,
    };
    let logger = create_root_logger_for_stdout();

    let authorizer: Arc<dyn Authorizer> = match &args.acl_policy_file {
        Some(path) => Arc::new(AclAuthorizer::from_policy_file(path)?),
        None => Arc::new(AllowAll),
    };

    let config = AgentConfig {
        logger: logger.clone(),
        node_name,
        bind_addr: args.bind_addr,
        rpc_port: args.rpc_port,
        advertise_host: args.advertise_host,
        start_join_addrs: args.start_join_addrs.clone(),
        data_dir: args.data_dir.clone(),
        bootstrap: args.bootstrap,
        server_tls: server_tls_config(&args).await?,
        authorizer,
        raft: RaftOptions::default(),
        segment: SegmentOptions::default(),
    };

    let agent = Agent::new(config).await?;
    slog::info!(logger, "Serving RPCs on {:?}", agent.rpc_addr());

    tokio::signal::ctrl_c().await?;
    slog::info!(logger, "Received ctrl-c");
    agent.shutdown().await?;

    Ok(())
}

async fn server_tls_config(args: &Args) -> Result<Option<ServerTlsConfig>, Box<dyn Error>> {
    let (cert_file, key_file) = match (&args.server_tls_cert_file, &args.server_tls_key_file) {
        (Some(cert_file), Some(key_file)) => (cert_file, key_file),
        _ => return Ok(None),
    };

    let cert = tokio::fs::read(cert_file).await?;
    let key = tokio::fs::read(key_file).await?;
    let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
    if let Some(ca_file) = &args.server_tls_ca_file {
        let ca = tokio::fs::read(ca_file).await?;
        tls = tls.client_ca_root(Certificate::from_pem(ca));
    }

    Ok(Some(tls))
}

fn hostname() -> Result<String, Box<dyn Error>> {
    match std::env::var("HOSTNAME") {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => Err("--node-name is required when HOSTNAME isn't set".into()),
    }
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
