use anyhow::{Context, Result, anyhow};
use clap::Parser;
use socksgate::{AllowList, Credentials, Dialer, ServerConfig, Socks5Server, UserPass};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "A small SOCKS5 CONNECT proxy", long_about = None)]
struct Args {
    /// Listener IP: 127.0.0.1 for local use, 0.0.0.0 for all interfaces
    #[arg(short, long, env = "SOCKSGATE_LISTEN_IP", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    listen_ip: IpAddr,

    /// Listener port
    #[arg(short, long, env = "PROXY_SERVER_PORT")]
    port: u16,

    /// Accepted credentials as user:pass; enables username/password auth
    #[arg(short, long = "user", env = "SOCKSGATE_USERS", value_delimiter = ',')]
    users: Vec<UserPass>,

    /// Source addresses allowed to connect; everyone else is dropped
    #[arg(short, long = "allow-ip", env = "SOCKSGATE_ALLOW_IPS", value_delimiter = ',')]
    allow_ips: Vec<String>,

    /// Seconds allowed for negotiation and request (0 disables)
    #[arg(long, env = "SOCKSGATE_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    handshake_timeout: u64,

    /// Seconds allowed to reach the target (0 disables)
    #[arg(long, env = "SOCKSGATE_CONNECT_TIMEOUT", default_value_t = 10)]
    connect_timeout: u64,

    /// Maximum concurrent sessions (unbounded when omitted)
    #[arg(long, env = "SOCKSGATE_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Ignore ALL_PROXY and always dial targets directly
    #[arg(long)]
    direct: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!(e))?;

    let credentials =
        Credentials::from_entries(args.users).context("invalid --user configuration")?;
    if !credentials.is_empty() {
        info!(users = credentials.len(), "Authentication enabled");
    }

    let allow_list = AllowList::parse(&args.allow_ips).context("invalid --allow-ip entry")?;
    if !allow_list.is_empty() {
        info!(addresses = allow_list.len(), "Source allow-list enabled");
    }

    let dialer = if args.direct {
        Dialer::Direct
    } else {
        Dialer::from_env()
    };
    if let Dialer::Upstream(upstream) = &dialer {
        info!(upstream = %upstream.addr, "Chaining outbound connections through upstream proxy");
    }

    if args.listen_ip.is_unspecified() && credentials.is_empty() && allow_list.is_empty() {
        warn!("listening on all interfaces without authentication or allow-list");
    }

    let config = ServerConfig::new(args.port)
        .with_bind_ip(args.listen_ip)
        .with_credentials(credentials)
        .with_allow_list(allow_list)
        .with_dialer(dialer)
        .with_handshake_timeout(seconds(args.handshake_timeout))
        .with_connect_timeout(seconds(args.connect_timeout))
        .with_max_connections(args.max_connections);

    // Instantiate server
    let mut server = Socks5Server::new(config);

    // Bind first so an unavailable port aborts startup with a clear error
    server.bind().await.context("failed to start SOCKS5 proxy")?;

    // Run it until Ctrl-C or SIGTERM
    server.run_until(shutdown_signal()).await?;

    info!("SOCKS5 proxy stopped");
    Ok(())
}

/// seconds turns a CLI value into an optional deadline, 0 meaning none
fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// shutdown_signal resolves on the first interrupt or terminate signal
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => info!("received interrupt signal"),
        _ = terminate() => info!("received terminate signal"),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
