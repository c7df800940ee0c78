use crate::{
    auth,
    commands::{self, Connect},
    config::ServerConfig,
    error::{ProxyError, Result},
    relay::RelayStats,
};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub config: Arc<ServerConfig>,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            listener: None,
        }
    }

    /// bind to the configured address; a second call returns the bound address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }

        let addr = self.config.bind_addr();

        // Instantiate tokio listener
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(address = %local_addr, "SOCKS5 proxy listening");

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// run serves connections until the listener fails
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// run_until serves connections until `shutdown` completes, then closes
    /// the listener, cancels in-flight sessions and waits for them to finish
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future,
    {
        self.bind().await?;
        let Some(listener) = self.listener.take() else {
            return Err(ProxyError::Config("listener missing after bind".into()));
        };

        let limiter = self.config.max_connections.map(|n| Arc::new(Semaphore::new(n)));
        let sessions = TaskTracker::new();
        let cancel = CancellationToken::new();

        tokio::pin!(shutdown);

        // Listen for connections to proxy
        loop {
            // Wait for a free slot before accepting when admission is capped
            let permit = match &limiter {
                Some(limiter) => tokio::select! {
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = &mut shutdown => break,
                },
                None => None,
            };

            let (inbound, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept incoming connection");
                        sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            // Clone for this connection
            let config = self.config.clone();
            let cancel = cancel.clone();

            // Spawn async task
            sessions.spawn(async move {
                debug!(peer = %peer_addr, "new client");
                tokio::select! {
                    result = handle_connection(inbound, peer_addr, config, permit) => {
                        log_session_end(peer_addr, result);
                    }
                    _ = cancel.cancelled() => {
                        debug!(peer = %peer_addr, "session cancelled by shutdown");
                    }
                }
            });
        }

        info!(in_flight = sessions.len(), "shutting down SOCKS5 proxy");

        // Stop accepting, then close every open session
        drop(listener);
        cancel.cancel();
        sessions.close();
        sessions.wait().await;

        Ok(())
    }
}

/// handle_connection runs one session from the IP check through the relay.
/// Every return path drops the client stream and, once dialed, the target.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    _permit: Option<OwnedSemaphorePermit>,
) -> Result<RelayStats> {
    // Source filtering happens before a single byte is read
    if let Some(allow_list) = &config.allow_list {
        if !allow_list.is_allowed(peer_addr.ip()) {
            return Err(ProxyError::NotAllowed(peer_addr.ip()));
        }
    }

    // Negotiate authentication and read the request under one deadline
    let handshake = async {
        auth::negotiate_auth(&mut stream, &config.auth).await?;
        commands::read_connect_request(&mut stream).await
    };
    let target = match config.handshake_timeout {
        Some(limit) => timeout(limit, handshake)
            .await
            .map_err(|_| ProxyError::Timeout("handshake"))??,
        None => handshake.await?,
    };

    debug!(peer = %peer_addr, target = %target, "CONNECT requested");

    let outbound = commands::handle_connect_cmd(&mut stream, &target, &config).await?;

    if let Err(e) = outbound.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY on outbound stream");
    }

    let connect = Connect {
        inbound: stream,
        outbound,
        target,
    };

    Ok(connect.run().await)
}

/// log_session_end reports how a session finished at a level that matches
/// how interesting the outcome is
fn log_session_end(peer: SocketAddr, result: Result<RelayStats>) {
    match result {
        Ok(_) => {}
        Err(e @ ProxyError::NotAllowed(_)) => warn!(peer = %peer, "blocked: {e}"),
        Err(e @ ProxyError::AuthFailed(_)) => warn!(peer = %peer, "rejected: {e}"),
        Err(
            e @ (ProxyError::Dial { .. }
            | ProxyError::Resolve { .. }
            | ProxyError::Upstream { .. }),
        ) => {
            error!(peer = %peer, "connection error: {e}")
        }
        Err(e) if e.is_eof() => debug!(peer = %peer, "client went away during handshake"),
        Err(e) => info!(peer = %peer, "session rejected: {e}"),
    }
}
