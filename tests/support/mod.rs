#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use socksgate::{ProxyError, ServerConfig, Socks5Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const IO_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// A proxy running on an ephemeral loopback port
pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ProxyError>>,
}

impl ProxyHandle {
    /// stop triggers graceful shutdown and waits for the server to return
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        timeout(IO_TIMEOUT, self.task).await???;
        Ok(())
    }
}

/// spawn_proxy binds the config on port 0 and serves it in the background
pub async fn spawn_proxy(config: ServerConfig) -> Result<ProxyHandle> {
    let mut server = Socks5Server::new(config.with_bind_ip(Ipv4Addr::LOCALHOST.into()));
    let addr = server.bind().await?;

    let (shutdown, signal) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async move {
        let _ = signal.await;
    }));

    Ok(ProxyHandle {
        addr,
        shutdown,
        task,
    })
}

/// spawn_echo_server echoes everything on its first connection and returns
/// the bytes it saw once the peer closes
pub async fn spawn_echo_server() -> Result<(SocketAddr, JoinHandle<Vec<u8>>)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;

    let task = tokio::spawn(async move {
        let mut seen = Vec::new();
        let Ok((mut stream, _)) = listener.accept().await else {
            return seen;
        };
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        seen
    });

    Ok((addr, task))
}

/// spawn_echo_once echoes exactly `len` bytes and then closes its side
pub async fn spawn_echo_once(len: usize) -> Result<(SocketAddr, JoinHandle<Vec<u8>>)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; len];
        if let Ok((mut stream, _)) = listener.accept().await {
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
            }
        }
        buf
    });

    Ok((addr, task))
}

/// closed_port returns a loopback address nothing listens on
pub async fn closed_port() -> Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

pub async fn connect(proxy: SocketAddr) -> Result<TcpStream> {
    Ok(timeout(IO_TIMEOUT, TcpStream::connect(proxy)).await??)
}

/// method_select sends a method negotiation and returns the chosen method
pub async fn method_select(stream: &mut TcpStream, methods: &[u8]) -> Result<u8> {
    let mut hello = vec![0x05, methods.len() as u8];
    hello.extend_from_slice(methods);
    stream.write_all(&hello).await?;

    let mut reply = [0u8; 2];
    timeout(IO_TIMEOUT, stream.read_exact(&mut reply)).await??;
    if reply[0] != 0x05 {
        return Err(anyhow!("unexpected version in method reply: {:#04x}", reply[0]));
    }
    Ok(reply[1])
}

pub async fn handshake_no_auth(stream: &mut TcpStream) -> Result<()> {
    match method_select(stream, &[0x00]).await? {
        0x00 => Ok(()),
        other => Err(anyhow!("server selected {other:#04x}")),
    }
}

/// handshake_userpass negotiates RFC 1929 auth and returns the status byte
pub async fn handshake_userpass(stream: &mut TcpStream, user: &str, pass: &str) -> Result<u8> {
    let method = method_select(stream, &[0x00, 0x02]).await?;
    if method != 0x02 {
        return Err(anyhow!("server selected {method:#04x}"));
    }

    let mut frame = vec![0x01, user.len() as u8];
    frame.extend_from_slice(user.as_bytes());
    frame.push(pass.len() as u8);
    frame.extend_from_slice(pass.as_bytes());
    stream.write_all(&frame).await?;

    let mut status = [0u8; 2];
    timeout(IO_TIMEOUT, stream.read_exact(&mut status)).await??;
    Ok(status[1])
}

/// connect_ipv4 sends a CONNECT for an IPv4 target and returns the reply
pub async fn connect_ipv4(stream: &mut TcpStream, target: SocketAddr) -> Result<[u8; 10]> {
    let SocketAddr::V4(target) = target else {
        return Err(anyhow!("{target} is not IPv4"));
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    send_request(stream, &request).await
}

/// connect_domain sends a CONNECT for a host name and returns the reply
pub async fn connect_domain(stream: &mut TcpStream, host: &str, port: u16) -> Result<[u8; 10]> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    send_request(stream, &request).await
}

pub async fn send_request(stream: &mut TcpStream, request: &[u8]) -> Result<[u8; 10]> {
    stream.write_all(request).await?;
    let mut reply = [0u8; 10];
    timeout(IO_TIMEOUT, stream.read_exact(&mut reply)).await??;
    Ok(reply)
}

/// read_until_closed drains the stream and fails if it stays open
pub async fn read_until_closed(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut rest = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .map_err(|_| anyhow!("connection was not closed"))??;
    Ok(rest)
}
