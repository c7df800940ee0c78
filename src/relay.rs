use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-direction copy buffer
const RELAY_BUF_SIZE: usize = 8 * 1024;

/// Side names the end of the relay that finished first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Side {
    #[default]
    Client,
    Target,
}

/// RelayStats summarizes a finished relay
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub closed_by: Side,
}

/// relay copies bytes between the client and target streams in both
/// directions at once
///
/// As soon as either direction sees end-of-stream or an error, the other
/// direction is abandoned, both write sides are shut down and both
/// streams are dropped before this returns.
pub async fn relay<C, T>(client: C, target: T) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let mut stats = RelayStats::default();

    let (closed_by, result) = {
        let upstream = copy_half(
            &mut client_read,
            &mut target_write,
            &mut stats.client_to_target,
        );
        let downstream = copy_half(
            &mut target_read,
            &mut client_write,
            &mut stats.target_to_client,
        );

        tokio::select! {
            result = upstream => (Side::Client, result),
            result = downstream => (Side::Target, result),
        }
    };
    stats.closed_by = closed_by;

    if let Err(e) = result {
        debug!(side = ?closed_by, error = %e, "relay stopped on I/O error");
    }

    // Best effort: the peers may already be gone
    let _ = target_write.shutdown().await;
    let _ = client_write.shutdown().await;

    stats
}

/// copy_half moves bytes from reader to writer until EOF, counting as it goes
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn bytes_cross_and_target_close_ends_relay() {
        let (mut client_app, client_proxy) = duplex(1024);
        let (target_proxy, mut target_app) = duplex(1024);

        let relay_task = tokio::spawn(relay(client_proxy, target_proxy));

        client_app.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target_app.write_all(b"pong").await.unwrap();
        client_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(target_app);

        let stats = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(stats.closed_by, Side::Target);
        assert_eq!(stats.client_to_target, 4);
        assert_eq!(stats.target_to_client, 4);

        // Client side sees EOF once the relay has returned
        let mut rest = Vec::new();
        client_app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn client_close_tears_down_target() {
        let (client_app, client_proxy) = duplex(1024);
        let (target_proxy, mut target_app) = duplex(1024);

        let relay_task = tokio::spawn(relay(client_proxy, target_proxy));
        drop(client_app);

        let stats = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(stats.closed_by, Side::Client);

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), target_app.read_to_end(&mut rest))
            .await
            .expect("target not closed")
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn large_payload_is_copied_in_chunks() {
        let (mut client_app, client_proxy) = duplex(4096);
        let (target_proxy, mut target_app) = duplex(4096);

        let relay_task = tokio::spawn(relay(client_proxy, target_proxy));

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_app.write_all(&payload).await.unwrap();
            client_app
        });

        let mut received = vec![0u8; expected.len()];
        target_app.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.client_to_target, expected.len() as u64);
    }
}
