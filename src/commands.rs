use crate::address::{TargetAddr, read_request};
use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};
use crate::protocol::{ReplyCode, reply_bytes};
use crate::relay::{RelayStats, relay};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info};

/// Connect holds both legs of an established CONNECT session
pub struct Connect {
    pub inbound: TcpStream,
    pub outbound: TcpStream,
    pub target: TargetAddr,
}

/// Connect implementation block
impl Connect {
    /// Connect run method: relays until either side closes, then drops both
    pub async fn run(self) -> RelayStats {
        let target = self.target;
        let stats = relay(self.inbound, self.outbound).await;

        info!(
            target = %target,
            from_client = stats.client_to_target,
            from_server = stats.target_to_client,
            closed_by = ?stats.closed_by,
            "connection closed"
        );

        stats
    }
}

/// read_connect_request reads the client's request and returns the CONNECT
/// target
///
/// Commands and address types the server cannot serve get their RFC 1928
/// reply before the error is returned, as does an unusable domain name
/// (general failure). Truncated frames are dropped without a reply.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_request(stream).await {
        Ok(target) => Ok(target),
        Err(
            e @ (ProxyError::UnsupportedCommand(_)
            | ProxyError::UnsupportedAddressType(_)
            | ProxyError::InvalidDomain),
        ) => {
            send_reply(stream, e.reply_code()).await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// handle_connect_cmd dials the target and tells the client how it went;
/// the success reply is only sent once the outbound stream is open
pub async fn handle_connect_cmd<S>(
    stream: &mut S,
    target: &TargetAddr,
    config: &ServerConfig,
) -> Result<TcpStream>
where
    S: AsyncWrite + Unpin,
{
    match config.dialer.connect(target, config.connect_timeout).await {
        Ok(outbound) => {
            // Send OK reply
            send_reply(stream, ReplyCode::Succeeded).await?;
            debug!(target = %target, "target connected");

            // Return outbound stream
            Ok(outbound)
        }
        Err(e) => {
            send_reply(stream, e.reply_code()).await?;
            Err(e)
        }
    }
}

/// send_reply writes a SOCKS5 reply with the placeholder bound address
async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply_bytes(reply_code)).await?;
    Ok(())
}
