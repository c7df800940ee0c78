//! Basic SOCKS5 server example

use socksgate::{ServerConfig, Socks5Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = Socks5Server::new(ServerConfig::new(1080));
    println!("Starting SOCKS5 server on 127.0.0.1:1080");

    server.run_until(tokio::signal::ctrl_c()).await?;
    Ok(())
}
