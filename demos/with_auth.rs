//! SOCKS5 server with username/password authentication and a source allow-list

use socksgate::{AllowList, Credentials, ServerConfig, Socks5Server, UserPass};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let credentials = Credentials::from_entries([
        UserPass {
            username: "<user>".to_string(),
            password: "<pass>".to_string(),
        },
        "<other-user>:<other-pass>".parse::<UserPass>()?,
    ])?;
    let allow_list = AllowList::parse(["127.0.0.1", "::1"])?;

    let config = ServerConfig::new(1080)
        .with_credentials(credentials)
        .with_allow_list(allow_list);

    Socks5Server::new(config).run().await?;
    Ok(())
}
