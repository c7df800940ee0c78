//! A small SOCKS5 CONNECT proxy
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT
//!     - No Authentication or Username/Password Authentication, chosen by configuration
//!     - Source IP allow-list checked before the handshake
//!     - Failure replies carrying the real dial error instead of a blanket success
//!     - Handshake and connect deadlines
//!     - Optional cap on concurrent sessions
//!     - Outbound chaining through an upstream SOCKS5 proxy from `ALL_PROXY`
//!     - Graceful shutdown that closes in-flight sessions
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksgate::{ServerConfig, Socks5Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Socks5Server::new(ServerConfig::new(1080));
//!     server.run_until(tokio::signal::ctrl_c()).await?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod address;
pub mod auth;
pub mod commands;
pub mod config;
pub mod dial;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;

// Re-export main types at crate root for convenience
pub use access::AllowList;
pub use address::TargetAddr;
pub use auth::{AuthMode, Credentials, UserPass};
pub use config::ServerConfig;
pub use dial::{Dialer, UpstreamProxy};
pub use error::ProxyError;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::Socks5Server;
