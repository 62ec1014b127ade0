//! pc-proxy - A parental control HTTP/HTTPS proxy
//!
//! Requests are matched against an ordered list of allow/block rules. Block
//! rules may let a client through after it supplies a bypass password via a
//! `407 Proxy Authentication Required` challenge; granted bypasses are
//! remembered per client and pattern for a limited time.
//!
//! # Example
//!
//! ```no_run
//! use pc_proxy::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     let mut server = ProxyServer::new(config);
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     for e in server.stop().await {
//!         eprintln!("shutdown error: {}", e);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod proxy;
pub mod reload;
pub mod tls;

pub use config::Config;
pub use error::{Error, Result};
pub use filter::{Authorizer, BypassCache, BypassSecret, RequestInfo, RuleEngine, Verdict};
pub use proxy::{ProxyServer, ServerState};
pub use tls::TlsMaterial;
