//! HTTP/HTTPS proxy listeners and request handling

mod handler;
pub mod response;
mod server;

pub use handler::{ProxyHandler, RequestTarget};
pub use server::{ProxyServer, ServerState, DEFAULT_SHUTDOWN_TIMEOUT};
