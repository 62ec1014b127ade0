//! HTTP request handler for the proxy

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::response::{
    bad_request_response, blocked_response, empty_response, error_response,
    proxy_auth_required_response, ProxyBody,
};
use crate::filter::{Authorizer, RequestInfo, Verdict};

/// Where a proxied request is headed, in the forms the rules match against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// Authority as sent, may include a port
    pub host: String,
    pub path: String,
    pub url: String,
}

impl RequestTarget {
    /// Derive the target from an absolute-form, authority-form or origin-form request
    pub fn from_request<B>(req: &Request<B>) -> Option<Self> {
        let uri = req.uri();
        // Userinfo never takes part in matching or dialing
        let host = match uri.authority() {
            Some(authority) => match authority.port_u16() {
                Some(port) => format!("{}:{}", authority.host(), port),
                None => authority.host().to_string(),
            },
            None => req.headers().get(HOST)?.to_str().ok()?.to_string(),
        };
        if host.is_empty() {
            return None;
        }

        let pq = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let url = if req.method() == Method::CONNECT {
            host.clone()
        } else {
            let scheme = uri.scheme_str().unwrap_or("http");
            format!("{}://{}{}", scheme, host, pq)
        };

        Some(Self {
            host,
            path: uri.path().to_string(),
            url,
        })
    }

    /// Host and port to dial, defaulting the port for the request kind
    fn upstream(&self, default_port: u16) -> (String, u16) {
        let authority = self.host.as_str();
        if let Some(rest) = authority.strip_prefix('[') {
            if let Some((ip, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(default_port);
                return (ip.to_string(), port);
            }
        }
        match authority.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (authority.to_string(), default_port),
            },
            None => (authority.to_string(), default_port),
        }
    }
}

/// Main proxy request handler
#[derive(Clone)]
pub struct ProxyHandler {
    authorizer: Arc<Authorizer>,
    client_addr: Option<SocketAddr>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ProxyHandler {
    pub fn new(authorizer: Arc<Authorizer>) -> Self {
        Self {
            authorizer,
            client_addr: None,
            shutdown: None,
        }
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Tunnels opened by this handler close when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn authorize(&self, req: &Request<Incoming>, target: &RequestTarget) -> Verdict {
        let client_ip = self.client_addr.map(|addr| addr.ip().to_string());
        let proxy_authorization = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let mut info = RequestInfo::new(&target.host, &target.path, &target.url)
            .with_proxy_authorization(proxy_authorization);
        if let Some(ref ip) = client_ip {
            info = info.with_client_ip(ip);
        }
        self.authorizer.authorize(&info)
    }

    /// Handle an incoming proxy request
    pub async fn handle(
        self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let method = req.method().to_string();

        let Some(target) = RequestTarget::from_request(&req) else {
            tracing::debug!(method = %method, uri = %req.uri(), "Request without a target host");
            return Ok(bad_request_response("missing host"));
        };

        match self.authorize(&req, &target) {
            Verdict::Challenge => {
                tracing::debug!(method = %method, url = %target.url, "Bypass password required");
                return Ok(proxy_auth_required_response());
            }
            Verdict::Blocked => {
                tracing::info!(method = %method, url = %target.url, "BLOCKED");
                return Ok(blocked_response(&method, &target.url));
            }
            Verdict::Allowed | Verdict::NoMatch => {
                tracing::debug!(method = %method, url = %target.url, "ALLOWED");
            }
        }

        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req, &target).await);
        }

        let (host, port) = target.upstream(80);
        match forward_http_request(&host, port, req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                tracing::error!(host = %host, port = %port, error = %e, "HTTP forwarding error");
                Ok(error_response(&e.to_string()))
            }
        }
    }

    async fn handle_connect(self, req: Request<Incoming>, target: &RequestTarget) -> Response<ProxyBody> {
        let (host, port) = target.upstream(443);
        tracing::debug!(host = %host, port = %port, "CONNECT request");

        let upstream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(host = %host, port = %port, error = %e, "CONNECT upstream failed");
                return error_response(&e.to_string());
            }
        };

        // Get the upgrade future before the request is consumed
        let upgrade = hyper::upgrade::on(req);
        let mut shutdown = self.shutdown;

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::error!(host = %host, error = %e, "Failed to upgrade connection");
                    return;
                }
            };

            let mut client = TokioIo::new(upgraded);
            let mut upstream = upstream;
            let tunnel = tokio::io::copy_bidirectional(&mut client, &mut upstream);

            let result = match shutdown.as_mut() {
                Some(shutdown) => tokio::select! {
                    result = tunnel => result,
                    _ = shutdown.changed() => {
                        tracing::debug!(host = %host, "Closing tunnel on shutdown");
                        return;
                    }
                },
                None => tunnel.await,
            };

            match result {
                Ok((sent, received)) => {
                    tracing::debug!(host = %host, sent, received, "Tunnel closed");
                }
                Err(e) => {
                    tracing::debug!(host = %host, error = %e, "Tunnel error");
                }
            }
        });

        empty_response(StatusCode::OK)
    }
}

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward a plain HTTP request to the upstream server.
async fn forward_http_request(
    host: &str,
    port: u16,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Box<dyn std::error::Error + Send + Sync>> {
    let tcp = TcpStream::connect((host, port)).await?;
    let io = TokioIo::new(tcp);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "HTTP upstream connection error");
        }
    });

    // Rebuild request: relative URI, strip hop-by-hop headers, ensure Host header
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let new_uri: hyper::Uri = path_and_query.parse()?;

    let mut builder = Request::builder().method(parts.method).uri(new_uri);

    for (name, value) in &parts.headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    if !parts.headers.contains_key(HOST) {
        if port == 80 {
            builder = builder.header(HOST, host);
        } else {
            builder = builder.header(HOST, format!("{}:{}", host, port));
        }
    }

    let upstream_req = builder.body(body)?;
    let resp = sender.send_request(upstream_req).await?;

    Ok(resp.map(|b| b.boxed()))
}
