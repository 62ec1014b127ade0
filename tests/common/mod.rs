//! Test infrastructure for end-to-end proxy tests.
#![allow(dead_code)]

use pc_proxy::config::RuleConfig;
use pc_proxy::{Config, ProxyServer};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

// ---------------------------------------------------------------------------
// Bypass secrets
// ---------------------------------------------------------------------------

static SECRET_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Set a bypass password in a fresh environment variable and return its name,
/// so concurrently running tests never share a secret.
pub fn secret_env(password: Option<&str>) -> String {
    let n = SECRET_COUNTER.fetch_add(1, Ordering::SeqCst);
    let var = format!("PC_PROXY_TEST_SECRET_{}_{}", std::process::id(), n);
    match password {
        Some(password) => std::env::set_var(&var, password),
        None => std::env::remove_var(&var),
    }
    var
}

// ---------------------------------------------------------------------------
// Rule helpers
// ---------------------------------------------------------------------------

pub fn rule(access: &str, rule_type: &str, pattern: &str) -> RuleConfig {
    RuleConfig {
        access: Some(access.to_string()),
        rule_type: Some(rule_type.to_string()),
        pattern: Some(pattern.to_string()),
        password_bypass: Some(false),
    }
}

pub fn bypass_rule(rule_type: &str, pattern: &str) -> RuleConfig {
    RuleConfig {
        password_bypass: Some(true),
        ..rule("block", rule_type, pattern)
    }
}

/// Config on ephemeral loopback ports with the given rules
pub fn config_with_rules(rules: Vec<RuleConfig>) -> Config {
    let mut config = Config::minimal("127.0.0.1", 0);
    config.listen.tls_port = 0;
    config.rules = rules;
    config
}

// ---------------------------------------------------------------------------
// TestProxy
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub server: ProxyServer,
}

impl TestProxy {
    /// Start a proxy for `config` reading its bypass password from `secret_var`
    pub async fn start(config: Config, secret_var: &str) -> Self {
        Self::start_server(ProxyServer::new(config).with_secret_env(secret_var)).await
    }

    pub async fn start_server(mut server: ProxyServer) -> Self {
        server.start().await.unwrap();
        Self { server }
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.server.http_addr().unwrap()
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.server.https_addr().unwrap()
    }

    pub async fn stop(mut self) -> Vec<pc_proxy::Error> {
        self.server.stop().await
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// reqwest client sending every request through the proxy
pub fn proxy_client(proxy_addr: SocketAddr) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr)).unwrap();
    reqwest::Client::builder().proxy(proxy).build().unwrap()
}

/// reqwest client that sends `Proxy-Authorization: Basic` with `password`
pub fn proxy_client_with_password(proxy_addr: SocketAddr, password: &str) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{}", proxy_addr))
        .unwrap()
        .basic_auth("kid", password);
    reqwest::Client::builder().proxy(proxy).build().unwrap()
}

/// Send a raw request on `stream` and read until the server closes it
pub async fn raw_exchange<S>(stream: &mut S, request: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .expect("response timed out")
        .unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

/// Read a response head (up to the blank line) without waiting for EOF
pub async fn read_head<S>(stream: &mut S) -> String
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut byte))
            .await
            .expect("response head timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

/// A plain absolute-form GET with `Connection: close`
pub fn absolute_get(target: SocketAddr, path: &str) -> String {
    format!(
        "GET http://{target}{path} HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n"
    )
}

// ---------------------------------------------------------------------------
// TestCert: self-signed server certificate on disk
// ---------------------------------------------------------------------------

pub struct TestCert {
    pub dir: TempDir,
    pub cert_path: String,
    pub key_path: String,
    pub cert_der: CertificateDer<'static>,
}

impl TestCert {
    pub fn generate() -> Self {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, ck.cert.pem()).unwrap();
        std::fs::write(&key_path, ck.key_pair.serialize_pem()).unwrap();

        Self {
            cert_der: ck.cert.der().clone(),
            cert_path: cert_path.to_str().unwrap().to_string(),
            key_path: key_path.to_str().unwrap().to_string(),
            dir,
        }
    }

    /// Enable TLS in `config` with this certificate
    pub fn enable_in(&self, config: &mut Config) {
        config.tls.enabled = true;
        config.tls.cert = Some(self.cert_path.clone());
        config.tls.key = Some(self.key_path.clone());
    }

    /// Client config trusting only this certificate
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Arc::new(config)
    }
}

/// Open a TLS connection to the proxy's HTTPS listener
pub async fn connect_tls(
    addr: SocketAddr,
    client_config: Arc<ClientConfig>,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let connector = TlsConnector::from(client_config);
    let name = ServerName::try_from("localhost").unwrap();
    connector.connect(name, tcp).await.unwrap()
}
