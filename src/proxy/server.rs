//! Main proxy server: listener lifecycle, shutdown and live reconfiguration

use arc_swap::ArcSwap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use super::handler::ProxyHandler;
use crate::config::{Config, BYPASS_PASSWORD_ENV};
use crate::error::{Error, Result};
use crate::filter::bypass::DEFAULT_DECAY_INTERVAL;
use crate::filter::{Authorizer, BypassCache, BypassSecret, RuleEngine};
use crate::tls::{self, TlsMaterial};

/// How long `stop()` waits for each listener to drain
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

/// Lifecycle of a [`ProxyServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Started,
    Stopped,
    Failed,
}

/// A running serve loop
struct Listener {
    name: &'static str,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// The main proxy server.
///
/// Serves plain HTTP always and HTTPS when `tls.enabled` is set. Both listeners
/// share one [`Authorizer`], so a reload is seen by every connection at once.
pub struct ProxyServer {
    config: Config,
    authorizer: Arc<Authorizer>,
    secret_env: String,
    decay_interval: Duration,
    shutdown_timeout: Duration,
    state: ServerState,
    tls: Option<Arc<ArcSwap<ServerConfig>>>,
    tls_ciphers: Vec<String>,
    shutdown_tx: watch::Sender<bool>,
    http: Option<Listener>,
    https: Option<Listener>,
    decay: Option<JoinHandle<()>>,
}

impl ProxyServer {
    /// Create a server from configuration. The bypass secret is read from
    /// `BYPASS_PASSWORD`.
    pub fn new(config: Config) -> Self {
        let engine = RuleEngine::from_config(&config.rules);
        let secret = BypassSecret::from_env(BYPASS_PASSWORD_ENV);
        tracing::info!(
            rules = engine.rule_count(),
            bypass_password = secret.is_set(),
            "Rule engine initialized"
        );

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            authorizer: Arc::new(Authorizer::new(engine, secret)),
            secret_env: BYPASS_PASSWORD_ENV.to_string(),
            decay_interval: DEFAULT_DECAY_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state: ServerState::Created,
            tls: None,
            tls_ciphers: Vec::new(),
            shutdown_tx,
            http: None,
            https: None,
            decay: None,
        }
    }

    /// Read the bypass secret from `var` instead of `BYPASS_PASSWORD`
    pub fn with_secret_env(mut self, var: impl Into<String>) -> Self {
        self.secret_env = var.into();
        let policy = self.authorizer.policy();
        self.authorizer = Arc::new(Authorizer::with_cache(
            policy.engine.clone(),
            BypassSecret::from_env(&self.secret_env),
            self.authorizer.bypass_cache().clone(),
        ));
        self
    }

    /// How long a granted bypass lasts
    pub fn with_bypass_duration(mut self, duration: Duration) -> Self {
        let policy = self.authorizer.policy();
        self.authorizer = Arc::new(Authorizer::with_cache(
            policy.engine.clone(),
            policy.secret.clone(),
            Arc::new(BypassCache::new(duration)),
        ));
        self
    }

    /// How often the bypass cache is decayed
    pub fn with_decay_interval(mut self, interval: Duration) -> Self {
        self.decay_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Provision TLS, bind the listeners and start serving.
    ///
    /// Any failure leaves the server in [`ServerState::Failed`].
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ServerState::Created {
            return Err(Error::state(format!(
                "cannot start a server in state {:?}",
                self.state
            )));
        }

        match self.start_listeners().await {
            Ok(()) => {
                self.state = ServerState::Started;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Proxy failed to start");
                let _ = self.shutdown_tx.send(true);
                for listener in [self.http.take(), self.https.take()].into_iter().flatten() {
                    listener.task.abort();
                }
                self.state = ServerState::Failed;
                Err(e)
            }
        }
    }

    async fn start_listeners(&mut self) -> Result<()> {
        let material = if self.config.tls.enabled {
            Some(self.provision_tls(&self.config)?)
        } else {
            None
        };

        let http_listener = bind(&self.config.listen.http_address()).await?;
        let https_listener = match material {
            Some(_) => Some(bind(&self.config.listen.https_address()).await?),
            None => None,
        };

        let http = self.spawn_listener("http", http_listener, None)?;
        tracing::info!(address = %http.addr, "HTTP proxy listening");
        self.http = Some(http);

        if let (Some(listener), Some(material)) = (https_listener, material) {
            let acceptor = Arc::new(ArcSwap::new(material.config));
            let https = self.spawn_listener("https", listener, Some(acceptor.clone()))?;
            tracing::info!(address = %https.addr, "HTTPS proxy listening");
            self.https = Some(https);
            self.tls = Some(acceptor);
            self.tls_ciphers = material.ciphers;
        }

        self.decay = Some(self.authorizer.spawn_decay(self.decay_interval));
        Ok(())
    }

    fn provision_tls(&self, config: &Config) -> Result<TlsMaterial> {
        let cert = config.tls.cert.as_deref().unwrap_or_default();
        let key = config.tls.key.as_deref().unwrap_or_default();
        let material = tls::provision(cert, key, &config.tls.ciphers)?;
        tracing::info!(
            cert = %cert,
            ciphers = material.ciphers.len(),
            insecure = material.insecure.len(),
            "TLS certificate loaded"
        );
        Ok(material)
    }

    fn spawn_listener(
        &self,
        name: &'static str,
        listener: TcpListener,
        tls: Option<Arc<ArcSwap<ServerConfig>>>,
    ) -> Result<Listener> {
        let addr = listener
            .local_addr()
            .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;
        let task = tokio::spawn(serve(
            name,
            listener,
            self.authorizer.clone(),
            tls,
            self.shutdown_tx.subscribe(),
        ));
        Ok(Listener { name, addr, task })
    }

    /// Signal both listeners to stop and wait for them to drain.
    ///
    /// Each listener gets `shutdown_timeout`; one that exceeds it is aborted and
    /// reported. The returned list is empty on a clean shutdown.
    pub async fn stop(&mut self) -> Vec<Error> {
        if self.state != ServerState::Started {
            return vec![Error::state(format!(
                "cannot stop a server in state {:?}",
                self.state
            ))];
        }

        tracing::info!("Stopping proxy");
        let _ = self.shutdown_tx.send(true);
        if let Some(decay) = self.decay.take() {
            decay.abort();
        }

        let timeout = self.shutdown_timeout;
        let (http, https) = tokio::join!(
            await_listener(self.http.take(), timeout),
            await_listener(self.https.take(), timeout),
        );

        self.state = ServerState::Stopped;
        let errors: Vec<Error> = [http, https].into_iter().flatten().collect();
        if errors.is_empty() {
            tracing::info!("Proxy stopped");
        }
        errors
    }

    /// Apply a new configuration to a created or running server.
    ///
    /// Rules and the bypass secret (re-read from the environment) are swapped
    /// together. A running HTTPS listener gets the new certificate and ciphers.
    /// Listen address changes only take effect after a restart. Applying the
    /// same configuration twice has no further effect.
    pub fn apply_config(&mut self, config: &Config) -> Result<()> {
        if config.listen != self.config.listen {
            tracing::warn!(
                old = %self.config.listen.http_address(),
                new = %config.listen.http_address(),
                "listen address changed but requires restart to take effect"
            );
        }

        let engine = RuleEngine::from_config(&config.rules);
        let secret = BypassSecret::from_env(&self.secret_env);
        self.authorizer.replace(engine, secret);

        let mut result = Ok(());
        match (&self.tls, config.tls.enabled) {
            (Some(acceptor), true) => match self.provision_tls(config) {
                Ok(material) => {
                    acceptor.store(material.config);
                    self.tls_ciphers = material.ciphers;
                }
                Err(e) => {
                    tracing::error!(error = %e, "TLS reload failed, keeping previous certificate");
                    result = Err(e);
                }
            },
            (Some(_), false) => {
                tracing::warn!("tls.enabled turned off but requires restart to take effect");
            }
            (None, true) if self.state == ServerState::Started => {
                tracing::warn!("tls.enabled turned on but requires restart to take effect");
            }
            _ => {}
        }

        self.config = config.clone();
        result
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    /// Bound address of the HTTP listener, once started
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().map(|l| l.addr)
    }

    /// Bound address of the HTTPS listener, once started with TLS
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().map(|l| l.addr)
    }

    /// Cipher suites enabled on the HTTPS listener
    pub fn tls_ciphers(&self) -> &[String] {
        &self.tls_ciphers
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        for listener in [self.http.take(), self.https.take()].into_iter().flatten() {
            listener.task.abort();
        }
        if let Some(decay) = self.decay.take() {
            decay.abort();
        }
    }
}

async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", address, e)))
}

async fn await_listener(listener: Option<Listener>, timeout: Duration) -> Option<Error> {
    let Listener {
        name, mut task, ..
    } = listener?;

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(Error::proxy(format!("{} serve task failed: {}", name, e))),
        Err(_) => {
            task.abort();
            tracing::error!(listener = name, timeout = ?timeout, "Listener did not drain in time");
            Some(Error::ShutdownTimeout {
                listener: name,
                timeout,
            })
        }
    }
}

/// Accept connections until shutdown, then wait for open connections to finish
async fn serve(
    name: &'static str,
    listener: TcpListener,
    authorizer: Arc<Authorizer>,
    tls: Option<Arc<ArcSwap<ServerConfig>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(listener = name, "Shutdown signal received");
                break;
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(listener = name, error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                tracing::debug!(listener = name, client = %client_addr, "New connection");
                connections.spawn(serve_connection(
                    stream,
                    client_addr,
                    authorizer.clone(),
                    tls.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    authorizer: Arc<Authorizer>,
    tls: Option<Arc<ArcSwap<ServerConfig>>>,
    shutdown: watch::Receiver<bool>,
) {
    match tls {
        Some(tls) => {
            let acceptor = TlsAcceptor::from(tls.load_full());
            match acceptor.accept(stream).await {
                Ok(stream) => serve_http(stream, client_addr, authorizer, shutdown).await,
                Err(e) => {
                    tracing::debug!(client = %client_addr, error = %e, "TLS handshake failed");
                }
            }
        }
        None => serve_http(stream, client_addr, authorizer, shutdown).await,
    }
}

async fn serve_http<S>(
    stream: S,
    client_addr: SocketAddr,
    authorizer: Arc<Authorizer>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let handler = ProxyHandler::new(authorizer)
        .with_client_addr(client_addr)
        .with_shutdown(shutdown.clone());

    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { handler.handle(req).await }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(client = %client_addr, error = %e, "Connection error");
    }
}
