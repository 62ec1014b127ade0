//! Server TLS configuration from an operator certificate and cipher allowlist

use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, SupportedCipherSuite};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Suites considered insecure. They may be listed in the allowlist and are
/// reported with a warning, but the TLS backend cannot negotiate any of them.
pub const INSECURE_CIPHER_SUITES: &[&str] = &[
    "TLS_RSA_WITH_RC4_128_SHA",
    "TLS_RSA_WITH_3DES_EDE_CBC_SHA",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_CBC_SHA256",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_RC4_128_SHA",
    "TLS_ECDHE_RSA_WITH_RC4_128_SHA",
    "TLS_ECDHE_RSA_WITH_3DES_EDE_CBC_SHA",
    "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256",
];

/// Provisioned server TLS state for the HTTPS listener
#[derive(Clone)]
pub struct TlsMaterial {
    /// rustls config: TLS 1.2 minimum, server cipher preference
    pub config: Arc<ServerConfig>,
    /// Enabled suite names, TLS 1.3 first then the TLS 1.2 allowlist in order
    pub ciphers: Vec<String>,
    /// Requested suites from the insecure catalog
    pub insecure: Vec<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ciphers", &self.ciphers)
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Result of resolving a colon-separated cipher list against the backend catalog
#[derive(Debug)]
pub struct CipherSelection {
    pub suites: Vec<SupportedCipherSuite>,
    pub insecure: Vec<String>,
    pub unknown: Vec<String>,
}

impl CipherSelection {
    pub fn names(&self) -> Vec<String> {
        self.suites.iter().map(suite_name).collect()
    }
}

/// Canonical rustls name of a suite, e.g. `TLS13_AES_128_GCM_SHA256`
fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Whether `name` designates `suite`. TLS 1.3 suites also answer to their
/// IANA names (`TLS_AES_128_GCM_SHA256`).
fn suite_has_name(suite: &SupportedCipherSuite, name: &str) -> bool {
    let canonical = suite_name(suite);
    if canonical == name {
        return true;
    }
    match canonical.strip_prefix("TLS13_") {
        Some(rest) => name.strip_prefix("TLS_") == Some(rest),
        None => false,
    }
}

/// Resolve cipher names (split on `:`) against the backend's catalog.
///
/// TLS 1.3 suites are always enabled; the allowlist governs TLS 1.2. Insecure
/// names are collected for reporting and unknown names are dropped. If no
/// TLS 1.2 suite survives, the backend's default TLS 1.2 suites are used.
pub fn select_cipher_suites(cipher_names: &str) -> CipherSelection {
    let catalog = aws_lc_rs::ALL_CIPHER_SUITES;

    let mut suites: Vec<SupportedCipherSuite> = catalog
        .iter()
        .filter(|s| matches!(s, SupportedCipherSuite::Tls13(_)))
        .copied()
        .collect();
    let mut insecure = Vec::new();
    let mut unknown = Vec::new();
    let mut tls12 = 0;

    for name in cipher_names.split(':').map(str::trim).filter(|n| !n.is_empty()) {
        if let Some(suite) = catalog.iter().find(|s| suite_has_name(s, name)) {
            if matches!(suite, SupportedCipherSuite::Tls12(_))
                && !suites.iter().any(|s| s.suite() == suite.suite())
            {
                suites.push(*suite);
                tls12 += 1;
            }
        } else if INSECURE_CIPHER_SUITES.contains(&name) {
            if !insecure.iter().any(|n| n == name) {
                insecure.push(name.to_string());
            }
        } else {
            unknown.push(name.to_string());
        }
    }

    if tls12 == 0 {
        tracing::warn!("No usable TLS 1.2 cipher suites configured, using defaults");
        suites.extend(
            aws_lc_rs::DEFAULT_CIPHER_SUITES
                .iter()
                .filter(|s| matches!(s, SupportedCipherSuite::Tls12(_)))
                .copied(),
        );
    }

    CipherSelection {
        suites,
        insecure,
        unknown,
    }
}

/// Load the certificate chain and key and build the HTTPS server config
pub fn provision(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    cipher_names: &str,
) -> Result<TlsMaterial> {
    let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
        Error::tls(format!(
            "Failed to read certificate '{}': {}",
            cert_path.as_ref().display(),
            e
        ))
    })?;

    let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
        Error::tls(format!(
            "Failed to read key '{}': {}",
            key_path.as_ref().display(),
            e
        ))
    })?;

    provision_pem(&cert_pem, &key_pem, cipher_names)
}

/// Build the HTTPS server config from PEM-encoded certificate chain and key
pub fn provision_pem(cert_pem: &str, key_pem: &str, cipher_names: &str) -> Result<TlsMaterial> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::tls(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls("No certificate found in PEM"));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| Error::tls(format!("Failed to parse private key: {}", e)))?
            .ok_or_else(|| Error::tls("No private key found in PEM"))?;

    let selection = select_cipher_suites(cipher_names);
    for name in &selection.insecure {
        tracing::warn!(
            cipher = %name,
            "Insecure TLS cipher requested; not supported by the TLS backend"
        );
    }
    for name in &selection.unknown {
        tracing::debug!(cipher = %name, "Ignoring unknown TLS cipher");
    }

    let ciphers = selection.names();
    let provider = CryptoProvider {
        cipher_suites: selection.suites,
        ..aws_lc_rs::default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| Error::tls(format!("Invalid TLS settings: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("Failed to build server config: {}", e)))?;
    config.ignore_client_order = true;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    tracing::debug!(ciphers = ?ciphers, "TLS material provisioned");

    Ok(TlsMaterial {
        config: Arc::new(config),
        ciphers,
        insecure: selection.insecure,
    })
}
