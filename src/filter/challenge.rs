//! Password challenge for block rules that allow a bypass
//!
//! A blocked client is asked for proxy credentials with a `407` and a Basic
//! challenge. Only the password is checked; the username is ignored. Credentials
//! are read from `Proxy-Authorization`, never from the end-to-end
//! `Authorization` header, which belongs to the destination server.

use base64::Engine;
use std::fmt;

use super::bypass::BypassCache;
use super::rules::{RequestInfo, Verdict};

/// Realm sent in the `Proxy-Authenticate` challenge
pub const BYPASS_REALM: &str = "pc-proxy: Enter password to bypass block";

/// The operator's bypass password.
///
/// An unset or empty secret disables bypass: no supplied password matches it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BypassSecret(Option<String>);

impl BypassSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self((!secret.is_empty()).then_some(secret))
    }

    /// No bypass password configured
    pub fn none() -> Self {
        Self(None)
    }

    /// Read the secret from environment variable `var`
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(value) => Self::new(value),
            Err(_) => Self::none(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    fn verify(&self, candidate: &str) -> bool {
        self.0.as_deref() == Some(candidate)
    }
}

impl fmt::Debug for BypassSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("BypassSecret(<redacted>)"),
            None => f.write_str("BypassSecret(<unset>)"),
        }
    }
}

/// Value of the `Proxy-Authenticate` challenge header
pub fn challenge_header() -> String {
    format!("Basic realm=\"{}\"", BYPASS_REALM)
}

/// Extract the password from a Basic credential (`Basic base64(user:password)`).
///
/// Returns `None` for other schemes or malformed values.
pub fn basic_password(header: &str) -> Option<String> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

/// Decide a request that hit a block rule with password bypass.
///
/// A cached bypass for the client and pattern allows immediately. Without a
/// usable credential the client is challenged. A wrong password is blocked
/// without a new challenge; the right one is cached and allowed.
pub fn verify(
    request: &RequestInfo,
    pattern: &str,
    secret: &BypassSecret,
    cache: &BypassCache,
) -> Verdict {
    if let Some(client) = request.client_ip {
        if cache.lookup(client, pattern) {
            tracing::debug!(client = %client, pattern = %pattern, "Bypass cache hit");
            return Verdict::Allowed;
        }
    }

    let Some(password) = request.proxy_authorization.and_then(basic_password) else {
        return Verdict::Challenge;
    };

    if !secret.verify(&password) {
        tracing::info!(
            client = request.client_ip.unwrap_or("unknown"),
            pattern = %pattern,
            "Bypass password rejected"
        );
        return Verdict::Blocked;
    }

    if let Some(client) = request.client_ip {
        cache.grant(client, pattern);
    }
    tracing::info!(
        client = request.client_ip.unwrap_or("unknown"),
        pattern = %pattern,
        "Bypass password accepted"
    );
    Verdict::Allowed
}
