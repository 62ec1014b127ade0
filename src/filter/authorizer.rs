//! Shared authorization entry point with atomically swappable policy

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

use super::bypass::BypassCache;
use super::challenge::BypassSecret;
use super::rules::{RequestInfo, RuleEngine, Verdict};

/// The rule set and bypass secret in force, replaced together on reload
#[derive(Debug, Default)]
pub struct Policy {
    pub engine: RuleEngine,
    pub secret: BypassSecret,
}

/// Authorizes requests for every listener.
///
/// The policy is read through an `ArcSwap`, so a request sees either the old or
/// the new rule set, never a mix. The bypass cache outlives policy swaps.
#[derive(Debug)]
pub struct Authorizer {
    policy: ArcSwap<Policy>,
    bypass: Arc<BypassCache>,
}

impl Authorizer {
    pub fn new(engine: RuleEngine, secret: BypassSecret) -> Self {
        Self::with_cache(engine, secret, Arc::new(BypassCache::default()))
    }

    pub fn with_cache(engine: RuleEngine, secret: BypassSecret, bypass: Arc<BypassCache>) -> Self {
        Self {
            policy: ArcSwap::from_pointee(Policy { engine, secret }),
            bypass,
        }
    }

    /// Authorize a request against the current policy
    pub fn authorize(&self, request: &RequestInfo) -> Verdict {
        let policy = self.policy.load();
        policy
            .engine
            .authorize(request, &policy.secret, &self.bypass)
    }

    /// Install a new rule set and secret
    pub fn replace(&self, engine: RuleEngine, secret: BypassSecret) {
        tracing::info!(
            rules = engine.rule_count(),
            bypass_password = secret.is_set(),
            "New rules loaded"
        );
        self.policy.store(Arc::new(Policy { engine, secret }));
    }

    /// Snapshot of the current policy
    pub fn policy(&self) -> Arc<Policy> {
        self.policy.load_full()
    }

    pub fn bypass_cache(&self) -> &Arc<BypassCache> {
        &self.bypass
    }

    /// Start the bypass decay task
    pub fn spawn_decay(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.bypass.spawn_decay(interval)
    }
}
