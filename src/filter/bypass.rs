//! Time-decaying cache of successful password bypasses

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long a verified bypass lasts (20 hours)
pub const DEFAULT_BYPASS_DURATION: Duration = Duration::from_secs(20 * 60 * 60);

/// How often remaining bypass durations are decremented
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(60);

type Grants = HashMap<String, HashMap<String, Duration>>;

/// Remaining bypass time per client IP and rule pattern.
///
/// Expiry is coarse: a background task subtracts one interval from every
/// entry each tick and removes what reaches zero.
#[derive(Debug)]
pub struct BypassCache {
    grants: Mutex<Grants>,
    duration: Duration,
}

impl BypassCache {
    /// Create a cache whose grants last `duration`
    pub fn new(duration: Duration) -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            duration,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Grants> {
        self.grants.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True if `client` has a live bypass for `pattern`
    pub fn lookup(&self, client: &str, pattern: &str) -> bool {
        self.remaining(client, pattern)
            .is_some_and(|left| !left.is_zero())
    }

    /// Record a successful bypass, resetting any existing entry to the full duration
    pub fn grant(&self, client: &str, pattern: &str) {
        self.lock()
            .entry(client.to_string())
            .or_default()
            .insert(pattern.to_string(), self.duration);
    }

    /// Remaining bypass time for `client` and `pattern`, if any
    pub fn remaining(&self, client: &str, pattern: &str) -> Option<Duration> {
        self.lock()
            .get(client)
            .and_then(|patterns| patterns.get(pattern))
            .copied()
    }

    /// Subtract `tick` from every entry, dropping expired entries and empty clients
    pub fn decay(&self, tick: Duration) {
        let mut grants = self.lock();
        grants.retain(|_, patterns| {
            patterns.retain(|_, left| {
                *left = left.saturating_sub(tick);
                !left.is_zero()
            });
            !patterns.is_empty()
        });
    }

    /// Run [`decay`](Self::decay) once per `interval` for as long as the cache is alive
    pub fn spawn_decay(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.decay(interval);
                tracing::trace!(clients = cache.client_count(), "Bypass cache decayed");
            }
        })
    }

    /// Number of clients holding at least one bypass
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Check if no bypasses are held
    pub fn is_empty(&self) -> bool {
        self.client_count() == 0
    }

    /// Bypass duration granted on successful verification
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl Default for BypassCache {
    fn default() -> Self {
        Self::new(DEFAULT_BYPASS_DURATION)
    }
}
