//! Fixed-window request rate limiting, keyed by client address
//!
//! Each client gets `max_requests` per window; the counter resets when the
//! window rolls over. Windows are tracked lazily, so idle clients cost
//! nothing after their entry is pruned.

use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How often the background task drops elapsed client windows.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

struct Window {
    started_at: Instant,
    count: u32,
}

pub struct RateLimiter {
    enabled: bool,
    window: Duration,
    max_requests: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: Duration::from_secs(config.window_secs),
            max_requests: config.max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Count a request against the client's current window. Returns false
    /// when the client is over its limit.
    pub fn check(&self, client: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();

        let window = windows.entry(client.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= self.window {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.max_requests {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&self) {
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, w| w.started_at.elapsed() < self.window);
    }

    /// Spawn the periodic pruner so the per-client map does not grow without
    /// bound as new addresses appear.
    pub fn spawn_pruner(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                limiter.prune();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            window_secs,
            max_requests: max,
        })
    }

    #[test]
    fn test_limit_enforced_per_client() {
        let limiter = limiter(3, 60);

        for _ in 0..3 {
            assert!(limiter.check("10.0.0.1"));
        }
        assert!(!limiter.check("10.0.0.1"));

        // Other clients are unaffected
        assert!(limiter.check("10.0.0.2"));
    }

    #[test]
    fn test_window_rollover_resets_count() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: true,
            window_secs: 0, // every check starts a fresh window
            max_requests: 1,
        });

        assert!(limiter.check("10.0.0.1"));
        assert!(limiter.check("10.0.0.1"));
    }

    #[test]
    fn test_prune_drops_elapsed_windows() {
        let elapsed = RateLimiter::new(&RateLimitConfig {
            enabled: true,
            window_secs: 0, // every window is elapsed as soon as it starts
            max_requests: 5,
        });
        elapsed.check("10.0.0.1");
        elapsed.check("10.0.0.2");
        assert_eq!(elapsed.windows.lock().unwrap().len(), 2);

        elapsed.prune();
        assert!(elapsed.windows.lock().unwrap().is_empty());

        // Live windows survive a prune
        let live = limiter(5, 60);
        live.check("10.0.0.1");
        live.prune();
        assert_eq!(live.windows.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: false,
            window_secs: 60,
            max_requests: 1,
        });

        for _ in 0..100 {
            assert!(limiter.check("10.0.0.1"));
        }
    }
}
