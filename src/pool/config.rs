use std::time::Duration;

/// How queued lease requests compete for freed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConcurrencyPolicy {
    /// A single pool-wide queue, ordered by arrival across all routes.
    ///
    /// Admission and servicing hold a pool-wide lock, so newly freed global capacity always goes
    /// to the longest-waiting request whose route also has room.
    #[default]
    Strict,

    /// One queue per route, with per-route locking.
    ///
    /// Freed capacity is offered to the releasing route's queue first, then to other routes in
    /// no particular order.
    Lax,
}

/// Which free entry to hand out when none matches the request's affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReusePolicy {
    /// Most recently released first, maximizing keep-alive reuse.
    #[default]
    Lifo,

    /// Least recently released first, spreading load across sessions.
    Fifo,
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The default maximum number of leased entries per route.
    pub max_per_route: usize,

    /// The maximum number of leased entries across all routes.
    pub max_total: usize,

    /// How queued requests compete for capacity.
    pub policy: ConcurrencyPolicy,

    /// Which free entry is reused when none matches the requested affinity.
    pub reuse: ReusePolicy,

    /// The maximum idle duration of a free entry.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of free entries kept per route.
    pub max_idle_per_route: usize,

    /// The maximum lifetime of an entry, measured from when it was connected.
    pub time_to_live: Option<Duration>,

    /// Free entries idle for at least this long are validated before reuse.
    pub validate_after_inactivity: Option<Duration>,

    /// Bound on each connection attempt.
    pub connect_timeout: Option<Duration>,

    /// Default timeout for leases made through the `tower::Service` interface.
    pub lease_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_per_route: 5,
            max_total: 25,
            policy: ConcurrencyPolicy::Strict,
            reuse: ReusePolicy::Lifo,
            idle_timeout: Some(Duration::from_secs(90)),
            max_idle_per_route: 32,
            time_to_live: None,
            validate_after_inactivity: None,
            connect_timeout: None,
            lease_timeout: None,
        }
    }
}

impl Config {
    /// Set the default per-route maximum.
    pub fn with_max_per_route(mut self, max: usize) -> Self {
        self.max_per_route = max;
        self
    }

    /// Set the global maximum.
    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = max;
        self
    }

    /// Set the concurrency policy.
    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the reuse policy.
    pub fn with_reuse(mut self, reuse: ReusePolicy) -> Self {
        self.reuse = reuse;
        self
    }

    /// Set the idle timeout for free entries.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum number of free entries kept per route.
    pub fn with_max_idle_per_route(mut self, max: usize) -> Self {
        self.max_idle_per_route = max;
        self
    }

    /// Set the maximum lifetime of an entry.
    pub fn with_time_to_live(mut self, ttl: Option<Duration>) -> Self {
        self.time_to_live = ttl;
        self
    }

    /// Set the validate-after-inactivity threshold.
    pub fn with_validate_after_inactivity(mut self, threshold: Option<Duration>) -> Self {
        self.validate_after_inactivity = threshold;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default lease timeout used by the `tower::Service` interface.
    pub fn with_lease_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lease_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensible_config() {
        let config = Config::default();

        assert!(config.idle_timeout.unwrap() > Duration::from_secs(1));
        assert!(config.max_idle_per_route > 0);
        assert!(config.max_per_route > 0);
        assert!(config.max_total >= config.max_per_route);
        assert_eq!(config.policy, ConcurrencyPolicy::Strict);
        assert_eq!(config.reuse, ReusePolicy::Lifo);
    }

    #[test]
    fn builder_methods() {
        let config = Config::default()
            .with_max_per_route(1)
            .with_max_total(2)
            .with_policy(ConcurrencyPolicy::Lax)
            .with_connect_timeout(Some(Duration::from_secs(3)));

        assert_eq!(config.max_per_route, 1);
        assert_eq!(config.max_total, 2);
        assert_eq!(config.policy, ConcurrencyPolicy::Lax);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(3)));
    }
}
