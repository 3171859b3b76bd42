//! Rate limiting and DoS protection
//!
//! Every inbound datagram is charged to a budget keyed by
//! `(replicable, source address)`. Replicable kinds (Join, Publish,
//! PublishProxied) draw from a smaller per-minute quota than control kinds.
//!
//! Quotas adapt: at each minute boundary a budget that was exceeded loses one
//! unit of quota and one that stayed within it gains one. Minutes in which a
//! source sent nothing count as boundaries it stayed within. Denied requests
//! still count as usage, so a source that keeps hammering stays throttled.

use crate::packet::PacketKind;
use std::collections::HashMap;
use std::net::SocketAddr;

const MINUTE_MS: u64 = 60_000;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Per-minute quota for Join, Publish and PublishProxied
    pub replicable_quota: u32,

    /// Per-minute quota for Ping, Pong and Intro
    pub control_quota: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            replicable_quota: 1024,
            control_quota: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BudgetKey {
    replicable: bool,
    source: SocketAddr,
}

/// Per-source budget
#[derive(Debug, Clone)]
struct Budget {
    /// Minute index the usage belongs to
    minute: u64,

    /// Requests seen this minute, allowed or not
    used: u32,

    /// Current adaptive quota
    quota: u32,
}

/// Rate limiting metrics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitMetrics {
    /// Total packets allowed
    pub packets_allowed: u64,

    /// Total packets dropped
    pub packets_dropped: u64,

    /// Budgets currently tracked
    pub tracked_sources: usize,
}

/// Adaptive per-source rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Configuration
    config: RateLimitConfig,

    /// Budgets by source
    budgets: HashMap<BudgetKey, Budget>,

    /// Metrics
    metrics: RateLimitMetrics,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            budgets: HashMap::new(),
            metrics: RateLimitMetrics::default(),
        }
    }

    fn base_quota(&self, replicable: bool) -> u32 {
        if replicable {
            self.config.replicable_quota
        } else {
            self.config.control_quota
        }
    }

    /// Charge one packet of `kind` from `source`.
    ///
    /// `override_quota` raises the ceiling for traffic of a subcluster that
    /// asked for a higher limit. Returns false if the packet must be dropped.
    pub fn check(
        &mut self,
        kind: PacketKind,
        source: SocketAddr,
        now: u64,
        override_quota: Option<u32>,
    ) -> bool {
        let replicable = kind.is_replicable();
        let base = self.base_quota(replicable);
        let minute = now / MINUTE_MS;

        let budget = self
            .budgets
            .entry(BudgetKey { replicable, source })
            .or_insert(Budget {
                minute,
                used: 0,
                quota: base,
            });

        if minute > budget.minute {
            if budget.used > budget.quota {
                budget.quota = budget.quota.saturating_sub(1);
            } else {
                budget.quota = budget.quota.saturating_add(1);
            }
            let quiet = u32::try_from(minute - budget.minute - 1).unwrap_or(u32::MAX);
            budget.quota = budget.quota.saturating_add(quiet);
            budget.used = 0;
            budget.minute = minute;
        }

        budget.used = budget.used.saturating_add(1);
        let ceiling = budget.quota.max(override_quota.unwrap_or(0));
        let allowed = budget.used <= ceiling;

        if allowed {
            self.metrics.packets_allowed += 1;
        } else {
            self.metrics.packets_dropped += 1;
        }
        allowed
    }

    /// Current quota for a source, if tracked
    #[must_use]
    pub fn quota(&self, kind: PacketKind, source: SocketAddr) -> Option<u32> {
        self.budgets
            .get(&BudgetKey {
                replicable: kind.is_replicable(),
                source,
            })
            .map(|b| b.quota)
    }

    /// Drop budgets idle for more than two minutes unless they are still
    /// throttled well below their base quota
    pub fn cleanup_stale(&mut self, now: u64) {
        let minute = now / MINUTE_MS;
        let config = self.config;
        self.budgets.retain(|key, budget| {
            let base = if key.replicable {
                config.replicable_quota
            } else {
                config.control_quota
            };
            minute.saturating_sub(budget.minute) <= 2 || budget.quota < base.saturating_sub(2)
        });
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> RateLimitMetrics {
        RateLimitMetrics {
            tracked_sources: self.budgets.len(),
            ..self.metrics
        }
    }
}
