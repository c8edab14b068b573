//! Autoproxy decision cache.
//!
//! Learns, per destination host, whether traffic should go direct or
//! through the proxy. A destination with no entry (or an expired one) is
//! tried direct, the optimistic default that keeps reachable hosts off
//! the proxy. Direct failures accumulate inside a sliding window; once
//! they cross the configured threshold the host is flipped to proxied for
//! the proxied TTL, after which it is re-probed direct so transient
//! failures self-heal.
//!
//! The cache is the only state shared across sessions. One mutex
//! serializes `lookup` and `record_outcome`, so outcome updates for a
//! destination are never lost to interleaving, and a session's chosen
//! policy is read exactly once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::AutoproxyOptions;

/// Routing policy for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Direct,
    Proxied,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Direct => "direct",
            Policy::Proxied => "proxied",
        }
    }
}

struct Entry {
    policy: Policy,
    failures: u32,
    window_start: Instant,
    expires_at: Instant,
    // LRU tick; larger = more recently used.
    last_used: u64,
}

struct Inner {
    entries: HashMap<IpAddr, Entry>,
    tick: u64,
}

/// Snapshot of one cache entry for state dumps.
#[derive(Debug, Serialize)]
pub struct EntrySnapshot {
    pub destination: IpAddr,
    pub policy: &'static str,
    pub failures: u32,
    pub expires_in_secs: i64,
}

/// Per-destination direct-vs-proxied decision cache with LRU eviction.
pub struct DecisionCache {
    inner: Mutex<Inner>,
    options: AutoproxyOptions,
}

impl DecisionCache {
    pub fn new(options: AutoproxyOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
            options,
        }
    }

    /// Policy for a destination. Absent and expired entries both mean
    /// "no opinion yet": try direct. An expired proxied entry is the
    /// re-probe case (its history is kept, only its vote lapses).
    pub async fn lookup(&self, destination: IpAddr) -> Policy {
        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;

        match inner.entries.get_mut(&destination) {
            Some(entry) => {
                entry.last_used = tick;
                if entry.expires_at <= Instant::now() {
                    Policy::Direct
                } else {
                    entry.policy
                }
            }
            None => Policy::Direct,
        }
    }

    /// Record a session outcome for a destination.
    pub async fn record_outcome(&self, destination: IpAddr, attempted: Policy, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(&destination) {
            self.evict_if_full(&mut inner);
        }
        let entry = inner.entries.entry(destination).or_insert_with(|| Entry {
            policy: Policy::Direct,
            failures: 0,
            window_start: now,
            // A fresh entry holds no opinion until confirmed.
            expires_at: now,
            last_used: tick,
        });
        entry.last_used = tick;

        match (attempted, success) {
            (Policy::Direct, true) => {
                entry.policy = Policy::Direct;
                entry.failures = 0;
                entry.window_start = now;
                entry.expires_at = now + self.options.direct_ttl;
            }
            (Policy::Direct, false) => {
                if now.duration_since(entry.window_start) > self.options.fail_window {
                    entry.window_start = now;
                    entry.failures = 1;
                } else {
                    entry.failures += 1;
                }
                if entry.failures >= self.options.fail_threshold {
                    debug!(
                        destination = %destination,
                        failures = entry.failures,
                        "Destination flipped to proxied"
                    );
                    entry.policy = Policy::Proxied;
                    entry.failures = 0;
                    entry.expires_at = now + self.options.proxied_ttl;
                }
            }
            (Policy::Proxied, true) => {
                // A working proxied path re-confirms an existing proxied
                // vote; it says nothing about direct reachability.
                if entry.policy == Policy::Proxied {
                    entry.expires_at = now + self.options.proxied_ttl;
                }
            }
            (Policy::Proxied, false) => {
                // Proxy-side failures are not evidence about the
                // destination; only the LRU position moves.
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Unexpired entries, for `dump_state()`.
    pub async fn dump(&self) -> Vec<EntrySnapshot> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .map(|(dest, entry)| EntrySnapshot {
                destination: *dest,
                policy: entry.policy.as_str(),
                failures: entry.failures,
                expires_in_secs: if entry.expires_at > now {
                    (entry.expires_at - now).as_secs() as i64
                } else {
                    -(now.duration_since(entry.expires_at).as_secs() as i64)
                },
            })
            .collect()
    }

    fn evict_if_full(&self, inner: &mut Inner) {
        if inner.entries.len() < self.options.capacity {
            return;
        }
        if let Some(victim) = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(dest, _)| *dest)
        {
            inner.entries.remove(&victim);
            debug!(destination = %victim, "Evicted least-recently-used cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> AutoproxyOptions {
        AutoproxyOptions {
            enabled: true,
            fail_threshold: 3,
            fail_window: Duration::from_secs(60),
            direct_ttl: Duration::from_secs(900),
            proxied_ttl: Duration::from_secs(300),
            capacity: 4,
        }
    }

    fn dest(last: u8) -> IpAddr {
        format!("10.0.0.{}", last).parse().unwrap()
    }

    #[tokio::test]
    async fn unknown_destination_defaults_to_direct() {
        let cache = DecisionCache::new(options());
        assert_eq!(cache.lookup(dest(1)).await, Policy::Direct);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn direct_success_confirms_direct() {
        let cache = DecisionCache::new(options());
        cache.record_outcome(dest(1), Policy::Direct, true).await;
        assert_eq!(cache.lookup(dest(1)).await, Policy::Direct);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn threshold_failures_flip_to_proxied() {
        let cache = DecisionCache::new(options());
        for _ in 0..2 {
            cache.record_outcome(dest(1), Policy::Direct, false).await;
            assert_eq!(cache.lookup(dest(1)).await, Policy::Direct);
        }
        cache.record_outcome(dest(1), Policy::Direct, false).await;
        assert_eq!(cache.lookup(dest(1)).await, Policy::Proxied);
    }

    #[tokio::test]
    async fn direct_success_resets_failure_counter() {
        let cache = DecisionCache::new(options());
        cache.record_outcome(dest(1), Policy::Direct, false).await;
        cache.record_outcome(dest(1), Policy::Direct, false).await;
        cache.record_outcome(dest(1), Policy::Direct, true).await;
        // Counter restarted: two more failures stay below the threshold.
        cache.record_outcome(dest(1), Policy::Direct, false).await;
        cache.record_outcome(dest(1), Policy::Direct, false).await;
        assert_eq!(cache.lookup(dest(1)).await, Policy::Direct);
    }

    #[tokio::test]
    async fn stale_window_restarts_counting() {
        let mut opts = options();
        opts.fail_window = Duration::from_millis(20);
        opts.fail_threshold = 2;
        let cache = DecisionCache::new(opts);

        cache.record_outcome(dest(1), Policy::Direct, false).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Outside the window: this failure starts a new count of one.
        cache.record_outcome(dest(1), Policy::Direct, false).await;
        assert_eq!(cache.lookup(dest(1)).await, Policy::Direct);
    }

    #[tokio::test]
    async fn expired_proxied_entry_reprobes_direct() {
        let mut opts = options();
        opts.fail_threshold = 1;
        opts.proxied_ttl = Duration::from_millis(20);
        let cache = DecisionCache::new(opts);

        cache.record_outcome(dest(1), Policy::Direct, false).await;
        assert_eq!(cache.lookup(dest(1)).await, Policy::Proxied);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.lookup(dest(1)).await, Policy::Direct);
    }

    #[tokio::test]
    async fn proxied_success_refreshes_proxied_ttl() {
        let mut opts = options();
        opts.fail_threshold = 1;
        opts.proxied_ttl = Duration::from_millis(60);
        let cache = DecisionCache::new(opts);

        cache.record_outcome(dest(1), Policy::Direct, false).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.record_outcome(dest(1), Policy::Proxied, true).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Without the refresh the entry would have expired by now.
        assert_eq!(cache.lookup(dest(1)).await, Policy::Proxied);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = DecisionCache::new(options());
        for i in 1..=4 {
            cache.record_outcome(dest(i), Policy::Direct, true).await;
        }
        // Touch 1 so 2 becomes the LRU victim.
        cache.lookup(dest(1)).await;
        cache.record_outcome(dest(5), Policy::Direct, true).await;

        assert_eq!(cache.len().await, 4);
        let dump = cache.dump().await;
        assert!(dump.iter().all(|e| e.destination != dest(2)));
        assert!(dump.iter().any(|e| e.destination == dest(1)));
    }

    #[tokio::test]
    async fn dump_reports_policy_and_failures() {
        let cache = DecisionCache::new(options());
        cache.record_outcome(dest(1), Policy::Direct, false).await;
        let dump = cache.dump().await;
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].policy, "direct");
        assert_eq!(dump[0].failures, 1);
    }
}
