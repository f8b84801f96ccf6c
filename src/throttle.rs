//! # Request Throttles
//!
//! Fixed-window counters that bound how much work a single requester or a
//! single key can cause:
//!
//! | Throttle | Keyed by | Limit |
//! |----------|----------|-------|
//! | [`LookupThrottler`] | requester identity + reply tunnel | depends on whether we are floodfill |
//! | [`FloodThrottler`] | content key | floods per window |
//! | [`NegativeLookupCache`] | content key | failed local lookups per window |
//!
//! Counters are not sliding windows: each table is cleared wholesale on its
//! cleaning tick. Tables are LRU-bounded so a flood of distinct keys cannot
//! grow memory without limit.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use lru::LruCache;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::config::ThrottleConfig;
use crate::identity::Identity;

type LookupKey = (Identity, Option<u32>);

fn bounded<K: std::hash::Hash + Eq, V>(cap: usize) -> Mutex<LruCache<K, V>> {
    let cap = NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN);
    Mutex::new(LruCache::new(cap))
}

/// Increments the counter for `key` and returns the new count.
fn bump<K: std::hash::Hash + Eq>(table: &Mutex<LruCache<K, u32>>, key: K) -> u32 {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    let count = table.get_or_insert_mut(key, || 0);
    *count = count.saturating_add(1);
    *count
}

pub struct LookupThrottler {
    counters: Mutex<LruCache<LookupKey, u32>>,
    max_floodfill: u32,
    max_non_floodfill: u32,
}

impl LookupThrottler {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            counters: bounded(config.max_tracked),
            max_floodfill: config.max_lookups_floodfill,
            max_non_floodfill: config.max_lookups,
        }
    }

    /// Count one lookup from `from` and report whether it exceeds the limit.
    pub fn should_throttle(&self, from: &Identity, reply_tunnel: Option<u32>, floodfill: bool) -> bool {
        let limit = if floodfill { self.max_floodfill } else { self.max_non_floodfill };
        bump(&self.counters, (*from, reply_tunnel)) > limit
    }

    pub fn clear(&self) {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

pub struct FloodThrottler {
    counters: Mutex<LruCache<Identity, u32>>,
    max: u32,
}

impl FloodThrottler {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            counters: bounded(config.max_tracked),
            max: config.max_floods,
        }
    }

    pub fn should_throttle(&self, key: &Identity) -> bool {
        bump(&self.counters, *key) > self.max
    }

    pub fn clear(&self) {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Remembers keys whose lookups keep failing.
pub struct NegativeLookupCache {
    failures: Mutex<LruCache<Identity, u32>>,
    max_fails: u32,
}

impl NegativeLookupCache {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            failures: bounded(config.max_tracked),
            max_fails: config.negative_max_fails,
        }
    }

    pub fn lookup_failed(&self, key: &Identity) {
        bump(&self.failures, *key);
    }

    pub fn is_cached(&self, key: &Identity) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(key)
            .is_some_and(|n| *n >= self.max_fails)
    }

    /// A successful lookup wipes the key's failure count.
    pub fn lookup_succeeded(&self, key: &Identity) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).pop(key);
    }

    pub fn cached_count(&self) -> usize {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.iter().filter(|(_, n)| **n >= self.max_fails).count()
    }

    pub fn clear(&self) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// All throttles of one database instance.
pub struct Throttles {
    pub lookups: LookupThrottler,
    pub floods: FloodThrottler,
    pub negative: NegativeLookupCache,
    config: ThrottleConfig,
}

impl Throttles {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            lookups: LookupThrottler::new(&config),
            floods: FloodThrottler::new(&config),
            negative: NegativeLookupCache::new(&config),
            config,
        }
    }

    /// Spawn the cleaning ticks. The task ends once the throttles are dropped.
    pub fn spawn_cleaner(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cfg = self.config.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let mut lookup_tick = interval_at(start + cfg.lookup_window, cfg.lookup_window);
            let mut flood_tick = interval_at(start + cfg.flood_window, cfg.flood_window);
            let mut negative_tick = interval_at(start + cfg.negative_window, cfg.negative_window);
            for tick in [&mut lookup_tick, &mut flood_tick, &mut negative_tick] {
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
            loop {
                tokio::select! {
                    _ = lookup_tick.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.lookups.clear();
                        trace!("lookup throttle window reset");
                    }
                    _ = flood_tick.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.floods.clear();
                        trace!("flood throttle window reset");
                    }
                    _ = negative_tick.tick() => {
                        let Some(this) = weak.upgrade() else { break };
                        this.negative.clear();
                        trace!("negative lookup cache cleared");
                    }
                }
            }
        })
    }
}
