//! In-memory reliability, banlist and router status collaborators.
//!
//! Routers embedding the database normally bring their own profile manager;
//! these implementations keep just enough history for peer selection and
//! are used by the simulator and tests.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::identity::{now_ms, Identity};
use crate::protocols::{Banlist, PeerReliability, PeerStats, PeerTier, RouterHealth, RouterStatus};

/// Maximum peers with tracked history.
/// SECURITY: LRU eviction bounds memory under identity churn.
const MAX_TRACKED_PROFILES: usize = 10_000;

/// Lookups observed before a peer stops counting as untested.
const MIN_LOOKUPS_FOR_TIER: u64 = 2;

/// Failure rate above which a tested peer is failing.
const FAILING_RATE: f64 = 0.5;

/// Average response under which a reliable peer counts as fast.
const FAST_RESPONSE_MS: u64 = 1_000;

/// Weight of a new latency sample in the moving average.
const LATENCY_EWMA_WEIGHT: f64 = 0.25;

#[derive(Clone, Debug, Default)]
struct Profile {
    stats: PeerStats,
    unreachable: bool,
}

pub struct InMemoryProfiles {
    profiles: Mutex<LruCache<Identity, Profile>>,
}

impl Default for InMemoryProfiles {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_PROFILES).unwrap_or(NonZeroUsize::MIN);
        Self {
            profiles: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Seed or overwrite the history of a peer.
    pub fn set_stats(&self, peer: Identity, stats: PeerStats) {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles.get_or_insert_mut(peer, Profile::default).stats = stats;
    }

    pub fn mark_unreachable(&self, peer: Identity, unreachable: bool) {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles.get_or_insert_mut(peer, Profile::default).unreachable = unreachable;
    }

    fn with_profile(&self, peer: &Identity, f: impl FnOnce(&mut Profile)) {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        f(profiles.get_or_insert_mut(*peer, Profile::default));
    }
}

impl PeerReliability for InMemoryProfiles {
    fn record_lookup_result(&self, peer: &Identity, success: bool, latency: Option<Duration>) {
        let now = now_ms();
        self.with_profile(peer, |p| {
            p.stats.lookups += 1;
            if success {
                p.stats.last_lookup_success_ms = Some(now);
                p.unreachable = false;
            } else {
                p.stats.lookup_failures += 1;
                p.stats.last_lookup_failure_ms = Some(now);
            }
            if let Some(latency) = latency {
                let sample = latency.as_millis() as f64;
                let avg = match p.stats.avg_response_ms {
                    Some(prev) => prev as f64 * (1.0 - LATENCY_EWMA_WEIGHT) + sample * LATENCY_EWMA_WEIGHT,
                    None => sample,
                };
                p.stats.avg_response_ms = Some(avg.round() as u64);
            }
        });
    }

    fn record_store_result(&self, peer: &Identity, success: bool) {
        let now = now_ms();
        self.with_profile(peer, |p| {
            if success {
                p.stats.last_store_success_ms = Some(now);
            } else {
                p.stats.last_store_failure_ms = Some(now);
            }
        });
    }

    fn stats(&self, peer: &Identity) -> Option<PeerStats> {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        profiles.get(peer).map(|p| p.stats.clone())
    }

    fn tier(&self, peer: &Identity) -> PeerTier {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(profile) = profiles.get(peer) else {
            return PeerTier::Untested;
        };
        if profile.unreachable {
            return PeerTier::Unreachable;
        }
        let stats = &profile.stats;
        if stats.lookups < MIN_LOOKUPS_FOR_TIER {
            return PeerTier::Untested;
        }
        if stats.failure_rate() > FAILING_RATE {
            return PeerTier::Failing;
        }
        match stats.avg_response_ms {
            Some(avg) if avg <= FAST_RESPONSE_MS => PeerTier::Fast,
            _ => PeerTier::Standard,
        }
    }
}

// ============================================================================
// Banlist
// ============================================================================

#[derive(Default)]
pub struct MemoryBanlist {
    /// `None` expiry means banned forever.
    bans: Mutex<HashMap<Identity, Option<Instant>>>,
}

impl MemoryBanlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban_for(&self, peer: Identity, duration: Duration) {
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, Some(Instant::now() + duration));
    }

    pub fn ban_forever(&self, peer: Identity) {
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, None);
    }

    pub fn unban(&self, peer: &Identity) {
        self.bans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }
}

impl Banlist for MemoryBanlist {
    fn is_banned(&self, peer: &Identity) -> bool {
        let mut bans = self.bans.lock().unwrap_or_else(PoisonError::into_inner);
        match bans.get(peer) {
            None => false,
            Some(None) => true,
            Some(Some(until)) if *until > Instant::now() => true,
            Some(Some(_)) => {
                bans.remove(peer);
                false
            }
        }
    }

    fn is_banned_forever(&self, peer: &Identity) -> bool {
        matches!(
            self.bans.lock().unwrap_or_else(PoisonError::into_inner).get(peer),
            Some(None)
        )
    }
}

// ============================================================================
// Router Status
// ============================================================================

/// Router status with settable health that records every republish request.
#[derive(Default)]
pub struct StaticRouterStatus {
    health: Mutex<RouterHealth>,
    republished: Mutex<Vec<bool>>,
}

impl StaticRouterStatus {
    pub fn new(health: RouterHealth) -> Self {
        Self {
            health: Mutex::new(health),
            republished: Mutex::new(Vec::new()),
        }
    }

    pub fn set_health(&self, health: RouterHealth) {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = health;
    }

    /// Floodfill flags passed to `republish`, oldest first.
    pub fn republished(&self) -> Vec<bool> {
        self.republished.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RouterStatus for StaticRouterStatus {
    fn health(&self) -> RouterHealth {
        self.health.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn republish(&self, floodfill: bool) {
        self.republished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(floodfill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peers_are_untested() {
        let profiles = InMemoryProfiles::new();
        assert_eq!(profiles.tier(&Identity::random()), PeerTier::Untested);
        assert!(profiles.stats(&Identity::random()).is_none());
    }

    #[test]
    fn lookup_history_drives_tier() {
        let profiles = InMemoryProfiles::new();
        let fast = Identity::random();
        let failing = Identity::random();

        for _ in 0..3 {
            profiles.record_lookup_result(&fast, true, Some(Duration::from_millis(200)));
            profiles.record_lookup_result(&failing, false, None);
        }

        assert_eq!(profiles.tier(&fast), PeerTier::Fast);
        assert_eq!(profiles.tier(&failing), PeerTier::Failing);
        assert_eq!(profiles.stats(&fast).unwrap().avg_response_ms, Some(200));
        assert!(profiles.stats(&failing).unwrap().last_lookup_failure_ms.is_some());
    }

    #[test]
    fn unreachable_overrides_history() {
        let profiles = InMemoryProfiles::new();
        let peer = Identity::random();
        profiles.record_lookup_result(&peer, true, Some(Duration::from_millis(50)));
        profiles.mark_unreachable(peer, true);
        assert_eq!(profiles.tier(&peer), PeerTier::Unreachable);
    }

    #[test]
    fn store_results_are_timestamped() {
        let profiles = InMemoryProfiles::new();
        let peer = Identity::random();
        profiles.record_store_result(&peer, false);
        let stats = profiles.stats(&peer).unwrap();
        assert!(stats.last_store_failure_ms.is_some());
        assert!(stats.last_store_success_ms.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_bans_expire() {
        let banlist = MemoryBanlist::new();
        let peer = Identity::random();
        banlist.ban_for(peer, Duration::from_secs(60));
        assert!(banlist.is_banned(&peer));
        assert!(!banlist.is_banned_forever(&peer));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!banlist.is_banned(&peer));
    }

    #[test]
    fn permanent_bans() {
        let banlist = MemoryBanlist::new();
        let peer = Identity::random();
        banlist.ban_forever(peer);
        assert!(banlist.is_banned(&peer));
        assert!(banlist.is_banned_forever(&peer));
        banlist.unban(&peer);
        assert!(!banlist.is_banned(&peer));
    }
}
