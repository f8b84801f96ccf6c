//! # Peer Selection
//!
//! Turns "closest to this routing key" plus reliability history into an
//! ordered candidate list.
//!
//! Floodfill candidates come from the data store's floodfill index, are
//! sorted by XOR distance to the routing key, then split into three quality
//! tiers which are drained in order:
//!
//! | Tier | Meaning |
//! |------|---------|
//! | good | no recent store or lookup failure, acceptable response time, failure rate under a ceiling derived from the floodfill average |
//! | ok   | last outcome was a success, or the last failure is old |
//! | bad  | everything else, including descriptors not republished for a long time |
//!
//! Within a tier peers stay in distance order, so traffic leans toward
//! reliable peers without giving up progress toward the key.
//!
//! SECURITY: selection never returns the local identity or a banned peer.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::config::SelectionConfig;
use crate::data_store::DataStore;
use crate::identity::{now_ms, Identity, RoutingKey};
use crate::protocols::{Banlist, PeerReliability, PeerStats};
use crate::routing_table::RoutingTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QualityTier {
    Good,
    Ok,
    Bad,
}

pub struct PeerSelector<'a> {
    local: Identity,
    routing: &'a RoutingTable,
    data: &'a DataStore,
    reliability: &'a dyn PeerReliability,
    banlist: &'a dyn Banlist,
    config: &'a SelectionConfig,
}

impl<'a> PeerSelector<'a> {
    pub fn new(
        routing: &'a RoutingTable,
        data: &'a DataStore,
        reliability: &'a dyn PeerReliability,
        banlist: &'a dyn Banlist,
        config: &'a SelectionConfig,
    ) -> Self {
        Self {
            local: *routing.local(),
            routing,
            data,
            reliability,
            banlist,
            config,
        }
    }

    /// Up to `count` known peers nearest `key`, any capability.
    pub fn select_nearest(
        &self,
        key: &RoutingKey,
        count: usize,
        exclude: &HashSet<Identity>,
    ) -> Vec<Identity> {
        let mut peers = Vec::new();
        self.routing.get_all(|peer| {
            if self.eligible(peer, exclude) {
                peers.push(*peer);
            }
        });
        sort_by_distance(key, &mut peers);
        peers.truncate(count);
        peers
    }

    /// Up to `count` floodfills nearest `key`, good tier first, then ok, then bad.
    pub fn select_floodfill_participants(
        &self,
        key: &RoutingKey,
        count: usize,
        exclude: &HashSet<Identity>,
    ) -> Vec<Identity> {
        let mut candidates: Vec<Identity> = self
            .data
            .floodfills()
            .into_iter()
            .filter(|p| self.eligible(p, exclude))
            .collect();
        sort_by_distance(key, &mut candidates);

        let now = now_ms();
        let ceiling = self.fail_rate_ceiling(&candidates);
        let mut good = Vec::new();
        let mut ok = Vec::new();
        let mut bad = Vec::new();
        for peer in candidates {
            match self.classify(&peer, now, ceiling) {
                QualityTier::Good => {
                    good.push(peer);
                    if good.len() >= count {
                        break;
                    }
                }
                QualityTier::Ok => ok.push(peer),
                QualityTier::Bad => bad.push(peer),
            }
        }

        good.into_iter().chain(ok).chain(bad).take(count).collect()
    }

    /// Every known floodfill that is not permanently banned, in no order.
    pub fn select_all_floodfill_participants(&self, exclude: &HashSet<Identity>) -> Vec<Identity> {
        self.data
            .floodfills()
            .into_iter()
            .filter(|p| *p != self.local && !exclude.contains(p) && !self.banlist.is_banned_forever(p))
            .collect()
    }

    /// Quality tier of one floodfill.
    pub fn classify(&self, peer: &Identity, now: u64, fail_ceiling: f64) -> QualityTier {
        let stale_ms = self.config.stale_publish_age.as_millis() as u64;
        let published = self.data.router_info(peer).map(|ri| ri.published);
        match published {
            Some(p) if now.saturating_sub(p) <= stale_ms => {}
            _ => return QualityTier::Bad,
        }

        let Some(stats) = self.reliability.stats(peer) else {
            return QualityTier::Good;
        };
        if self.is_good(&stats, now, fail_ceiling) {
            return QualityTier::Good;
        }
        let ok_window = self.config.ok_failure_window.as_millis() as u64;
        let last_was_success = match (stats.last_success_ms(), stats.last_failure_ms()) {
            (Some(s), Some(f)) => s > f,
            (_, None) => true,
            (None, Some(_)) => false,
        };
        let failure_is_old = stats
            .last_failure_ms()
            .map_or(true, |f| now.saturating_sub(f) > ok_window);
        if last_was_success || failure_is_old {
            QualityTier::Ok
        } else {
            QualityTier::Bad
        }
    }

    /// `max(min ceiling, multiplier × average failure rate)` over peers with history.
    pub fn fail_rate_ceiling(&self, peers: &[Identity]) -> f64 {
        let rates: Vec<f64> = peers
            .iter()
            .filter_map(|p| self.reliability.stats(p))
            .filter(|s| s.lookups > 0)
            .map(|s| s.failure_rate())
            .collect();
        if rates.is_empty() {
            return self.config.min_fail_rate_ceiling;
        }
        let avg = rates.iter().sum::<f64>() / rates.len() as f64;
        (avg * self.config.fail_rate_multiplier).max(self.config.min_fail_rate_ceiling)
    }

    fn is_good(&self, stats: &PeerStats, now: u64, fail_ceiling: f64) -> bool {
        let within = |ts: Option<u64>, window: std::time::Duration| {
            ts.is_some_and(|t| now.saturating_sub(t) <= window.as_millis() as u64)
        };
        if within(stats.last_store_failure_ms, self.config.good_store_failure_window) {
            return false;
        }
        if within(stats.last_lookup_failure_ms, self.config.good_lookup_failure_window) {
            return false;
        }
        let max_response = self.config.max_good_response.as_millis() as u64;
        if stats.avg_response_ms.is_some_and(|avg| avg > max_response) {
            return false;
        }
        stats.failure_rate() <= fail_ceiling
    }

    fn eligible(&self, peer: &Identity, exclude: &HashSet<Identity>) -> bool {
        *peer != self.local
            && !exclude.contains(peer)
            && !self.banlist.is_banned(peer)
            && !self.banlist.is_banned_forever(peer)
    }
}

/// Sort by XOR distance to `key`; equal distances end up in random order.
pub fn sort_by_distance(key: &RoutingKey, peers: &mut [Identity]) {
    peers.shuffle(&mut rand::thread_rng());
    peers.sort_by(|a, b| key.closer(a, b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataStoreConfig;
    use crate::identity::{distance_cmp, Keypair};
    use crate::profiles::{InMemoryProfiles, MemoryBanlist};
    use crate::record::{RouterAddress, RouterInfo};

    const HOUR_MS: u64 = 60 * 60 * 1000;
    const MINUTE_MS: u64 = 60 * 1000;

    struct Fixture {
        local: Keypair,
        routing: RoutingTable,
        data: DataStore,
        profiles: InMemoryProfiles,
        banlist: MemoryBanlist,
        config: SelectionConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let local = Keypair::generate();
            Self {
                routing: RoutingTable::new(local.identity()),
                local,
                data: DataStore::new(DataStoreConfig::default()),
                profiles: InMemoryProfiles::new(),
                banlist: MemoryBanlist::new(),
                config: SelectionConfig::default(),
            }
        }

        fn add_router(&self, caps: &str, age_ms: u64) -> Identity {
            let keypair = Keypair::generate();
            let info = RouterInfo::new_signed(
                &keypair,
                vec![RouterAddress::direct("SSU2", "10.1.2.3:4567".parse().unwrap())],
                caps,
                now_ms() - age_ms,
            );
            assert!(self.data.put(keypair.identity(), info.into()).is_accepted());
            self.routing.add(keypair.identity());
            keypair.identity()
        }

        fn selector(&self) -> PeerSelector<'_> {
            PeerSelector::new(&self.routing, &self.data, &self.profiles, &self.banlist, &self.config)
        }
    }

    #[test]
    fn good_tier_ties_are_broken_by_distance() {
        let fx = Fixture::new();
        let f1 = fx.add_router("fO", HOUR_MS);
        let f2 = fx.add_router("fO", 4 * HOUR_MS);

        // A key that sits on top of f1 is always closer to f1 than to f2.
        let key = RoutingKey::new(f1);
        assert!(distance_cmp(&key.distance_to(&f1), &key.distance_to(&f2)).is_lt());
        assert_eq!(fx.selector().select_floodfill_participants(&key, 1, &HashSet::new()), vec![f1]);

        let key = RoutingKey::new(f2);
        assert_eq!(fx.selector().select_floodfill_participants(&key, 1, &HashSet::new()), vec![f2]);
    }

    #[test]
    fn recently_failing_peer_is_ranked_after_good_ones() {
        let fx = Fixture::new();
        let flaky = fx.add_router("fO", HOUR_MS);
        let solid = fx.add_router("fO", HOUR_MS);
        fx.profiles.set_stats(
            flaky,
            PeerStats {
                last_lookup_failure_ms: Some(now_ms() - MINUTE_MS),
                lookups: 4,
                lookup_failures: 3,
                ..PeerStats::default()
            },
        );

        let key = RoutingKey::new(flaky);
        let picked = fx.selector().select_floodfill_participants(&key, 2, &HashSet::new());
        assert_eq!(picked, vec![solid, flaky]);
        assert_eq!(fx.selector().classify(&flaky, now_ms(), 0.2), QualityTier::Bad);
    }

    #[test]
    fn old_failure_followed_by_success_is_ok_tier() {
        let fx = Fixture::new();
        let peer = fx.add_router("fO", HOUR_MS);
        let now = now_ms();
        fx.profiles.set_stats(
            peer,
            PeerStats {
                last_lookup_failure_ms: Some(now - 20 * MINUTE_MS),
                last_lookup_success_ms: Some(now - 5 * MINUTE_MS),
                lookups: 10,
                lookup_failures: 1,
                ..PeerStats::default()
            },
        );
        assert_eq!(fx.selector().classify(&peer, now, 0.2), QualityTier::Ok);
    }

    #[test]
    fn stale_descriptor_is_bad_tier() {
        let fx = Fixture::new();
        let peer = fx.add_router("fO", 9 * HOUR_MS);
        assert_eq!(fx.selector().classify(&peer, now_ms(), 0.2), QualityTier::Bad);
    }

    #[test]
    fn fail_rate_ceiling_tracks_network_average() {
        let fx = Fixture::new();
        let a = fx.add_router("fO", HOUR_MS);
        let b = fx.add_router("fO", HOUR_MS);
        for (peer, failures) in [(a, 4), (b, 2)] {
            fx.profiles.set_stats(
                peer,
                PeerStats { lookups: 10, lookup_failures: failures, ..PeerStats::default() },
            );
        }
        let ceiling = fx.selector().fail_rate_ceiling(&[a, b]);
        assert!((ceiling - 0.45).abs() < 1e-9);
        assert_eq!(fx.selector().fail_rate_ceiling(&[]), 0.2);
    }

    #[test]
    fn selection_skips_local_banned_and_non_floodfills() {
        let fx = Fixture::new();
        let local = fx.local.identity();
        let plain = fx.add_router("O", HOUR_MS);
        let banned = fx.add_router("fO", HOUR_MS);
        let forever = fx.add_router("fO", HOUR_MS);
        let fine = fx.add_router("fO", HOUR_MS);
        fx.banlist.ban_for(banned, std::time::Duration::from_secs(600));
        fx.banlist.ban_forever(forever);

        let key = RoutingKey::new(local);
        let picked = fx.selector().select_floodfill_participants(&key, 10, &HashSet::new());
        assert_eq!(picked, vec![fine]);

        let nearest = fx.selector().select_nearest(&key, 10, &HashSet::new());
        assert!(nearest.contains(&plain));
        assert!(!nearest.contains(&local));
        assert!(!nearest.contains(&forever));

        // Temporarily banned floodfills still count toward the population.
        let all: HashSet<_> = fx
            .selector()
            .select_all_floodfill_participants(&HashSet::new())
            .into_iter()
            .collect();
        assert_eq!(all, HashSet::from([banned, fine]));
    }

    #[test]
    fn select_nearest_orders_by_distance_and_honours_exclusions() {
        let fx = Fixture::new();
        let peers: Vec<_> = (0..6).map(|_| fx.add_router("O", HOUR_MS)).collect();
        let key = RoutingKey::new(Identity::random());
        let exclude = HashSet::from([peers[0]]);

        let picked = fx.selector().select_nearest(&key, 3, &exclude);
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&peers[0]));
        for pair in picked.windows(2) {
            assert!(key.closer(&pair[0], &pair[1]).is_lt());
        }
    }
}
