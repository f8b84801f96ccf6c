//! # Network Database Configuration
//!
//! Every tunable lives in [`NetDbConfig`]. Defaults come from the named
//! constants below; a TOML file may override any subset of fields. Durations
//! are written in milliseconds:
//!
//! ```toml
//! floodfill = "auto"
//!
//! [lookup]
//! strategy = "iterative"
//! max_search_time = 20000
//!
//! [store]
//! redundancy = 2
//!
//! [explore]
//! min_interval = 60000
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::search::LookupStrategy;

// ============================================================================
// Lookup defaults
// ============================================================================

/// Total peers an iterative walk may query.
pub const DEFAULT_TOTAL_SEARCH_LIMIT: usize = 5;
/// Total peers queried when we are ourselves a long-running floodfill.
pub const DEFAULT_FLOODFILL_SEARCH_LIMIT: usize = 3;
/// Truly concurrent outstanding queries in an iterative walk.
pub const DEFAULT_MAX_CONCURRENT: usize = 1;
/// Upper bound on the per-try timeout.
pub const DEFAULT_SINGLE_SEARCH_TIME: Duration = Duration::from_secs(3);
/// Lower bound on the adaptive per-try timeout.
pub const DEFAULT_MIN_SINGLE_SEARCH_TIME: Duration = Duration::from_millis(500);
/// Wall-clock cap on any lookup regardless of the caller's timeout.
pub const DEFAULT_MAX_SEARCH_TIME: Duration = Duration::from_secs(30);
/// Random known routers tried when no floodfill is known at all.
pub const DEFAULT_NON_FLOODFILL_FALLBACK: usize = 3;
/// Concurrent queries in a flood-only lookup.
pub const DEFAULT_FLOOD_ONLY_CONCURRENT: usize = 2;
/// Below this many known floodfills, search replies are followed up.
pub const DEFAULT_FLOOD_ONLY_FOLLOWUP_THRESHOLD: usize = 4;
pub const DEFAULT_CLASSIC_BREADTH: usize = 3;
pub const DEFAULT_CLASSIC_PEER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLASSIC_FLOODFILL_PEER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLASSIC_MIN_PEER_TIMEOUT: Duration = Duration::from_millis(2_500);
/// Timeout of one-shot follow-up lookups.
pub const DEFAULT_SINGLE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Floodfills named in a search reply we send.
pub const DEFAULT_REPLY_PEERS: usize = 3;

// ============================================================================
// Store defaults
// ============================================================================

pub const DEFAULT_REDUNDANCY: usize = 4;
pub const DEFAULT_PARALLELIZATION: usize = 4;
/// A store gives up after sending to more than this many peers.
pub const DEFAULT_MAX_PEERS_SENT: usize = 10;
pub const DEFAULT_STORE_PEER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_VERIFY_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(20);
/// Distinct verifiers asked before the store is re-sent.
pub const DEFAULT_MAX_VERIFY_PEERS: usize = 4;
/// Re-sends after failed verification; bounds the heal loop.
pub const DEFAULT_MAX_RESENDS: usize = 1;
pub const DEFAULT_FLOOD_PEERS: usize = 3;
pub const DEFAULT_FLOOD_NEXT_DAY_PEERS: usize = 2;
/// How close to key rotation floods also target tomorrow's neighbourhood.
pub const DEFAULT_ROTATION_ADVANCE: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// Selection defaults
// ============================================================================

pub const DEFAULT_GOOD_STORE_FAILURE_WINDOW: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_GOOD_LOOKUP_FAILURE_WINDOW: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_OK_FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_GOOD_RESPONSE: Duration = Duration::from_secs(5);
pub const DEFAULT_MIN_FAIL_RATE_CEILING: f64 = 0.20;
pub const DEFAULT_FAIL_RATE_MULTIPLIER: f64 = 1.5;
/// Floodfills whose descriptor is older than this are ranked last.
pub const DEFAULT_STALE_PUBLISH_AGE: Duration = Duration::from_secs(8 * 60 * 60);

// ============================================================================
// Data store defaults
// ============================================================================

/// SECURITY: Lease sets claiming to live longer than this are refused.
pub const DEFAULT_MAX_LEASE_FUTURE: Duration = Duration::from_secs(24 * 60 * 60);
/// SECURITY: Records stamped further than this in the future are refused.
pub const DEFAULT_CLOCK_FUDGE: Duration = Duration::from_secs(60);
pub const DEFAULT_ROUTER_EXPIRY: Duration = Duration::from_secs(27 * 60 * 60);
/// `fail()` never drops routers below this many.
pub const DEFAULT_MIN_REMAINING_ROUTERS: usize = 5;
/// `fail()` is ignored for routers this soon after start.
pub const DEFAULT_DONT_FAIL_PERIOD: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// Throttle defaults
// ============================================================================

pub const DEFAULT_LOOKUP_WINDOW: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_MAX_LOOKUPS_FLOODFILL: u32 = 14;
pub const DEFAULT_MAX_LOOKUPS: u32 = 3;
pub const DEFAULT_FLOOD_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_FLOODS: u32 = 3;
pub const DEFAULT_NEGATIVE_WINDOW: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_NEGATIVE_MAX_FAILS: u32 = 3;
/// SECURITY: Bounds memory of every throttle table.
pub const DEFAULT_MAX_TRACKED: usize = 8_192;

// ============================================================================
// Election defaults
// ============================================================================

pub const DEFAULT_ELECTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_ELECTION_MIN_UPTIME: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_CAPACITY_CLASSES: &str = "OPX";
pub const DEFAULT_MIN_FLOODFILLS: usize = 600;
pub const DEFAULT_MAX_FLOODFILLS: usize = 1_200;
pub const DEFAULT_MAX_JOB_LAG: Duration = Duration::from_millis(50);
pub const DEFAULT_MIN_KNOWN_ROUTERS: usize = 500;
pub const DEFAULT_MIN_ACTIVE_PEERS: usize = 50;
pub const DEFAULT_MIN_PARTICIPATING_TUNNELS: usize = 50;
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(10);
/// Minimum time between two floodfill status flips.
pub const DEFAULT_MIN_CHANGE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Floodfills published within this window count as seen recently.
pub const DEFAULT_HEALTHY_PUBLISH_AGE: Duration = Duration::from_secs(3 * 60 * 60);

// ============================================================================
// Exploration defaults
// ============================================================================

/// Delay before the first exploration after start.
pub const DEFAULT_EXPLORE_START_DELAY: Duration = Duration::from_secs(5 * 60);
/// Exploration period while we know few routers.
pub const DEFAULT_EXPLORE_MIN_INTERVAL: Duration = Duration::from_secs(60);
/// Exploration period once the routing table is well filled.
pub const DEFAULT_EXPLORE_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Below this many known routers the short period applies.
pub const DEFAULT_EXPLORE_LOW_ROUTERS: usize = 250;
/// Random keys explored per run.
pub const DEFAULT_EXPLORE_KEYS_PER_RUN: usize = 3;
/// Buckets holding fewer peers than this are explored.
pub const DEFAULT_EXPLORE_SPARSE_BUCKET: usize = 4;
/// Wall-clock budget of one exploration walk.
pub const DEFAULT_EXPLORE_TIMEOUT: Duration = Duration::from_secs(30);
/// Known peers nearest the key sent as the exclusion list.
pub const DEFAULT_EXPLORE_DONT_INCLUDE: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloodfillMode {
    /// Let the election loop decide.
    #[default]
    Auto,
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetDbConfig {
    pub floodfill: FloodfillMode,
    pub lookup: LookupConfig,
    pub store: StoreConfig,
    pub selection: SelectionConfig,
    pub data: DataStoreConfig,
    pub throttle: ThrottleConfig,
    pub election: ElectionConfig,
    pub explore: ExploreConfig,
}

impl NetDbConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: NetDbConfig = toml::from_str(s).context("invalid netdb configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.lookup.max_concurrent >= 1, "lookup.max_concurrent must be at least 1");
        ensure!(self.lookup.total_search_limit >= 1, "lookup.total_search_limit must be at least 1");
        ensure!(
            self.lookup.min_single_search_time <= self.lookup.single_search_time,
            "lookup.min_single_search_time exceeds lookup.single_search_time"
        );
        ensure!(self.store.redundancy >= 1, "store.redundancy must be at least 1");
        ensure!(self.store.parallelization >= 1, "store.parallelization must be at least 1");
        ensure!(
            self.election.min_floodfills <= self.election.max_floodfills,
            "election.min_floodfills exceeds election.max_floodfills"
        );
        ensure!(self.throttle.max_tracked >= 1, "throttle.max_tracked must be at least 1");
        // Periods of background tasks; a zero period would stall the timer.
        ensure!(!self.throttle.lookup_window.is_zero(), "throttle.lookup_window must be non-zero");
        ensure!(!self.throttle.flood_window.is_zero(), "throttle.flood_window must be non-zero");
        ensure!(!self.throttle.negative_window.is_zero(), "throttle.negative_window must be non-zero");
        ensure!(!self.election.interval.is_zero(), "election.interval must be non-zero");
        ensure!(!self.explore.min_interval.is_zero(), "explore.min_interval must be non-zero");
        ensure!(!self.explore.interval.is_zero(), "explore.interval must be non-zero");
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LookupConfig {
    pub strategy: LookupStrategy,
    pub total_search_limit: usize,
    pub floodfill_search_limit: usize,
    pub max_concurrent: usize,
    #[serde(with = "duration_ms")]
    pub single_search_time: Duration,
    #[serde(with = "duration_ms")]
    pub min_single_search_time: Duration,
    #[serde(with = "duration_ms")]
    pub max_search_time: Duration,
    pub non_floodfill_fallback: usize,
    pub flood_only_concurrent: usize,
    pub flood_only_followup_threshold: usize,
    pub classic_breadth: usize,
    #[serde(with = "duration_ms")]
    pub classic_peer_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub classic_floodfill_peer_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub classic_min_peer_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub single_lookup_timeout: Duration,
    pub reply_peers: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            strategy: LookupStrategy::Iterative,
            total_search_limit: DEFAULT_TOTAL_SEARCH_LIMIT,
            floodfill_search_limit: DEFAULT_FLOODFILL_SEARCH_LIMIT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            single_search_time: DEFAULT_SINGLE_SEARCH_TIME,
            min_single_search_time: DEFAULT_MIN_SINGLE_SEARCH_TIME,
            max_search_time: DEFAULT_MAX_SEARCH_TIME,
            non_floodfill_fallback: DEFAULT_NON_FLOODFILL_FALLBACK,
            flood_only_concurrent: DEFAULT_FLOOD_ONLY_CONCURRENT,
            flood_only_followup_threshold: DEFAULT_FLOOD_ONLY_FOLLOWUP_THRESHOLD,
            classic_breadth: DEFAULT_CLASSIC_BREADTH,
            classic_peer_timeout: DEFAULT_CLASSIC_PEER_TIMEOUT,
            classic_floodfill_peer_timeout: DEFAULT_CLASSIC_FLOODFILL_PEER_TIMEOUT,
            classic_min_peer_timeout: DEFAULT_CLASSIC_MIN_PEER_TIMEOUT,
            single_lookup_timeout: DEFAULT_SINGLE_LOOKUP_TIMEOUT,
            reply_peers: DEFAULT_REPLY_PEERS,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub redundancy: usize,
    pub parallelization: usize,
    pub max_peers_sent: usize,
    #[serde(with = "duration_ms")]
    pub peer_timeout: Duration,
    /// Count a store as accepted only once a delivery ack arrives.
    pub require_delivery_ack: bool,
    #[serde(with = "duration_ms")]
    pub verify_delay: Duration,
    #[serde(with = "duration_ms")]
    pub verify_timeout: Duration,
    pub max_verify_peers: usize,
    pub max_resends: usize,
    pub flood_peers: usize,
    pub flood_next_day_peers: usize,
    #[serde(with = "duration_ms")]
    pub rotation_advance: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redundancy: DEFAULT_REDUNDANCY,
            parallelization: DEFAULT_PARALLELIZATION,
            max_peers_sent: DEFAULT_MAX_PEERS_SENT,
            peer_timeout: DEFAULT_STORE_PEER_TIMEOUT,
            require_delivery_ack: false,
            verify_delay: DEFAULT_VERIFY_DELAY,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            max_verify_peers: DEFAULT_MAX_VERIFY_PEERS,
            max_resends: DEFAULT_MAX_RESENDS,
            flood_peers: DEFAULT_FLOOD_PEERS,
            flood_next_day_peers: DEFAULT_FLOOD_NEXT_DAY_PEERS,
            rotation_advance: DEFAULT_ROTATION_ADVANCE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    #[serde(with = "duration_ms")]
    pub good_store_failure_window: Duration,
    #[serde(with = "duration_ms")]
    pub good_lookup_failure_window: Duration,
    #[serde(with = "duration_ms")]
    pub ok_failure_window: Duration,
    #[serde(with = "duration_ms")]
    pub max_good_response: Duration,
    pub min_fail_rate_ceiling: f64,
    pub fail_rate_multiplier: f64,
    #[serde(with = "duration_ms")]
    pub stale_publish_age: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            good_store_failure_window: DEFAULT_GOOD_STORE_FAILURE_WINDOW,
            good_lookup_failure_window: DEFAULT_GOOD_LOOKUP_FAILURE_WINDOW,
            ok_failure_window: DEFAULT_OK_FAILURE_WINDOW,
            max_good_response: DEFAULT_MAX_GOOD_RESPONSE,
            min_fail_rate_ceiling: DEFAULT_MIN_FAIL_RATE_CEILING,
            fail_rate_multiplier: DEFAULT_FAIL_RATE_MULTIPLIER,
            stale_publish_age: DEFAULT_STALE_PUBLISH_AGE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataStoreConfig {
    #[serde(with = "duration_ms")]
    pub max_lease_future: Duration,
    #[serde(with = "duration_ms")]
    pub clock_fudge: Duration,
    #[serde(with = "duration_ms")]
    pub router_expiry: Duration,
    pub min_remaining_routers: usize,
    #[serde(with = "duration_ms")]
    pub dont_fail_period: Duration,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            max_lease_future: DEFAULT_MAX_LEASE_FUTURE,
            clock_fudge: DEFAULT_CLOCK_FUDGE,
            router_expiry: DEFAULT_ROUTER_EXPIRY,
            min_remaining_routers: DEFAULT_MIN_REMAINING_ROUTERS,
            dont_fail_period: DEFAULT_DONT_FAIL_PERIOD,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    #[serde(with = "duration_ms")]
    pub lookup_window: Duration,
    pub max_lookups_floodfill: u32,
    pub max_lookups: u32,
    #[serde(with = "duration_ms")]
    pub flood_window: Duration,
    pub max_floods: u32,
    #[serde(with = "duration_ms")]
    pub negative_window: Duration,
    pub negative_max_fails: u32,
    pub max_tracked: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            lookup_window: DEFAULT_LOOKUP_WINDOW,
            max_lookups_floodfill: DEFAULT_MAX_LOOKUPS_FLOODFILL,
            max_lookups: DEFAULT_MAX_LOOKUPS,
            flood_window: DEFAULT_FLOOD_WINDOW,
            max_floods: DEFAULT_MAX_FLOODS,
            negative_window: DEFAULT_NEGATIVE_WINDOW,
            negative_max_fails: DEFAULT_NEGATIVE_MAX_FAILS,
            max_tracked: DEFAULT_MAX_TRACKED,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ElectionConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    #[serde(with = "duration_ms")]
    pub min_uptime: Duration,
    /// Bandwidth class letters allowed to volunteer.
    pub capacity_classes: String,
    pub min_floodfills: usize,
    pub max_floodfills: usize,
    #[serde(with = "duration_ms")]
    pub max_job_lag: Duration,
    pub min_known_routers: usize,
    pub min_active_peers: usize,
    pub min_participating_tunnels: usize,
    #[serde(with = "duration_ms")]
    pub max_clock_skew: Duration,
    #[serde(with = "duration_ms")]
    pub min_change_interval: Duration,
    #[serde(with = "duration_ms")]
    pub healthy_publish_age: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_ELECTION_INTERVAL,
            min_uptime: DEFAULT_ELECTION_MIN_UPTIME,
            capacity_classes: DEFAULT_CAPACITY_CLASSES.to_string(),
            min_floodfills: DEFAULT_MIN_FLOODFILLS,
            max_floodfills: DEFAULT_MAX_FLOODFILLS,
            max_job_lag: DEFAULT_MAX_JOB_LAG,
            min_known_routers: DEFAULT_MIN_KNOWN_ROUTERS,
            min_active_peers: DEFAULT_MIN_ACTIVE_PEERS,
            min_participating_tunnels: DEFAULT_MIN_PARTICIPATING_TUNNELS,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            min_change_interval: DEFAULT_MIN_CHANGE_INTERVAL,
            healthy_publish_age: DEFAULT_HEALTHY_PUBLISH_AGE,
        }
    }
}

/// Periodic exploration of sparse routing buckets.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExploreConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub start_delay: Duration,
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    pub low_routers: usize,
    pub keys_per_run: usize,
    pub sparse_bucket: usize,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub dont_include: usize,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay: DEFAULT_EXPLORE_START_DELAY,
            min_interval: DEFAULT_EXPLORE_MIN_INTERVAL,
            interval: DEFAULT_EXPLORE_INTERVAL,
            low_routers: DEFAULT_EXPLORE_LOW_ROUTERS,
            keys_per_run: DEFAULT_EXPLORE_KEYS_PER_RUN,
            sparse_bucket: DEFAULT_EXPLORE_SPARSE_BUCKET,
            timeout: DEFAULT_EXPLORE_TIMEOUT,
            dont_include: DEFAULT_EXPLORE_DONT_INCLUDE,
        }
    }
}

impl ExploreConfig {
    /// Time until the next run given how many routers we know.
    pub fn next_delay(&self, known_routers: usize) -> Duration {
        if known_routers < self.low_routers {
            self.min_interval
        } else {
            self.interval
        }
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = NetDbConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.floodfill, FloodfillMode::Auto);
        assert_eq!(config.lookup.strategy, LookupStrategy::Iterative);
        assert_eq!(config.store.redundancy, DEFAULT_REDUNDANCY);
    }

    #[test]
    fn toml_overrides_subset() {
        let config = NetDbConfig::from_toml_str(
            r#"
            floodfill = "enabled"

            [lookup]
            strategy = "flood_only"
            max_search_time = 20000

            [store]
            redundancy = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.floodfill, FloodfillMode::Enabled);
        assert_eq!(config.lookup.strategy, LookupStrategy::FloodOnly);
        assert_eq!(config.lookup.max_search_time, Duration::from_secs(20));
        assert_eq!(config.lookup.total_search_limit, DEFAULT_TOTAL_SEARCH_LIMIT);
        assert_eq!(config.store.redundancy, 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(NetDbConfig::from_toml_str("[lookup]\nbogus = 1\n").is_err());
    }

    #[test]
    fn zero_periods_are_rejected() {
        for (section, field) in [
            ("election", "interval"),
            ("throttle", "lookup_window"),
            ("throttle", "flood_window"),
            ("throttle", "negative_window"),
            ("explore", "min_interval"),
            ("explore", "interval"),
        ] {
            let err = NetDbConfig::from_toml_str(&format!("[{section}]\n{field} = 0\n")).unwrap_err();
            assert!(
                format!("{err:#}").contains(&format!("{section}.{field}")),
                "{section}.{field}: {err:#}"
            );
        }
    }

    #[test]
    fn exploration_speeds_up_while_few_routers_are_known() {
        let explore = ExploreConfig::default();
        assert_eq!(explore.next_delay(10), DEFAULT_EXPLORE_MIN_INTERVAL);
        assert_eq!(explore.next_delay(DEFAULT_EXPLORE_LOW_ROUTERS), DEFAULT_EXPLORE_INTERVAL);

        let config = NetDbConfig::from_toml_str("[explore]\nenabled = false\nkeys_per_run = 1\n").unwrap();
        assert!(!config.explore.enabled);
        assert_eq!(config.explore.keys_per_run, 1);
        assert_eq!(config.explore.timeout, DEFAULT_EXPLORE_TIMEOUT);
    }

    #[test]
    fn inconsistent_election_range_is_rejected() {
        let err = NetDbConfig::from_toml_str(
            "[election]\nmin_floodfills = 10\nmax_floodfills = 5\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("min_floodfills"));
    }
}
