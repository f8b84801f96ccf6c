//! Collaborator trait definitions for the network database.
//!
//! The database core never touches sockets, disks or reputation math
//! directly. Each of those concerns is reached through a trait defined here
//! and injected when a [`crate::NetDb`] is constructed.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Transport | [`Transport`] | move a message to a peer, report the local send result |
//! | Reliability | [`PeerReliability`] | per-peer lookup/store history and tiering |
//! | Banlist | [`Banlist`] | temporary and permanent peer bans |
//! | Key rotation | [`KeyRotation`] | daily routing key derivation |
//! | Router status | [`RouterStatus`] | health inputs for floodfill election |
//! | Persistence | [`Persistence`] | load at startup, best-effort save |

use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Identity, RoutingKey};
use crate::messages::NetDbMessage;
use crate::record::DatabaseEntry;

/// How the transport should carry a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Straight to the peer over a direct connection.
    Direct,
    /// Through one of our exploratory tunnels.
    Exploratory,
    /// To a reply tunnel named by the requester.
    ReplyTunnel(u32),
}

/// Message transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand `message` to the transport for delivery to `to`.
    ///
    /// Resolves with the local send result only; it says nothing about
    /// whether the peer received or acted on the message. An error (no
    /// connection, no tunnel) is treated like a peer timeout by callers.
    async fn send(&self, to: &Identity, message: NetDbMessage, route: Route) -> Result<()>;
}

// ============================================================================
// Peer Reliability
// ============================================================================

/// Observed history for one peer. Timestamps are milliseconds since epoch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerStats {
    pub last_lookup_success_ms: Option<u64>,
    pub last_lookup_failure_ms: Option<u64>,
    pub last_store_success_ms: Option<u64>,
    pub last_store_failure_ms: Option<u64>,
    pub avg_response_ms: Option<u64>,
    pub lookups: u64,
    pub lookup_failures: u64,
}

impl PeerStats {
    pub fn failure_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.lookup_failures as f64 / self.lookups as f64
        }
    }

    pub fn last_failure_ms(&self) -> Option<u64> {
        self.last_lookup_failure_ms.max(self.last_store_failure_ms)
    }

    pub fn last_success_ms(&self) -> Option<u64> {
        self.last_lookup_success_ms.max(self.last_store_success_ms)
    }
}

/// Coarse standing of a peer as seen by the reliability collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerTier {
    Fast,
    Standard,
    Untested,
    Failing,
    Unreachable,
}

impl PeerTier {
    /// Peers that flood-only lookups should query last.
    pub fn is_deprioritized(self) -> bool {
        matches!(self, PeerTier::Untested | PeerTier::Failing | PeerTier::Unreachable)
    }
}

/// Per-peer reputation bookkeeping, read and written by the database.
pub trait PeerReliability: Send + Sync + 'static {
    fn record_lookup_result(&self, peer: &Identity, success: bool, latency: Option<Duration>);

    fn record_store_result(&self, peer: &Identity, success: bool);

    fn stats(&self, peer: &Identity) -> Option<PeerStats>;

    fn tier(&self, peer: &Identity) -> PeerTier;
}

pub trait Banlist: Send + Sync + 'static {
    fn is_banned(&self, peer: &Identity) -> bool;

    fn is_banned_forever(&self, peer: &Identity) -> bool;
}

// ============================================================================
// Routing Key Rotation
// ============================================================================

pub trait KeyRotation: Send + Sync + 'static {
    fn routing_key_for(&self, key: &Identity, when: SystemTime) -> RoutingKey;

    fn time_until_rotation(&self) -> Duration;

    fn routing_key(&self, key: &Identity) -> RoutingKey {
        self.routing_key_for(key, SystemTime::now())
    }

    /// Routing key that will be in effect after the next rotation.
    fn next_routing_key(&self, key: &Identity) -> RoutingKey {
        let after = SystemTime::now() + self.time_until_rotation() + Duration::from_secs(1);
        self.routing_key_for(key, after)
    }
}

// ============================================================================
// Router Status (floodfill election inputs)
// ============================================================================

/// Local health signals consumed by floodfill election.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouterHealth {
    pub uptime: Duration,
    pub bandwidth_class: Option<char>,
    pub job_lag: Duration,
    pub active_peers: usize,
    pub participating_tunnels: usize,
    pub clock_skew: Duration,
    pub reachable_without_introducers: bool,
}

pub trait RouterStatus: Send + Sync + 'static {
    fn health(&self) -> RouterHealth;

    /// Re-sign and republish our own descriptor with the floodfill flag set
    /// or cleared.
    fn republish(&self, floodfill: bool);
}

// ============================================================================
// Persistence
// ============================================================================

#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn load(&self) -> Result<Vec<DatabaseEntry>>;

    async fn save(&self, entry: &DatabaseEntry) -> Result<()>;

    async fn remove(&self, key: &Identity) -> Result<()>;
}

/// Persistence that keeps nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPersistence;

#[async_trait]
impl Persistence for NoPersistence {
    async fn load(&self) -> Result<Vec<DatabaseEntry>> {
        Ok(Vec::new())
    }

    async fn save(&self, _entry: &DatabaseEntry) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _key: &Identity) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_failure_rate_and_latest_outcomes() {
        let stats = PeerStats {
            last_lookup_failure_ms: Some(10),
            last_store_failure_ms: Some(30),
            last_lookup_success_ms: Some(20),
            lookups: 4,
            lookup_failures: 1,
            ..PeerStats::default()
        };
        assert_eq!(stats.failure_rate(), 0.25);
        assert_eq!(stats.last_failure_ms(), Some(30));
        assert_eq!(stats.last_success_ms(), Some(20));
        assert_eq!(PeerStats::default().failure_rate(), 0.0);
    }

    #[test]
    fn deprioritized_tiers() {
        assert!(PeerTier::Untested.is_deprioritized());
        assert!(PeerTier::Unreachable.is_deprioritized());
        assert!(!PeerTier::Fast.is_deprioritized());
    }
}
