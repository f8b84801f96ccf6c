//! Shared state of one network database instance.
//!
//! Lookup strategies, the store pipeline, the election loop and the public
//! facade all work against one [`NetDbContext`]. Each table inside carries
//! its own lock; nothing here is held across a network send.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::config::NetDbConfig;
use crate::data_store::{DataStore, PutOutcome};
use crate::identity::{Identity, RoutingKey};
use crate::messages::{DatabaseLookup, NetDbMessage, MAX_DONT_INCLUDE};
use crate::peer_selector::PeerSelector;
use crate::profiles::{InMemoryProfiles, MemoryBanlist, StaticRouterStatus};
use crate::protocols::{
    Banlist, KeyRotation, NoPersistence, PeerReliability, Persistence, Route, RouterStatus,
    Transport,
};
use crate::record::{DatabaseEntry, LookupKind, RecordKind};
use crate::replies::ReplyRegistry;
use crate::routing_key::DailyRoutingKey;
use crate::routing_table::RoutingTable;
use crate::throttle::Throttles;

/// Local send result for one peer, reported back to the task that sent it.
pub type SendResult = (Identity, bool);

/// Router descriptor traffic goes direct, everything else through a tunnel.
pub fn lookup_route(kind: LookupKind) -> Route {
    match kind {
        LookupKind::RouterInfo => Route::Direct,
        _ => Route::Exploratory,
    }
}

/// Everything the database consumes but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub reliability: Arc<dyn PeerReliability>,
    pub banlist: Arc<dyn Banlist>,
    pub keys: Arc<dyn KeyRotation>,
    pub status: Arc<dyn RouterStatus>,
    pub persistence: Arc<dyn Persistence>,
}

impl Collaborators {
    /// In-memory profiles and banlist, daily key rotation, no persistence.
    pub fn in_memory() -> Self {
        Self {
            reliability: Arc::new(InMemoryProfiles::new()),
            banlist: Arc::new(MemoryBanlist::new()),
            keys: Arc::new(DailyRoutingKey::new()),
            status: Arc::new(StaticRouterStatus::default()),
            persistence: Arc::new(NoPersistence),
        }
    }
}

pub struct NetDbContext<T: Transport> {
    pub local: Identity,
    pub config: NetDbConfig,
    pub routing: RoutingTable,
    pub data: DataStore,
    pub transport: Arc<T>,
    pub reliability: Arc<dyn PeerReliability>,
    pub banlist: Arc<dyn Banlist>,
    pub keys: Arc<dyn KeyRotation>,
    pub status: Arc<dyn RouterStatus>,
    pub persistence: Arc<dyn Persistence>,
    pub replies: Arc<ReplyRegistry>,
    pub throttles: Arc<Throttles>,
    floodfill: AtomicBool,
    started: Instant,
    next_token: AtomicU64,
}

impl<T: Transport> NetDbContext<T> {
    pub fn new(local: Identity, config: NetDbConfig, transport: Arc<T>, collab: Collaborators) -> Self {
        Self {
            local,
            routing: RoutingTable::new(local),
            data: DataStore::new(config.data.clone()),
            throttles: Arc::new(Throttles::new(config.throttle.clone())),
            config,
            transport,
            reliability: collab.reliability,
            banlist: collab.banlist,
            keys: collab.keys,
            status: collab.status,
            persistence: collab.persistence,
            replies: Arc::new(ReplyRegistry::new()),
            floodfill: AtomicBool::new(false),
            started: Instant::now(),
            next_token: AtomicU64::new(rand::random::<u32>() as u64),
        }
    }

    pub fn selector(&self) -> PeerSelector<'_> {
        PeerSelector::new(
            &self.routing,
            &self.data,
            self.reliability.as_ref(),
            self.banlist.as_ref(),
            &self.config.selection,
        )
    }

    pub fn routing_key(&self, key: &Identity) -> RoutingKey {
        self.keys.routing_key(key)
    }

    pub fn is_floodfill(&self) -> bool {
        self.floodfill.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_floodfill(&self, floodfill: bool) -> bool {
        self.floodfill.swap(floodfill, Ordering::AcqRel)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fresh token for store acknowledgements.
    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Validate and store an entry.
    ///
    /// Accepted router descriptors also enter the routing table. Saves to
    /// persistence run in the background and only log on failure.
    pub fn accept_entry(&self, key: Identity, entry: DatabaseEntry) -> PutOutcome {
        let outcome = self.data.put(key, entry.clone());
        if outcome.is_accepted() {
            if entry.kind() == RecordKind::RouterInfo {
                self.routing.add(key);
            }
            trace!(key = %key.short(), kind = ?entry.kind(), "netdb entry stored");
            let persistence = self.persistence.clone();
            tokio::spawn(async move {
                if let Err(e) = persistence.save(&entry).await {
                    debug!(key = %key.short(), error = %e, "netdb save failed");
                }
            });
        }
        outcome
    }

    /// Hand a message to the transport without waiting on it. The local send
    /// result arrives on `results`; a send still running at `deadline`
    /// counts as failed.
    pub fn spawn_send(
        &self,
        to: Identity,
        message: NetDbMessage,
        route: Route,
        deadline: Instant,
        results: mpsc::UnboundedSender<SendResult>,
    ) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let ok = match timeout_at(deadline, transport.send(&to, message, route)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    trace!(peer = %to.short(), error = %e, "netdb send failed locally");
                    false
                }
                Err(_) => {
                    trace!(peer = %to.short(), "netdb send timed out");
                    false
                }
            };
            let _ = results.send((to, ok));
        });
    }

    /// Fire-and-forget send, bounded by the store peer timeout. The result
    /// is only logged.
    pub fn send_detached(&self, to: Identity, message: NetDbMessage, route: Route) {
        let transport = self.transport.clone();
        let deadline = Instant::now() + self.config.store.peer_timeout;
        tokio::spawn(async move {
            match timeout_at(deadline, transport.send(&to, message, route)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => trace!(peer = %to.short(), error = %e, "netdb send failed locally"),
                Err(_) => trace!(peer = %to.short(), "netdb send timed out"),
            }
        });
    }

    pub fn lookup_message(
        &self,
        key: Identity,
        kind: LookupKind,
        dont_include: &HashSet<Identity>,
    ) -> NetDbMessage {
        NetDbMessage::Lookup(DatabaseLookup {
            key,
            kind,
            from: self.local,
            reply_tunnel: None,
            dont_include: dont_include.iter().copied().take(MAX_DONT_INCLUDE).collect(),
        })
    }

    /// Per-try timeout: `min(single, max(min single, 3 × average response))`.
    pub fn single_search_time(&self, peer: &Identity) -> Duration {
        let cfg = &self.config.lookup;
        let adaptive = self
            .reliability
            .stats(peer)
            .and_then(|s| s.avg_response_ms)
            .filter(|avg| *avg > 0)
            .map(|avg| Duration::from_millis(avg.saturating_mul(3)).max(cfg.min_single_search_time));
        match adaptive {
            Some(t) => t.min(cfg.single_search_time),
            None => cfg.single_search_time,
        }
    }

    /// Whether `peer` is known to be a floodfill.
    pub fn is_known_floodfill(&self, peer: &Identity) -> bool {
        self.data.router_info(peer).is_some_and(|ri| ri.is_floodfill())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{now_ms, Keypair};
    use crate::protocols::PeerStats;
    use crate::record::{RouterAddress, RouterInfo};
    use anyhow::Result;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _to: &Identity, _message: NetDbMessage, _route: Route) -> Result<()> {
            Ok(())
        }
    }

    fn context(profiles: Arc<InMemoryProfiles>) -> NetDbContext<NullTransport> {
        let collab = Collaborators { reliability: profiles, ..Collaborators::in_memory() };
        NetDbContext::new(Identity::random(), NetDbConfig::default(), Arc::new(NullTransport), collab)
    }

    #[tokio::test]
    async fn accepted_router_joins_routing_table() {
        let ctx = context(Arc::new(InMemoryProfiles::new()));
        let keypair = Keypair::generate();
        let info = RouterInfo::new_signed(
            &keypair,
            vec![RouterAddress::direct("SSU2", "10.0.0.1:1".parse().unwrap())],
            "fO",
            now_ms(),
        );
        assert!(ctx.accept_entry(keypair.identity(), info.into()).is_accepted());
        assert!(ctx.routing.contains(&keypair.identity()));
        assert!(ctx.is_known_floodfill(&keypair.identity()));
    }

    #[tokio::test]
    async fn single_search_time_adapts_to_response_history() {
        let profiles = Arc::new(InMemoryProfiles::new());
        let ctx = context(profiles.clone());
        let fast = Identity::random();
        let slow = Identity::random();
        let tiny = Identity::random();
        profiles.set_stats(fast, PeerStats { avg_response_ms: Some(400), ..PeerStats::default() });
        profiles.set_stats(slow, PeerStats { avg_response_ms: Some(5_000), ..PeerStats::default() });
        profiles.set_stats(tiny, PeerStats { avg_response_ms: Some(10), ..PeerStats::default() });

        assert_eq!(ctx.single_search_time(&fast), Duration::from_millis(1_200));
        assert_eq!(ctx.single_search_time(&slow), Duration::from_secs(3));
        assert_eq!(ctx.single_search_time(&tiny), Duration::from_millis(500));
        assert_eq!(ctx.single_search_time(&Identity::random()), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn floodfill_flag_swaps() {
        let ctx = context(Arc::new(InMemoryProfiles::new()));
        assert!(!ctx.is_floodfill());
        assert!(!ctx.set_floodfill(true));
        assert!(ctx.is_floodfill());
        assert_ne!(ctx.next_token(), ctx.next_token());
    }
}
