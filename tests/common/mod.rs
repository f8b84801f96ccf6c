//! Shared fixtures for the loopback-network integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use floodnet::config::NetDbConfig;
use floodnet::context::Collaborators;
use floodnet::identity::{Identity, Keypair, RoutingKey};
use floodnet::messages::{DatabaseStore, NetDbMessage, SearchReply};
use floodnet::profiles::{InMemoryProfiles, MemoryBanlist};
use floodnet::protocols::KeyRotation;
use floodnet::record::{DatabaseEntry, RouterInfo};
use floodnet::routing_key::DailyRoutingKey;
use floodnet::sim::{router_info, MemoryNetwork, MemoryTransport, PeerBehaviour, Responder};
use floodnet::NetDb;

/// Daily routing keys with a pinned distance to the next rotation, so
/// flood fan-out does not depend on the wall clock.
pub struct PinnedRotation(pub Duration);

impl KeyRotation for PinnedRotation {
    fn routing_key_for(&self, key: &Identity, when: SystemTime) -> RoutingKey {
        DailyRoutingKey::new().routing_key_for(key, when)
    }

    fn time_until_rotation(&self) -> Duration {
        self.0
    }
}

pub struct TestNode {
    pub netdb: NetDb<MemoryTransport>,
    pub profiles: Arc<InMemoryProfiles>,
    pub banlist: Arc<MemoryBanlist>,
}

impl TestNode {
    pub fn id(&self) -> Identity {
        self.netdb.local()
    }

    /// Make a router known to this node.
    pub fn learn(&self, info: &RouterInfo) {
        let outcome = self
            .netdb
            .context()
            .accept_entry(info.identity(), info.clone().into());
        assert!(outcome.is_current(), "fixture router rejected: {outcome:?}");
    }
}

pub async fn start_node(network: &Arc<MemoryNetwork>, config: NetDbConfig) -> TestNode {
    let keypair = Keypair::generate();
    start_node_with(network, config, keypair.identity(), |c| c).await
}

pub async fn start_node_with(
    network: &Arc<MemoryNetwork>,
    config: NetDbConfig,
    local: Identity,
    customize: impl FnOnce(Collaborators) -> Collaborators,
) -> TestNode {
    let profiles = Arc::new(InMemoryProfiles::new());
    let banlist = Arc::new(MemoryBanlist::new());
    let collab = Collaborators {
        reliability: profiles.clone(),
        banlist: banlist.clone(),
        keys: Arc::new(PinnedRotation(Duration::from_secs(12 * 60 * 60))),
        ..Collaborators::in_memory()
    };
    let netdb = NetDb::start(local, config, network.transport(local), customize(collab))
        .await
        .unwrap();
    network.attach(&netdb);
    TestNode { netdb, profiles, banlist }
}

/// A scripted router that exists only as a descriptor plus a behaviour.
pub struct Peer {
    pub keypair: Keypair,
    pub info: RouterInfo,
}

impl Peer {
    pub fn new(index: u32, floodfill: bool) -> Self {
        let keypair = Keypair::generate();
        let info = router_info(&keypair, index, floodfill);
        Self { keypair, info }
    }

    pub fn id(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn entry(&self) -> DatabaseEntry {
        self.info.clone().into()
    }
}

/// Peers `first..first + count`, each on its own /24.
pub fn peers(first: u32, count: u32, floodfill: bool) -> Vec<Peer> {
    (first..first + count).map(|i| Peer::new(i, floodfill)).collect()
}

/// Answers lookups for any key in `records` with the record, and everything
/// else with a search reply naming `closer`.
pub fn responder(me: Identity, records: Vec<DatabaseEntry>, closer: Vec<Identity>) -> PeerBehaviour {
    let respond: Responder = Arc::new(move |_from, message| match message {
        NetDbMessage::Lookup(lookup) => {
            let hit = records.iter().find(|e| e.identity() == lookup.key).cloned();
            Some(match hit {
                Some(entry) => NetDbMessage::Store(DatabaseStore {
                    key: lookup.key,
                    entry,
                    reply_token: None,
                }),
                None => NetDbMessage::SearchReply(SearchReply {
                    key: lookup.key,
                    from: me,
                    peers: closer.clone(),
                }),
            })
        }
        _ => None,
    });
    PeerBehaviour::Scripted(respond)
}

/// Lookups sent to `peer` so far.
pub fn lookups_sent_to(network: &MemoryNetwork, peer: &Identity) -> usize {
    network
        .sent_to(peer)
        .iter()
        .filter(|m| matches!(m, NetDbMessage::Lookup(_)))
        .count()
}

/// Stores sent to `peer` so far.
pub fn stores_sent_to(network: &MemoryNetwork, peer: &Identity) -> usize {
    network
        .sent_to(peer)
        .iter()
        .filter(|m| matches!(m, NetDbMessage::Store(_)))
        .count()
}

pub fn ids(peers: &[Peer]) -> HashSet<Identity> {
    peers.iter().map(Peer::id).collect()
}
