//! In-memory loopback network.
//!
//! Every [`MemoryTransport`] hands messages to a shared [`MemoryNetwork`],
//! which delivers them to the attached [`NetDb`] of the recipient after a
//! fixed latency. Per-peer behaviours script the failure modes tests need:
//! peers that never answer, sends that never complete, sends that fail
//! locally, and hand-written responders.
//!
//! [`Simulation`] wires up a small network of routers for the demo binary.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info, trace};

use crate::config::{FloodfillMode, NetDbConfig};
use crate::context::Collaborators;
use crate::identity::{now_ms, Identity, Keypair};
use crate::messages::NetDbMessage;
use crate::netdb::NetDb;
use crate::protocols::{Route, Transport};
use crate::record::{DatabaseEntry, LookupKind, RouterAddress, RouterInfo};

/// Answers a message addressed to a scripted peer. Arguments are the sender
/// and the message; a returned message goes back to the sender.
pub type Responder = Arc<dyn Fn(&Identity, &NetDbMessage) -> Option<NetDbMessage> + Send + Sync>;

#[derive(Clone, Default)]
pub enum PeerBehaviour {
    /// Deliver to the attached database, or drop if none is attached.
    #[default]
    Normal,
    /// Accept every send but never answer.
    Silent,
    /// The local send never completes.
    Stall,
    /// The local send fails right away.
    FailSend,
    Scripted(Responder),
}

/// One message handed to the network.
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub from: Identity,
    pub to: Identity,
    pub message: NetDbMessage,
    pub route: Route,
}

pub struct MemoryNetwork {
    latency: Duration,
    nodes: RwLock<HashMap<Identity, NetDb<MemoryTransport>>>,
    behaviours: RwLock<HashMap<Identity, PeerBehaviour>>,
    sent: RwLock<Vec<SentMessage>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::from_millis(10))
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            nodes: RwLock::new(HashMap::new()),
            behaviours: RwLock::new(HashMap::new()),
            sent: RwLock::new(Vec::new()),
        })
    }

    pub fn transport(self: &Arc<Self>, local: Identity) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: Arc::downgrade(self),
            local,
        })
    }

    /// Route messages addressed to `node` into it.
    pub fn attach(&self, node: &NetDb<MemoryTransport>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.local(), node.clone());
    }

    pub fn detach(&self, id: &Identity) {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner).remove(id);
    }

    pub fn set_behaviour(&self, peer: Identity, behaviour: PeerBehaviour) {
        self.behaviours
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, behaviour);
    }

    fn behaviour(&self, peer: &Identity) -> PeerBehaviour {
        self.behaviours
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    fn node(&self, id: &Identity) -> Option<NetDb<MemoryTransport>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Every message handed to the network so far, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sent_to(&self, peer: &Identity) -> Vec<NetDbMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.to == *peer)
            .map(|m| m.message)
            .collect()
    }

    pub fn clear_log(&self) {
        self.sent.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn log(&self, from: Identity, to: Identity, message: &NetDbMessage, route: Route) {
        self.sent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage { from, to, message: message.clone(), route });
    }

    fn deliver(self: &Arc<Self>, from: Identity, to: Identity, message: NetDbMessage, behaviour: PeerBehaviour) {
        let network = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(network.latency).await;
            match behaviour {
                PeerBehaviour::Scripted(respond) => {
                    if let Some(reply) = respond(&from, &message) {
                        network.log(to, from, &reply, Route::Direct);
                        network.deliver(to, from, reply, network.behaviour(&from));
                    }
                }
                _ => match network.node(&to) {
                    Some(node) => node.receive(from, message),
                    None => trace!(to = %to.short(), "no node attached, message dropped"),
                },
            }
        });
    }
}

pub struct MemoryTransport {
    network: Weak<MemoryNetwork>,
    local: Identity,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &Identity, message: NetDbMessage, route: Route) -> Result<()> {
        let network = self.network.upgrade().ok_or_else(|| anyhow!("network shut down"))?;
        let behaviour = network.behaviour(to);
        network.log(self.local, *to, &message, route);
        match behaviour {
            PeerBehaviour::FailSend => bail!("no route to {}", to.short()),
            PeerBehaviour::Stall => {
                std::future::pending::<()>().await;
                Ok(())
            }
            PeerBehaviour::Silent => Ok(()),
            behaviour => {
                network.deliver(self.local, *to, message, behaviour);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Router fixtures
// ============================================================================

/// Address in its own /24 so prefix-diverse walks never skip it.
pub fn router_address(index: u32) -> SocketAddr {
    let ip = Ipv4Addr::new(10, ((index >> 8) & 0xff) as u8, (index & 0xff) as u8, 1);
    SocketAddr::new(IpAddr::V4(ip), 9_000)
}

/// Signed router descriptor for simulated router `index`.
pub fn router_info(keypair: &Keypair, index: u32, floodfill: bool) -> RouterInfo {
    let caps = if floodfill { "fP" } else { "P" };
    RouterInfo::new_signed(
        keypair,
        vec![RouterAddress::direct("SSU2", router_address(index))],
        caps,
        now_ms(),
    )
}

// ============================================================================
// Simulation
// ============================================================================

pub struct SimRouter {
    pub keypair: Keypair,
    pub info: RouterInfo,
    pub netdb: NetDb<MemoryTransport>,
}

impl SimRouter {
    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }
}

pub struct Simulation {
    pub network: Arc<MemoryNetwork>,
    pub routers: Vec<SimRouter>,
    floodfills: usize,
}

impl Simulation {
    /// Start `nodes` routers, the first `floodfills` of them forced floodfill.
    pub async fn start(nodes: usize, floodfills: usize, config: &NetDbConfig) -> Result<Self> {
        let network = MemoryNetwork::new();
        let mut routers = Vec::with_capacity(nodes);
        for index in 0..nodes {
            let keypair = Keypair::generate();
            let floodfill = index < floodfills;
            let info = router_info(&keypair, index as u32, floodfill);
            let mut node_config = config.clone();
            node_config.floodfill = if floodfill { FloodfillMode::Enabled } else { FloodfillMode::Disabled };
            let netdb = NetDb::start(
                keypair.identity(),
                node_config,
                network.transport(keypair.identity()),
                Collaborators::in_memory(),
            )
            .await?;
            network.attach(&netdb);
            routers.push(SimRouter { keypair, info, netdb });
        }
        info!(nodes, floodfills, "simulation started");
        Ok(Self { network, routers, floodfills })
    }

    /// Give every router the floodfill descriptors, as a reseed would.
    pub fn reseed(&self) {
        for router in &self.routers {
            let ctx = router.netdb.context();
            for floodfill in &self.routers[..self.floodfills] {
                if floodfill.identity() != router.identity() {
                    ctx.accept_entry(floodfill.identity(), floodfill.info.clone().into());
                }
            }
        }
    }

    /// Every router publishes its own descriptor. Returns how many stores
    /// succeeded.
    pub async fn publish_all(&self) -> usize {
        let mut published = 0;
        for router in &self.routers {
            let entry = DatabaseEntry::from(router.info.clone());
            match router.netdb.publish(entry).await {
                Ok(receipt) => {
                    published += 1;
                    debug!(router = %router.identity().short(), peers = receipt.peers.len(), "published");
                }
                Err(e) => debug!(router = %router.identity().short(), error = %e, "publish failed"),
            }
        }
        published
    }

    /// Random routers look up random other routers. Returns how many found
    /// their target.
    pub async fn run_lookups(&self, count: usize, timeout: Duration) -> Result<usize> {
        if self.routers.len() < 2 {
            bail!("need at least two routers to look anything up");
        }
        let mut found = 0;
        for _ in 0..count {
            let mut pair: Vec<&SimRouter> = self
                .routers
                .choose_multiple(&mut rand::thread_rng(), 2)
                .collect();
            let (Some(target), Some(asker)) = (pair.pop(), pair.pop()) else {
                continue;
            };
            match asker.netdb.lookup(target.identity(), LookupKind::RouterInfo, timeout).await {
                Ok(_) => found += 1,
                Err(e) => debug!(
                    asker = %asker.identity().short(),
                    target = %target.identity().short(),
                    error = %e,
                    "simulated lookup failed"
                ),
            }
        }
        Ok(found)
    }

    pub async fn shutdown(&self) {
        for router in &self.routers {
            router.netdb.quit().await;
            self.network.detach(&router.identity());
        }
    }
}
