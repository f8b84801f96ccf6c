//! # Network Database Facade
//!
//! [`NetDb`] is the cloneable handle the rest of the router talks to. Lookups
//! go through a private actor that owns the in-flight table, so two lookups
//! for the same key share one search and both callers get its outcome.
//! Stores, inbound messages and diagnostics work on the shared
//! [`NetDbContext`] directly.
//!
//! ```text
//!   lookup ──▶ actor ──┬─ local hit / refused ──────────────▶ reply
//!                      ├─ already in flight ──▶ join waiters
//!                      └─ spawn search ──▶ LookupFinished ──▶ every waiter
//! ```
//!
//! Background tasks started with the database: throttle cleaning, reply
//! registry expiry, the floodfill election loop and, unless disabled,
//! exploration of sparse routing buckets. All stop on [`NetDb::quit`].

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::classic_search;
use crate::config::{FloodfillMode, NetDbConfig};
use crate::context::{Collaborators, NetDbContext};
use crate::data_store::PutOutcome;
use crate::floodfill_monitor::spawn_floodfill_monitor;
use crate::identity::Identity;
use crate::messages::{
    decode_message, DatabaseLookup, DatabaseStore, DeliveryAck, NetDbMessage, SearchReply,
};
use crate::protocols::{Route, Transport};
use crate::record::{DatabaseEntry, LookupKind, RecordKind};
use crate::search::{self, LookupError, LookupOutcome, LookupRequest};
use crate::store::{self, StoreError, StoreOptions, StoreReceipt};

/// How often expired reply waiters are swept.
const REPLY_EXPIRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default deadline of `store` and `publish`.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

type Waiter = (LookupKind, oneshot::Sender<LookupOutcome>);

enum Command {
    Lookup(LookupRequest, oneshot::Sender<LookupOutcome>),
    LookupFinished(Identity, LookupOutcome),
    InFlight(oneshot::Sender<usize>),
    Quit,
}

pub struct NetDb<T: Transport> {
    cmd_tx: mpsc::Sender<Command>,
    ctx: Arc<NetDbContext<T>>,
}

impl<T: Transport> Clone for NetDb<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

struct NetDbActor<T: Transport> {
    ctx: Arc<NetDbContext<T>>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    in_flight: HashMap<Identity, Vec<Waiter>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> NetDb<T> {
    /// Build the database, load persisted entries and start the background
    /// tasks.
    pub async fn start(
        local: Identity,
        config: NetDbConfig,
        transport: Arc<T>,
        collab: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(NetDbContext::new(local, config, transport, collab));
        ctx.set_floodfill(ctx.config.floodfill == FloodfillMode::Enabled);

        match ctx.persistence.load().await {
            Ok(entries) => {
                let total = entries.len();
                let mut loaded = 0usize;
                for entry in entries {
                    let key = entry.identity();
                    if ctx.data.put(key, entry.clone()).is_accepted() {
                        if entry.kind() == RecordKind::RouterInfo {
                            ctx.routing.add(key);
                        }
                        loaded += 1;
                    }
                }
                info!(loaded, total, "netdb loaded from persistence");
            }
            Err(e) => warn!(error = %e, "netdb load failed, starting empty"),
        }

        let mut tasks = vec![
            ctx.throttles.spawn_cleaner(),
            spawn_reply_expiry(&ctx),
            spawn_floodfill_monitor(&ctx),
        ];
        if ctx.config.explore.enabled {
            tasks.push(spawn_explorer(&ctx));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let actor = NetDbActor {
            ctx: ctx.clone(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            in_flight: HashMap::new(),
            tasks,
        };
        tokio::spawn(actor.run());

        info!(local = %local.short(), floodfill = ctx.is_floodfill(), "netdb started");
        Ok(Self { cmd_tx, ctx })
    }

    pub fn local(&self) -> Identity {
        self.ctx.local
    }

    pub fn context(&self) -> &Arc<NetDbContext<T>> {
        &self.ctx
    }

    pub fn is_floodfill(&self) -> bool {
        self.ctx.is_floodfill()
    }

    /// Locally held entry, without touching the network.
    pub fn get(&self, key: &Identity) -> Option<DatabaseEntry> {
        self.ctx.data.get(key)
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Find `key`, locally or on the network.
    ///
    /// Concurrent lookups for the same key share one search.
    pub async fn lookup(&self, key: Identity, kind: LookupKind, timeout: Duration) -> LookupOutcome {
        let (tx, rx) = oneshot::channel();
        let request = LookupRequest { key, kind, timeout };
        if self.cmd_tx.send(Command::Lookup(request, tx)).await.is_err() {
            return Err(LookupError::Shutdown);
        }
        rx.await.unwrap_or(Err(LookupError::Shutdown))
    }

    // ------------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------------

    /// Store locally, then at the nearest floodfills with the configured
    /// redundancy.
    pub async fn store(&self, key: Identity, entry: DatabaseEntry, timeout: Duration) -> Result<StoreReceipt, StoreError> {
        let options = StoreOptions::standard(&self.ctx.config.store);
        self.store_with(key, entry, options, timeout, HashSet::new()).await
    }

    pub async fn store_with(
        &self,
        key: Identity,
        entry: DatabaseEntry,
        options: StoreOptions,
        timeout: Duration,
        exclude: HashSet<Identity>,
    ) -> Result<StoreReceipt, StoreError> {
        match self.ctx.accept_entry(key, entry.clone()) {
            PutOutcome::Rejected(reason) => return Err(StoreError::Rejected(reason)),
            PutOutcome::Stale => return Err(StoreError::Stale),
            PutOutcome::Accepted { .. } | PutOutcome::Duplicate => {}
        }
        store::store(&self.ctx, key, entry, options, timeout, exclude).await
    }

    /// Publish one of our own records: a single floodfill store with
    /// verification. Floodfills also flood it right away.
    pub async fn publish(&self, entry: DatabaseEntry) -> Result<StoreReceipt, StoreError> {
        let key = entry.identity();
        if self.ctx.is_floodfill() {
            if let PutOutcome::Accepted { .. } = self.ctx.accept_entry(key, entry.clone()) {
                store::flood(&self.ctx, &entry);
            }
        }
        self.store_with(key, entry, StoreOptions::floodfill(), DEFAULT_STORE_TIMEOUT, HashSet::new())
            .await
    }

    /// Drop `key` locally.
    ///
    /// Router descriptors are kept during the first minutes after start and
    /// whenever only a handful of routers are known. Returns whether the
    /// entry was removed.
    pub fn fail(&self, key: &Identity) -> bool {
        let ctx = &self.ctx;
        let Some(entry) = ctx.data.get(key) else {
            return false;
        };
        if entry.kind() == RecordKind::RouterInfo {
            if ctx.uptime() < ctx.config.data.dont_fail_period {
                debug!(key = %key.short(), "not failing router this soon after start");
                return false;
            }
            if ctx.data.router_count() <= ctx.config.data.min_remaining_routers {
                debug!(key = %key.short(), routers = ctx.data.router_count(), "not failing router, too few known");
                return false;
            }
        }

        ctx.data.remove(key);
        ctx.routing.remove(key);
        let persistence = ctx.persistence.clone();
        let key = *key;
        tokio::spawn(async move {
            if let Err(e) = persistence.remove(&key).await {
                debug!(key = %key.short(), error = %e, "netdb remove failed");
            }
        });
        debug!(key = %key.short(), kind = ?entry.kind(), "netdb entry failed");
        true
    }

    // ------------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------------

    /// Decode and handle raw bytes from `from`. Malformed input is dropped.
    pub fn receive_bytes(&self, from: Identity, bytes: &[u8]) {
        if let Some(message) = decode_message(&from, bytes) {
            self.receive(from, message);
        }
    }

    /// Handle one inbound message.
    pub fn receive(&self, from: Identity, message: NetDbMessage) {
        let claimed = self.ctx.replies.dispatch(&from, &message);
        match message {
            NetDbMessage::Lookup(lookup) => self.answer_lookup(from, lookup),
            NetDbMessage::Store(store) => self.handle_store(from, store, claimed),
            other => {
                if !claimed {
                    trace!(from = %from.short(), kind = other.kind_name(), "unsolicited netdb reply dropped");
                }
            }
        }
    }

    fn answer_lookup(&self, from: Identity, lookup: DatabaseLookup) {
        let ctx = &self.ctx;
        let floodfill = ctx.is_floodfill();
        if ctx.throttles.lookups.should_throttle(&lookup.from, lookup.reply_tunnel, floodfill) {
            debug!(from = %lookup.from.short(), key = %lookup.key.short(), "throttling netdb lookups");
            return;
        }

        let route = lookup.reply_tunnel.map_or(Route::Direct, Route::ReplyTunnel);
        // Only floodfills hand out lease sets.
        let held = ctx.data.get(&lookup.key).filter(|entry| {
            lookup.kind.accepts(entry.kind()) && (floodfill || entry.kind() == RecordKind::RouterInfo)
        });

        let reply = match held {
            Some(entry) => NetDbMessage::Store(DatabaseStore {
                key: lookup.key,
                entry,
                reply_token: None,
            }),
            None => {
                let mut exclude: HashSet<Identity> = lookup.dont_include.iter().copied().collect();
                exclude.extend([from, lookup.from, lookup.key]);
                let rkey = ctx.routing_key(&lookup.key);
                let count = ctx.config.lookup.reply_peers;
                let selector = ctx.selector();
                // Explorers want to hear of any router, not just floodfills.
                let peers = match lookup.kind {
                    LookupKind::Exploration => selector.select_nearest(&rkey, count, &exclude),
                    _ => selector.select_floodfill_participants(&rkey, count, &exclude),
                };
                NetDbMessage::SearchReply(SearchReply {
                    key: lookup.key,
                    from: ctx.local,
                    peers,
                })
            }
        };
        trace!(to = %lookup.from.short(), key = %lookup.key.short(), reply = reply.kind_name(), "answering netdb lookup");
        ctx.send_detached(lookup.from, reply, route);
    }

    fn handle_store(&self, from: Identity, store: DatabaseStore, claimed: bool) {
        let ctx = &self.ctx;
        let key = store.key;
        let outcome = ctx.accept_entry(key, store.entry.clone());
        if let PutOutcome::Rejected(reason) = &outcome {
            debug!(from = %from.short(), key = %key.short(), reason = %reason, "inbound store rejected");
            return;
        }

        if let Some(token) = store.reply_token {
            ctx.send_detached(from, NetDbMessage::DeliveryAck(DeliveryAck { token }), Route::Direct);
        }

        if outcome.is_accepted() && !claimed && ctx.is_floodfill() {
            if ctx.throttles.floods.should_throttle(&key) {
                debug!(key = %key.short(), "flood throttled");
            } else {
                store::flood(ctx, &store.entry);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    pub async fn snapshot(&self) -> NetDbSnapshot {
        let (tx, rx) = oneshot::channel();
        let in_flight = if self.cmd_tx.send(Command::InFlight(tx)).await.is_ok() {
            rx.await.unwrap_or(0)
        } else {
            0
        };
        let ctx = &self.ctx;
        NetDbSnapshot {
            local: ctx.local,
            floodfill: ctx.is_floodfill(),
            uptime: ctx.uptime(),
            routers: ctx.data.router_count(),
            lease_sets: ctx.data.lease_set_count(),
            floodfills: ctx.data.floodfill_count(),
            routing_table_size: ctx.routing.approximate_size(),
            bucket_sizes: ctx.routing.bucket_sizes(),
            in_flight_lookups: in_flight,
            pending_replies: ctx.replies.len(),
            negative_cached: ctx.throttles.negative.cached_count(),
        }
    }

    pub async fn render_status(&self) -> String {
        self.snapshot().await.render()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<T: Transport> NetDbActor<T> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Lookup(request, reply) => self.handle_lookup(request, reply),
                Command::LookupFinished(key, outcome) => self.handle_lookup_finished(key, outcome),
                Command::InFlight(reply) => {
                    let _ = reply.send(self.in_flight.len());
                }
                Command::Quit => break,
            }
        }
        for task in &self.tasks {
            task.abort();
        }
        for (_, waiters) in self.in_flight.drain() {
            for (_, tx) in waiters {
                let _ = tx.send(Err(LookupError::Shutdown));
            }
        }
        debug!(local = %self.ctx.local.short(), "netdb actor stopped");
    }

    fn handle_lookup(&mut self, request: LookupRequest, reply: oneshot::Sender<LookupOutcome>) {
        let ctx = &self.ctx;
        let key = request.key;
        if key == ctx.local {
            let _ = reply.send(Err(LookupError::LocalIdentity));
            return;
        }
        if let Some(entry) = ctx.data.get(&key) {
            if request.kind.accepts(entry.kind()) {
                let _ = reply.send(Ok(entry));
                return;
            }
        }
        if ctx.banlist.is_banned(&key) {
            let _ = reply.send(Err(LookupError::Banned));
            return;
        }
        if ctx.throttles.negative.is_cached(&key) {
            debug!(key = %key.short(), "lookup short-circuited by negative cache");
            let _ = reply.send(Err(LookupError::NegativeCached));
            return;
        }

        if let Some(waiters) = self.in_flight.get_mut(&key) {
            trace!(key = %key.short(), waiters = waiters.len() + 1, "joining lookup in flight");
            waiters.push((request.kind, reply));
            return;
        }
        self.in_flight.insert(key, vec![(request.kind, reply)]);

        let ctx = ctx.clone();
        let cmd_tx = self.cmd_tx.clone();
        let strategy = ctx.config.lookup.strategy;
        tokio::spawn(async move {
            let outcome = search::run(ctx, strategy, request).await;
            let _ = cmd_tx.send(Command::LookupFinished(key, outcome)).await;
        });
    }

    fn handle_lookup_finished(&mut self, key: Identity, outcome: LookupOutcome) {
        let ctx = &self.ctx;
        match &outcome {
            Ok(entry) => {
                ctx.throttles.negative.lookup_succeeded(&key);
                if ctx.is_floodfill() {
                    store::flood(ctx, entry);
                }
            }
            Err(LookupError::NotFound | LookupError::Timeout | LookupError::NoPeers) => {
                ctx.throttles.negative.lookup_failed(&key);
            }
            Err(_) => {}
        }

        let waiters = self.in_flight.remove(&key).unwrap_or_default();
        trace!(key = %key.short(), waiters = waiters.len(), ok = outcome.is_ok(), "lookup finished");
        for (kind, tx) in waiters {
            let result = match &outcome {
                Ok(entry) if !kind.accepts(entry.kind()) => Err(LookupError::NotFound),
                other => other.clone(),
            };
            let _ = tx.send(result);
        }
    }
}

fn spawn_reply_expiry<T: Transport>(ctx: &Arc<NetDbContext<T>>) -> JoinHandle<()> {
    let replies = Arc::downgrade(&ctx.replies);
    tokio::spawn(async move {
        let mut tick = interval(REPLY_EXPIRY_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(replies) = replies.upgrade() else { break };
            let expired = replies.expire(Instant::now());
            if expired > 0 {
                trace!(expired, "expired reply waiters");
            }
        }
    })
}

/// Explore sparse buckets while we are not a floodfill. Runs come every
/// `explore.min_interval` while few routers are known, every
/// `explore.interval` after that.
fn spawn_explorer<T: Transport>(ctx: &Arc<NetDbContext<T>>) -> JoinHandle<()> {
    let weak = Arc::downgrade(ctx);
    let mut delay = ctx.config.explore.start_delay;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(delay).await;
            let Some(ctx) = weak.upgrade() else { break };
            if ctx.is_floodfill() {
                delay = ctx.config.explore.interval;
                trace!("floodfill, not exploring");
                continue;
            }

            let keys = exploration_keys(&ctx);
            let mut discovered = 0;
            for key in &keys {
                discovered += classic_search::explore(ctx.clone(), *key).await;
            }
            let known = ctx.routing.approximate_size();
            delay = ctx.config.explore.next_delay(known);
            debug!(keys = keys.len(), discovered, known, next_s = delay.as_secs(), "exploration run finished");
        }
    })
}

/// One random key in each of up to `keys_per_run` sparse buckets.
fn exploration_keys<T: Transport>(ctx: &NetDbContext<T>) -> Vec<Identity> {
    let cfg = &ctx.config.explore;
    let mut sparse = ctx.routing.sparse_buckets(cfg.sparse_bucket);
    sparse.shuffle(&mut rand::thread_rng());
    sparse
        .into_iter()
        .take(cfg.keys_per_run)
        .filter_map(|idx| ctx.routing.random_key_in_bucket(idx))
        .collect()
}

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Clone, Debug)]
pub struct NetDbSnapshot {
    pub local: Identity,
    pub floodfill: bool,
    pub uptime: Duration,
    pub routers: usize,
    pub lease_sets: usize,
    pub floodfills: usize,
    pub routing_table_size: usize,
    pub bucket_sizes: Vec<usize>,
    pub in_flight_lookups: usize,
    pub pending_replies: usize,
    pub negative_cached: usize,
}

impl NetDbSnapshot {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "netdb {} ({})", self.local.short(), if self.floodfill { "floodfill" } else { "client" });
        let _ = writeln!(out, "  uptime:        {}s", self.uptime.as_secs());
        let _ = writeln!(
            out,
            "  records:       {} routers ({} floodfill), {} lease sets",
            self.routers, self.floodfills, self.lease_sets
        );
        let _ = writeln!(out, "  routing table: {} peers", self.routing_table_size);
        let occupied: Vec<String> = self
            .bucket_sizes
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .map(|(i, n)| format!("{i}:{n}"))
            .collect();
        let _ = writeln!(out, "  buckets:       {}", occupied.join(" "));
        let _ = writeln!(
            out,
            "  lookups:       {} in flight, {} reply waiters, {} negatively cached",
            self.in_flight_lookups, self.pending_replies, self.negative_cached
        );
        out
    }
}
