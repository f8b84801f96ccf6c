//! Classic breadth-limited walk over the nearest known peers.
//!
//! Keeps up to `classic_breadth` queries outstanding, each with its own
//! per-peer timeout (longer for floodfills), and refills finished slots with
//! the next-nearest untried peer. Peers named in search replies join the
//! candidate pool. Kept as a fallback; the iterative walk is the default.
//!
//! The same walk drives [`explore`]: a search for a random key that nobody
//! holds, sent with the peers we already know near that key as the
//! exclusion list. Every peer named in a reply joins the routing table and
//! its descriptor is fetched from the peer that named it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::context::{lookup_route, NetDbContext, SendResult};
use crate::flood_search::single_lookup;
use crate::identity::{Identity, RoutingKey};
use crate::peer_selector::sort_by_distance;
use crate::protocols::Transport;
use crate::record::LookupKind;
use crate::search::{
    classify_reply, reply_selector, LookupError, LookupOutcome, LookupRequest, ReplyClass,
    SearchState,
};

struct ClassicSearch<T: Transport> {
    ctx: Arc<NetDbContext<T>>,
    request: LookupRequest,
    rkey: RoutingKey,
    expiration: Instant,
    state: SearchState,
    learned: HashSet<Identity>,
    /// Set while exploring: known peers sent as the exclusion list.
    explore_exclude: Option<HashSet<Identity>>,
    /// Peers that were new to the routing table.
    discovered: usize,
}

pub async fn search<T: Transport>(ctx: Arc<NetDbContext<T>>, request: LookupRequest) -> LookupOutcome {
    ClassicSearch::new(ctx, request, None).run().await
}

/// Walk toward the random `key` to discover peers. Returns how many peers
/// were new to the routing table.
pub async fn explore<T: Transport>(ctx: Arc<NetDbContext<T>>, key: Identity) -> usize {
    let cfg = &ctx.config.explore;
    let rkey = ctx.routing_key(&key);
    let known: HashSet<Identity> = ctx
        .selector()
        .select_nearest(&rkey, cfg.dont_include, &HashSet::new())
        .into_iter()
        .collect();
    let request = LookupRequest {
        key,
        kind: LookupKind::Exploration,
        timeout: cfg.timeout,
    };
    let mut walk = ClassicSearch::new(ctx, request, Some(known));
    let _ = walk.run().await;
    walk.discovered
}

impl<T: Transport> ClassicSearch<T> {
    fn new(
        ctx: Arc<NetDbContext<T>>,
        request: LookupRequest,
        explore_exclude: Option<HashSet<Identity>>,
    ) -> Self {
        let expiration = Instant::now() + request.timeout.min(ctx.config.lookup.max_search_time);
        let rkey = ctx.routing_key(&request.key);
        Self {
            ctx,
            request,
            rkey,
            expiration,
            state: SearchState::default(),
            learned: HashSet::new(),
            explore_exclude,
            discovered: 0,
        }
    }

    async fn run(&mut self) -> LookupOutcome {
        let key = self.request.key;
        let mut replies = self.ctx.replies.register(reply_selector(key), self.expiration);
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SendResult>();

        loop {
            self.fill_slots(&send_tx);
            if self.state.pending_count() == 0 {
                let err = if self.state.attempted().is_empty() {
                    LookupError::NoPeers
                } else {
                    LookupError::NotFound
                };
                return Err(self.finish(err));
            }

            let wake = self
                .state
                .next_deadline()
                .map_or(self.expiration, |d| d.min(self.expiration));

            tokio::select! {
                reply = replies.recv_until(wake) => match reply {
                    Some((from, message)) => {
                        if !self.state.is_pending(&from) {
                            continue;
                        }
                        match classify_reply(&self.ctx, &self.request, message) {
                            ReplyClass::Found(entry) => {
                                let latency = self.state.succeed(&from, Instant::now());
                                self.ctx.reliability.record_lookup_result(&from, true, latency);
                                info!(key = %key.short(), peer = %from.short(), "classic lookup succeeded");
                                return Ok(entry);
                            }
                            ReplyClass::Closer(peers) => {
                                self.state.fail(&from);
                                self.learn(from, peers);
                            }
                            ReplyClass::WrongKind => {
                                self.state.fail(&from);
                            }
                            ReplyClass::Invalid => {
                                if self.state.fail(&from) {
                                    self.ctx.reliability.record_lookup_result(&from, false, None);
                                }
                            }
                            ReplyClass::Unrelated => {}
                        }
                    }
                    None => {
                        for peer in self.state.take_timed_out(Instant::now()) {
                            self.ctx.reliability.record_lookup_result(&peer, false, None);
                        }
                    }
                },
                Some((peer, ok)) = send_rx.recv() => {
                    if !ok && self.state.fail(&peer) {
                        self.ctx.reliability.record_lookup_result(&peer, false, None);
                    }
                }
            }

            if Instant::now() >= self.expiration {
                return Err(self.finish(LookupError::Timeout));
            }
        }
    }

    fn fill_slots(&mut self, send_tx: &mpsc::UnboundedSender<SendResult>) {
        let breadth = self.ctx.config.lookup.classic_breadth;
        let free = breadth.saturating_sub(self.state.pending_count());
        if free == 0 {
            return;
        }
        let now = Instant::now();
        if now >= self.expiration {
            return;
        }

        let mut exclude: HashSet<Identity> = self.state.attempted().clone();
        exclude.insert(self.request.key);
        let mut candidates = self.ctx.selector().select_nearest(&self.rkey, free, &exclude);
        candidates.extend(
            self.learned
                .iter()
                .filter(|p| !exclude.contains(p) && !self.ctx.banlist.is_banned(p))
                .copied(),
        );
        sort_by_distance(&self.rkey, &mut candidates);
        candidates.dedup();
        candidates.truncate(free);

        for peer in candidates {
            let timeout = self.peer_timeout(&peer, now);
            let deadline = now + timeout;
            self.state.dispatch(peer, now, deadline);
            let message = match &self.explore_exclude {
                Some(known) => {
                    let dont_include: HashSet<Identity> =
                        known.union(self.state.attempted()).copied().collect();
                    self.ctx.lookup_message(self.request.key, self.request.kind, &dont_include)
                }
                None => self
                    .ctx
                    .lookup_message(self.request.key, self.request.kind, self.state.attempted()),
            };
            let route = lookup_route(self.request.kind);
            debug!(key = %self.request.key.short(), peer = %peer.short(), timeout_ms = timeout.as_millis() as u64, "classic lookup query sent");
            self.ctx.spawn_send(peer, message, route, deadline, send_tx.clone());
        }
    }

    /// Per-peer timeout, clamped to the time left but never below the floor.
    fn peer_timeout(&self, peer: &Identity, now: Instant) -> Duration {
        let cfg = &self.ctx.config.lookup;
        let base = if self.ctx.is_known_floodfill(peer) {
            cfg.classic_floodfill_peer_timeout
        } else {
            cfg.classic_peer_timeout
        };
        let remaining = self.expiration.saturating_duration_since(now);
        base.min(remaining).max(cfg.classic_min_peer_timeout)
    }

    fn learn(&mut self, replier: Identity, peers: Vec<Identity>) {
        for peer in peers {
            if peer == self.ctx.local || peer == self.request.key || self.ctx.banlist.is_banned(&peer) {
                continue;
            }
            if self.explore_exclude.is_some() && self.ctx.routing.add(peer) {
                self.discovered += 1;
                if !self.ctx.data.is_known(&peer) {
                    trace!(peer = %peer.short(), via = %replier.short(), "explored new peer");
                    tokio::spawn(single_lookup(self.ctx.clone(), replier, peer));
                }
            }
            if !self.state.was_attempted(&peer) {
                self.learned.insert(peer);
            }
        }
    }

    fn finish(&mut self, err: LookupError) -> LookupError {
        for peer in self.state.pending_peers() {
            self.state.fail(&peer);
            self.ctx.reliability.record_lookup_result(&peer, false, None);
        }
        let tries = self.state.attempted().len();
        if self.explore_exclude.is_some() {
            debug!(key = %self.request.key.short(), tries, discovered = self.discovered, "exploration finished");
        } else {
            info!(key = %self.request.key.short(), tries, error = %err, "classic lookup failed");
        }
        err
    }
}
