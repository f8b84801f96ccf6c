//! # Iterative Floodfill Walk
//!
//! The production lookup strategy.
//!
//! ```text
//!   toTry (by distance) ──pop nearest──▶ unheard (query sent)
//!        ▲                                   │
//!        │ search reply peers                ├─ record  ─▶ success
//!        └───────────────────────────────────┤
//!                                            ├─ miss    ─▶ failed (no blame)
//!                                            └─ timeout ─▶ failed (blamed)
//! ```
//!
//! Concurrency is kept low (as low as one outstanding query) and made up for
//! with a short adaptive per-try timeout. Every search reply folds newly
//! learned floodfills back into `toTry`, so the walk keeps moving toward the
//! key. It ends on success, when the try limit is spent, when nothing is
//! pending and nothing is left to try, or when the wall-clock budget runs out.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::context::{lookup_route, NetDbContext, SendResult};
use crate::identity::{Identity, NetPrefix, RoutingKey};
use crate::messages::NetDbMessage;
use crate::protocols::Transport;
use crate::search::{
    classify_reply, reply_selector, LookupError, LookupOutcome, LookupRequest, ReplyClass,
    SearchState,
};

/// Extra floodfills gathered beyond the try limit at start.
const EXTRA_PEERS: usize = 1;

/// Floodfills running at least this long use the smaller try limit.
const FLOODFILL_LIMIT_UPTIME: Duration = Duration::from_secs(30 * 60);

struct IterativeSearch<T: Transport> {
    ctx: Arc<NetDbContext<T>>,
    request: LookupRequest,
    rkey: RoutingKey,
    expiration: Instant,
    limit: usize,
    state: SearchState,
    to_try: BTreeMap<[u8; 32], Identity>,
    skipped: HashSet<Identity>,
    queried_prefixes: HashSet<NetPrefix>,
}

pub async fn search<T: Transport>(ctx: Arc<NetDbContext<T>>, request: LookupRequest) -> LookupOutcome {
    let budget = request.timeout.min(ctx.config.lookup.max_search_time);
    let expiration = Instant::now() + budget;
    let limit = if ctx.is_floodfill() && ctx.uptime() > FLOODFILL_LIMIT_UPTIME {
        ctx.config.lookup.floodfill_search_limit
    } else {
        ctx.config.lookup.total_search_limit
    };
    let rkey = ctx.routing_key(&request.key);
    let walk = IterativeSearch {
        ctx,
        request,
        rkey,
        expiration,
        limit,
        state: SearchState::default(),
        to_try: BTreeMap::new(),
        skipped: HashSet::new(),
        queried_prefixes: HashSet::new(),
    };
    walk.run().await
}

impl<T: Transport> IterativeSearch<T> {
    async fn run(mut self) -> LookupOutcome {
        let key = self.request.key;
        self.seed()?;

        let mut replies = self.ctx.replies.register(reply_selector(key), self.expiration);
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SendResult>();

        loop {
            if let Some(err) = self.retry(&send_tx) {
                return Err(self.failed(err));
            }

            let wake = self
                .state
                .next_deadline()
                .map_or(self.expiration, |d| d.min(self.expiration));

            tokio::select! {
                reply = replies.recv_until(wake) => match reply {
                    Some((from, message)) => {
                        if let Some(outcome) = self.on_reply(from, message) {
                            return outcome;
                        }
                    }
                    None => self.on_timeouts(),
                },
                Some((peer, ok)) = send_rx.recv() => {
                    if !ok && self.state.fail(&peer) {
                        // No path to the peer counts the same as a timeout.
                        self.ctx.reliability.record_lookup_result(&peer, false, None);
                    }
                }
            }

            if Instant::now() >= self.expiration {
                return Err(self.failed(LookupError::Timeout));
            }
        }
    }

    fn seed(&mut self) -> Result<(), LookupError> {
        let key = self.request.key;
        let exclude = HashSet::from([key]);
        let floodfills = self.ctx.selector().select_floodfill_participants(
            &self.rkey,
            self.limit + EXTRA_PEERS,
            &exclude,
        );

        if floodfills.is_empty() {
            warn!(key = %key.short(), "no floodfills known, asking random routers");
            let fallback = self
                .ctx
                .routing
                .random_peers(self.ctx.config.lookup.non_floodfill_fallback, &exclude);
            if fallback.is_empty() {
                warn!(key = %key.short(), "no peers known at all");
                return Err(LookupError::NoPeers);
            }
            for peer in fallback {
                self.to_try.insert(self.rkey.distance_to(&peer), peer);
            }
        } else {
            for peer in floodfills {
                self.new_peer_to_try(peer);
            }
        }

        if self.to_try.is_empty() {
            return Err(LookupError::NoPeers);
        }
        Ok(())
    }

    /// Send queries up to the concurrency and try limits. Returns an error
    /// once the search can no longer succeed.
    fn retry(&mut self, send_tx: &mpsc::UnboundedSender<SendResult>) -> Option<LookupError> {
        let now = Instant::now();
        if now >= self.expiration {
            return Some(LookupError::Timeout);
        }
        let max_concurrent = self.ctx.config.lookup.max_concurrent;
        let enough_time =
            self.expiration.duration_since(now) >= self.ctx.config.lookup.min_single_search_time;

        while enough_time {
            let pending = self.state.pending_count();
            if pending >= max_concurrent {
                break;
            }
            let done = self.state.failed_count();
            if done >= self.limit {
                return Some(LookupError::NotFound);
            }
            if done + pending >= self.limit {
                break;
            }
            let Some(peer) = self.next_peer() else {
                break;
            };
            self.send_query(peer, now, send_tx);
        }

        if self.state.pending_count() == 0 && (self.to_try.is_empty() || !enough_time) {
            if self.to_try.is_empty() {
                return Some(LookupError::NotFound);
            }
            return Some(LookupError::Timeout);
        }
        None
    }

    /// Nearest untried peer whose network prefix was not queried yet.
    fn next_peer(&mut self) -> Option<Identity> {
        while let Some((_, peer)) = self.to_try.pop_first() {
            let prefixes = self
                .ctx
                .data
                .router_info(&peer)
                .map(|ri| ri.net_prefixes())
                .unwrap_or_default();
            if prefixes.iter().any(|p| self.queried_prefixes.contains(p)) {
                trace!(key = %self.request.key.short(), peer = %peer.short(), "skipping peer sharing a prefix with a queried one");
                self.skipped.insert(peer);
                continue;
            }
            self.queried_prefixes.extend(prefixes);
            return Some(peer);
        }
        None
    }

    fn send_query(&mut self, peer: Identity, now: Instant, send_tx: &mpsc::UnboundedSender<SendResult>) {
        let per_try = self.ctx.single_search_time(&peer);
        let deadline = (now + per_try).min(self.expiration);
        self.state.dispatch(peer, now, deadline);

        let dont_include: HashSet<Identity> = self.state.attempted().clone();
        let message = self
            .ctx
            .lookup_message(self.request.key, self.request.kind, &dont_include);
        let route = lookup_route(self.request.kind);
        debug!(
            key = %self.request.key.short(),
            peer = %peer.short(),
            attempt = self.state.attempted().len(),
            timeout_ms = per_try.as_millis() as u64,
            "iterative lookup query sent"
        );
        self.ctx.spawn_send(peer, message, route, deadline, send_tx.clone());
    }

    fn on_reply(&mut self, from: Identity, message: NetDbMessage) -> Option<LookupOutcome> {
        if !self.state.is_pending(&from) {
            trace!(key = %self.request.key.short(), peer = %from.short(), "ignoring reply from peer not awaited");
            return None;
        }
        let now = Instant::now();
        match classify_reply(&self.ctx, &self.request, message) {
            ReplyClass::Found(entry) => {
                let latency = self.state.succeed(&from, now);
                self.ctx.reliability.record_lookup_result(&from, true, latency);
                info!(
                    key = %self.request.key.short(),
                    peer = %from.short(),
                    tries = self.state.attempted().len(),
                    "iterative lookup succeeded"
                );
                Some(Ok(entry))
            }
            ReplyClass::Closer(peers) => {
                self.state.fail(&from);
                trace!(key = %self.request.key.short(), peer = %from.short(), offered = peers.len(), "search reply");
                for peer in peers {
                    self.new_peer_to_try(peer);
                }
                None
            }
            ReplyClass::WrongKind => {
                self.state.fail(&from);
                None
            }
            ReplyClass::Invalid => {
                if self.state.fail(&from) {
                    self.ctx.reliability.record_lookup_result(&from, false, None);
                }
                None
            }
            ReplyClass::Unrelated => None,
        }
    }

    fn on_timeouts(&mut self) {
        for peer in self.state.take_timed_out(Instant::now()) {
            debug!(key = %self.request.key.short(), peer = %peer.short(), "iterative lookup try timed out");
            self.ctx.reliability.record_lookup_result(&peer, false, None);
        }
    }

    /// Queue a peer learned from a reply, unless it cannot help.
    fn new_peer_to_try(&mut self, peer: Identity) {
        if peer == self.ctx.local || peer == self.request.key {
            return;
        }
        if self.ctx.banlist.is_banned_forever(&peer) {
            return;
        }
        if self.ctx.data.is_known_non_floodfill(&peer) {
            return;
        }
        if self.state.was_attempted(&peer) || self.skipped.contains(&peer) {
            return;
        }
        self.to_try.insert(self.rkey.distance_to(&peer), peer);
    }

    /// Terminal failure: blame everyone who never answered.
    fn failed(&mut self, err: LookupError) -> LookupError {
        for peer in self.state.pending_peers() {
            self.state.fail(&peer);
            self.ctx.reliability.record_lookup_result(&peer, false, None);
        }
        info!(
            key = %self.request.key.short(),
            tries = self.state.attempted().len(),
            error = %err,
            "iterative lookup failed"
        );
        err
    }
}
