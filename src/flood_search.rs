//! Flood-only lookup: query a couple of known floodfills directly.
//!
//! No walk and no per-try timeout, just one shared deadline for the batch.
//! Untested, failing and unreachable floodfills are moved to the back of
//! the candidate list. The lookup fails as soon as every queried floodfill
//! has answered with a miss.
//!
//! When we know very few floodfills, peers named in search replies are
//! followed up: we ask the replying floodfill for each unknown peer's router
//! descriptor. This is how a freshly started node, or one that was offline
//! for long, finds its way back to the floodfill set.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

use crate::context::{lookup_route, NetDbContext, SendResult};
use crate::identity::Identity;
use crate::protocols::{Route, Transport};
use crate::record::{DatabaseEntry, LookupKind};
use crate::search::{
    classify_reply, reply_selector, LookupError, LookupOutcome, LookupRequest, ReplyClass,
    SearchState,
};

pub async fn search<T: Transport>(ctx: Arc<NetDbContext<T>>, request: LookupRequest) -> LookupOutcome {
    let cfg = &ctx.config.lookup;
    let key = request.key;
    let expiration = Instant::now() + request.timeout.min(cfg.max_search_time);
    let rkey = ctx.routing_key(&key);

    let mut candidates = ctx.selector().select_floodfill_participants(
        &rkey,
        cfg.flood_only_concurrent.max(cfg.flood_only_followup_threshold),
        &HashSet::from([key]),
    );
    // Stable: distance order is kept inside both groups.
    candidates.sort_by_key(|p| ctx.reliability.tier(p).is_deprioritized());
    candidates.truncate(cfg.flood_only_concurrent);
    if candidates.is_empty() {
        debug!(key = %key.short(), "flood-only lookup has no floodfills to ask");
        return Err(LookupError::NoPeers);
    }

    let mut replies = ctx.replies.register(reply_selector(key), expiration);
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<SendResult>();
    let mut state = SearchState::default();
    let now = Instant::now();
    let message = ctx.lookup_message(key, request.kind, &HashSet::new());
    let route = lookup_route(request.kind);
    for peer in &candidates {
        state.dispatch(*peer, now, expiration);
        ctx.spawn_send(*peer, message.clone(), route, expiration, send_tx.clone());
    }
    debug!(key = %key.short(), peers = candidates.len(), "flood-only lookup sent");

    let outcome = loop {
        if state.pending_count() == 0 {
            break Err(LookupError::NotFound);
        }
        tokio::select! {
            reply = replies.recv() => match reply {
                Some((from, message)) => {
                    if !state.is_pending(&from) {
                        continue;
                    }
                    match classify_reply(&ctx, &request, message) {
                        ReplyClass::Found(entry) => {
                            let latency = state.succeed(&from, Instant::now());
                            ctx.reliability.record_lookup_result(&from, true, latency);
                            break Ok(entry);
                        }
                        ReplyClass::Closer(peers) => {
                            state.fail(&from);
                            follow_up(&ctx, from, peers);
                        }
                        ReplyClass::WrongKind => {
                            state.fail(&from);
                        }
                        ReplyClass::Invalid => {
                            if state.fail(&from) {
                                ctx.reliability.record_lookup_result(&from, false, None);
                            }
                        }
                        ReplyClass::Unrelated => {}
                    }
                }
                None => break Err(LookupError::Timeout),
            },
            Some((peer, ok)) = send_rx.recv() => {
                if !ok && state.fail(&peer) {
                    ctx.reliability.record_lookup_result(&peer, false, None);
                }
            }
        }
    };

    match &outcome {
        Ok(_) => info!(key = %key.short(), "flood-only lookup succeeded"),
        Err(err) => {
            for peer in state.pending_peers() {
                ctx.reliability.record_lookup_result(&peer, false, None);
            }
            info!(key = %key.short(), error = %err, "flood-only lookup failed");
        }
    }
    outcome
}

/// Ask `replier` for the descriptors of the unknown floodfills it named,
/// but only while we know too few floodfills to manage without them.
fn follow_up<T: Transport>(ctx: &Arc<NetDbContext<T>>, replier: Identity, peers: Vec<Identity>) {
    if ctx.data.floodfill_count() >= ctx.config.lookup.flood_only_followup_threshold {
        return;
    }
    for peer in peers {
        if peer == ctx.local || ctx.data.is_known(&peer) || ctx.banlist.is_banned(&peer) {
            continue;
        }
        trace!(peer = %peer.short(), via = %replier.short(), "following up search reply peer");
        tokio::spawn(single_lookup(ctx.clone(), replier, peer));
    }
}

/// One-shot router descriptor lookup against a single peer.
pub async fn single_lookup<T: Transport>(
    ctx: Arc<NetDbContext<T>>,
    ask: Identity,
    target: Identity,
) -> Option<DatabaseEntry> {
    let request = LookupRequest {
        key: target,
        kind: LookupKind::RouterInfo,
        timeout: ctx.config.lookup.single_lookup_timeout,
    };
    let deadline = Instant::now() + request.timeout;
    let mut replies = ctx.replies.register(
        Box::new(move |from, m| *from == ask && m.key() == Some(&target)),
        deadline,
    );
    let message = ctx.lookup_message(target, LookupKind::RouterInfo, &HashSet::new());
    match timeout_at(deadline, ctx.transport.send(&ask, message, Route::Direct)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            trace!(peer = %ask.short(), error = %e, "single lookup send failed");
            return None;
        }
        Err(_) => {
            trace!(peer = %ask.short(), "single lookup send timed out");
            return None;
        }
    }

    while let Some((_, message)) = replies.recv().await {
        match classify_reply(&ctx, &request, message) {
            ReplyClass::Found(entry) => return Some(entry),
            ReplyClass::Closer(_) | ReplyClass::WrongKind | ReplyClass::Invalid => return None,
            ReplyClass::Unrelated => {}
        }
    }
    None
}
