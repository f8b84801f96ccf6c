//! # Store & Verify Pipeline
//!
//! ```text
//!   store ──▶ nearest floodfills ──▶ parallel sends ──▶ redundancy reached
//!                                                          │ (floodfill store)
//!                                                          ▼
//!                          resend ◀── older / no answer ── verify at another floodfill
//! ```
//!
//! A send counts as accepted once the transport reports a local success
//! within the per-peer timeout, or, with `require_delivery_ack`, once the
//! peer acknowledges the store token. The store completes as soon as
//! `redundancy` peers accepted; stragglers keep running in the background and
//! only feed the reliability collaborator.
//!
//! Verification asks a *different* floodfill for the key after a short delay.
//! Only a record at least as new as the stored one counts. An older answer
//! triggers an immediate resend; misses and timeouts move on to the next
//! verifier. Resends exclude every peer already involved with this key.
//!
//! [`flood`] is the fire-and-forget fan-out a floodfill performs after
//! accepting a new record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::StoreConfig;
use crate::context::{lookup_route, NetDbContext, SendResult};
use crate::data_store::RejectReason;
use crate::identity::Identity;
use crate::messages::{DatabaseStore, NetDbMessage};
use crate::protocols::{Route, Transport};
use crate::record::{DatabaseEntry, LookupKind, RecordKind};
use crate::replies::Selector;
use crate::search::reply_selector;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOptions {
    /// Accepting peers needed for success.
    pub redundancy: usize,
    /// Sends outstanding at once.
    pub parallelization: usize,
    /// Verify at another floodfill after success.
    pub verify: bool,
}

impl StoreOptions {
    pub fn standard(config: &StoreConfig) -> Self {
        Self {
            redundancy: config.redundancy,
            parallelization: config.parallelization,
            verify: false,
        }
    }

    /// Floodfills propagate further themselves, so one recipient is enough.
    pub fn floodfill() -> Self {
        Self {
            redundancy: 1,
            parallelization: 1,
            verify: true,
        }
    }

    pub fn with_redundancy(mut self, redundancy: usize) -> Self {
        self.redundancy = redundancy.max(1);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The record failed local validation.
    Rejected(RejectReason),
    /// A newer version of the record is already held.
    Stale,
    /// No floodfill was known to send to.
    NoPeers,
    /// Every candidate was tried without reaching redundancy.
    Exhausted { accepted: usize },
    /// The deadline passed before redundancy was reached.
    Timeout { accepted: usize },
    Shutdown,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Rejected(reason) => write!(f, "record rejected: {reason}"),
            StoreError::Stale => write!(f, "a newer version is already stored"),
            StoreError::NoPeers => write!(f, "no floodfills known to store to"),
            StoreError::Exhausted { accepted } => {
                write!(f, "ran out of peers after {accepted} acceptances")
            }
            StoreError::Timeout { accepted } => {
                write!(f, "store timed out after {accepted} acceptances")
            }
            StoreError::Shutdown => write!(f, "network database shut down"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// A verifier returned a record at least as new as ours.
    Verified { by: Identity, resends: usize },
    Failed { resends: usize },
}

#[derive(Debug)]
pub struct StoreReceipt {
    /// Peers that accepted the store.
    pub peers: Vec<Identity>,
    /// Background verification, when requested.
    pub verification: Option<JoinHandle<VerifyOutcome>>,
}

/// Store `entry` at the floodfills nearest `key`, skipping `exclude`.
///
/// Returns once `options.redundancy` peers accepted. With `options.verify`
/// the receipt carries the verification task.
pub async fn store<T: Transport>(
    ctx: &Arc<NetDbContext<T>>,
    key: Identity,
    entry: DatabaseEntry,
    options: StoreOptions,
    timeout: Duration,
    exclude: HashSet<Identity>,
) -> Result<StoreReceipt, StoreError> {
    let peers = send_store(ctx, key, &entry, options, timeout, &exclude).await?;
    let verification = options.verify.then(|| {
        tokio::spawn(verify(ctx.clone(), key, entry, peers.clone(), options, timeout, exclude))
    });
    Ok(StoreReceipt { peers, verification })
}

async fn send_store<T: Transport>(
    ctx: &Arc<NetDbContext<T>>,
    key: Identity,
    entry: &DatabaseEntry,
    options: StoreOptions,
    timeout: Duration,
    exclude: &HashSet<Identity>,
) -> Result<Vec<Identity>, StoreError> {
    let max_sent = ctx.config.store.max_peers_sent;
    let deadline = Instant::now() + timeout;
    let rkey = ctx.routing_key(&key);
    let mut skip = exclude.clone();
    skip.insert(key);

    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<SendResult>();
    let mut accepted = Vec::new();
    let mut pending = 0usize;
    let mut sent = 0usize;

    loop {
        if accepted.len() >= options.redundancy {
            info!(key = %key.short(), peers = accepted.len(), sent, "netdb store succeeded");
            return Ok(accepted);
        }

        let room = options
            .parallelization
            .saturating_sub(pending)
            .min(max_sent.saturating_sub(sent));
        if room > 0 {
            let peers = ctx.selector().select_floodfill_participants(&rkey, room, &skip);
            for peer in peers {
                skip.insert(peer);
                sent += 1;
                pending += 1;
                spawn_store_attempt(ctx, peer, key, entry.clone(), deadline, results_tx.clone());
            }
        }

        if pending == 0 {
            let err = if sent == 0 {
                StoreError::NoPeers
            } else {
                StoreError::Exhausted { accepted: accepted.len() }
            };
            warn!(key = %key.short(), sent, error = %err, "netdb store failed");
            return Err(err);
        }

        match timeout_at(deadline, results_rx.recv()).await {
            Ok(Some((peer, ok))) => {
                pending -= 1;
                if ok {
                    accepted.push(peer);
                }
            }
            Ok(None) | Err(_) => {
                let err = StoreError::Timeout { accepted: accepted.len() };
                warn!(key = %key.short(), sent, error = %err, "netdb store failed");
                return Err(err);
            }
        }
    }
}

/// One store send, resolved by local send result or delivery ack within the
/// per-peer timeout. Feeds the result to the reliability collaborator.
fn spawn_store_attempt<T: Transport>(
    ctx: &Arc<NetDbContext<T>>,
    peer: Identity,
    key: Identity,
    entry: DatabaseEntry,
    deadline: Instant,
    results: mpsc::UnboundedSender<SendResult>,
) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let peer_deadline = (Instant::now() + ctx.config.store.peer_timeout).min(deadline);
        let token = ctx.config.store.require_delivery_ack.then(|| ctx.next_token());
        let mut ack = token.map(|t| ctx.replies.register(ack_selector(t), peer_deadline));
        let route = store_route(entry.kind());
        let message = NetDbMessage::Store(DatabaseStore { key, entry, reply_token: token });

        let ok = match timeout_at(peer_deadline, ctx.transport.send(&peer, message, route)).await {
            Ok(Ok(())) => match ack.as_mut() {
                Some(handle) => handle.recv().await.is_some(),
                None => true,
            },
            Ok(Err(e)) => {
                trace!(key = %key.short(), peer = %peer.short(), error = %e, "store send failed");
                false
            }
            Err(_) => {
                trace!(key = %key.short(), peer = %peer.short(), "store send timed out");
                false
            }
        };
        ctx.reliability.record_store_result(&peer, ok);
        let _ = results.send((peer, ok));
    });
}

fn ack_selector(token: u64) -> Selector {
    Box::new(move |_, message| matches!(message, NetDbMessage::DeliveryAck(ack) if ack.token == token))
}

fn store_route(kind: RecordKind) -> Route {
    lookup_route(LookupKind::from(kind))
}

// ============================================================================
// Verification
// ============================================================================

enum Check {
    Current,
    Older,
    Missing,
}

async fn verify<T: Transport>(
    ctx: Arc<NetDbContext<T>>,
    key: Identity,
    entry: DatabaseEntry,
    mut stored_to: Vec<Identity>,
    options: StoreOptions,
    timeout: Duration,
    exclude: HashSet<Identity>,
) -> VerifyOutcome {
    let cfg = ctx.config.store.clone();
    let published = entry.published();
    let kind = LookupKind::from(entry.kind());
    let mut shunned = exclude;
    let mut resends = 0;

    loop {
        sleep(cfg.verify_delay).await;
        shunned.extend(stored_to.iter().copied());

        let mut asked = 0;
        while asked < cfg.max_verify_peers {
            let mut skip = shunned.clone();
            skip.insert(key);
            let rkey = ctx.routing_key(&key);
            let next = ctx.selector().select_floodfill_participants(&rkey, 1, &skip);
            let Some(verifier) = next.into_iter().next() else {
                debug!(key = %key.short(), asked, "no verifier left");
                break;
            };
            asked += 1;
            shunned.insert(verifier);

            match check(&ctx, verifier, key, kind, published, cfg.verify_timeout).await {
                Check::Current => {
                    info!(key = %key.short(), verifier = %verifier.short(), resends, "store verified");
                    return VerifyOutcome::Verified { by: verifier, resends };
                }
                Check::Older => {
                    info!(key = %key.short(), verifier = %verifier.short(), "verifier holds an older record");
                    break;
                }
                Check::Missing => {
                    debug!(key = %key.short(), verifier = %verifier.short(), "verifier does not hold the record");
                }
            }
        }

        if resends >= cfg.max_resends {
            warn!(key = %key.short(), resends, "store verification failed");
            return VerifyOutcome::Failed { resends };
        }
        resends += 1;
        info!(key = %key.short(), excluded = shunned.len(), "resending unverified store");
        match send_store(&ctx, key, &entry, options, timeout, &shunned).await {
            Ok(peers) => stored_to = peers,
            Err(e) => {
                warn!(key = %key.short(), error = %e, "store resend failed");
                return VerifyOutcome::Failed { resends };
            }
        }
    }
}

/// Ask one verifier for `key` and compare what comes back with `published`.
async fn check<T: Transport>(
    ctx: &Arc<NetDbContext<T>>,
    verifier: Identity,
    key: Identity,
    kind: LookupKind,
    published: u64,
    wait: Duration,
) -> Check {
    let answers = reply_selector(key);
    let started = Instant::now();
    let deadline = started + wait;
    let mut replies = ctx.replies.register(
        Box::new(move |from, m| *from == verifier && answers(from, m)),
        deadline,
    );
    let message = ctx.lookup_message(key, kind, &HashSet::new());
    let sent = timeout_at(deadline, ctx.transport.send(&verifier, message, lookup_route(kind))).await;
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            trace!(peer = %verifier.short(), error = %e, "verify send failed");
            ctx.reliability.record_lookup_result(&verifier, false, None);
            return Check::Missing;
        }
        Err(_) => {
            trace!(peer = %verifier.short(), "verify send timed out");
            ctx.reliability.record_lookup_result(&verifier, false, None);
            return Check::Missing;
        }
    }

    match replies.recv().await {
        Some((_, NetDbMessage::Store(reply))) => {
            if reply.entry.identity() != key || reply.entry.verify().is_err() {
                ctx.reliability.record_lookup_result(&verifier, false, None);
                return Check::Missing;
            }
            ctx.reliability
                .record_lookup_result(&verifier, true, Some(started.elapsed()));
            if reply.entry.published() >= published {
                Check::Current
            } else {
                Check::Older
            }
        }
        Some(_) => Check::Missing,
        None => {
            ctx.reliability.record_lookup_result(&verifier, false, None);
            Check::Missing
        }
    }
}

// ============================================================================
// Flood
// ============================================================================

/// Push `entry` to the floodfills nearest its routing key, and near the daily
/// rotation also to those nearest tomorrow's key. Returns the peers sent to.
pub fn flood<T: Transport>(ctx: &Arc<NetDbContext<T>>, entry: &DatabaseEntry) -> Vec<Identity> {
    let cfg = &ctx.config.store;
    let key = entry.identity();
    let mut skip = HashSet::from([key]);

    let mut peers = {
        let selector = ctx.selector();
        let mut peers =
            selector.select_floodfill_participants(&ctx.routing_key(&key), cfg.flood_peers, &skip);
        if ctx.keys.time_until_rotation() < cfg.rotation_advance {
            skip.extend(peers.iter().copied());
            let tomorrow = ctx.keys.next_routing_key(&key);
            peers.extend(selector.select_floodfill_participants(
                &tomorrow,
                cfg.flood_next_day_peers,
                &skip,
            ));
        }
        peers
    };
    peers.dedup();

    let route = store_route(entry.kind());
    let peer_timeout = cfg.peer_timeout;
    for peer in &peers {
        let ctx = ctx.clone();
        let peer = *peer;
        let message = NetDbMessage::Store(DatabaseStore {
            key,
            entry: entry.clone(),
            reply_token: None,
        });
        tokio::spawn(async move {
            let send = ctx.transport.send(&peer, message, route);
            let ok = matches!(tokio::time::timeout(peer_timeout, send).await, Ok(Ok(())));
            ctx.reliability.record_store_result(&peer, ok);
        });
    }
    debug!(key = %key.short(), peers = peers.len(), "flooded entry");
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetDbConfig;

    #[test]
    fn floodfill_options_store_once_and_verify() {
        let options = StoreOptions::floodfill();
        assert_eq!((options.redundancy, options.parallelization), (1, 1));
        assert!(options.verify);

        let standard = StoreOptions::standard(&NetDbConfig::default().store);
        assert_eq!((standard.redundancy, standard.parallelization), (4, 4));
        assert!(!standard.verify);
        assert_eq!(standard.with_redundancy(0).redundancy, 1);
    }

    #[test]
    fn errors_render() {
        assert_eq!(
            StoreError::Timeout { accepted: 1 }.to_string(),
            "store timed out after 1 acceptances"
        );
        assert!(StoreError::Rejected(RejectReason::KeyMismatch)
            .to_string()
            .contains("does not match"));
    }

    #[test]
    fn leaseset_stores_go_through_tunnels() {
        assert_eq!(store_route(RecordKind::RouterInfo), Route::Direct);
        assert_eq!(store_route(RecordKind::LeaseSet), Route::Exploratory);
    }
}
