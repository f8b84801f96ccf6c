//! # Lookup Engine
//!
//! Three interchangeable strategies share one contract: a [`LookupRequest`]
//! goes in, a [`LookupOutcome`] comes out, and a record found along the way
//! has already been validated into the data store.
//!
//! | Strategy | Module | Role |
//! |----------|--------|------|
//! | [`LookupStrategy::Iterative`] | `iterative_search` | production path, floodfill walk with peer folding |
//! | [`LookupStrategy::FloodOnly`] | `flood_search` | direct fan-out to known floodfills |
//! | [`LookupStrategy::Classic`] | `classic_search` | breadth-limited nearest-peer walk |
//!
//! The per-peer bookkeeping (pending, attempted, failed, succeeded, send
//! times and deadlines) lives in [`SearchState`] and is reused by all three.
//! A per-peer timeout fires at most once: it moves the peer from pending to
//! failed and later replies from that peer are ignored.
//!
//! Single-flight deduplication is done by the caller (`NetDb`), which keeps
//! one running lookup per key and fans its outcome out to every waiter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::trace;

use crate::context::NetDbContext;
use crate::data_store::PutOutcome;
use crate::identity::Identity;
use crate::messages::NetDbMessage;
use crate::protocols::Transport;
use crate::record::{DatabaseEntry, LookupKind};
use crate::replies::Selector;
use crate::{classic_search, flood_search, iterative_search};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStrategy {
    #[default]
    Iterative,
    FloodOnly,
    Classic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupError {
    /// Every candidate answered without the record or the try limit was hit.
    NotFound,
    /// The wall-clock budget ran out.
    Timeout,
    /// No peer was known to ask.
    NoPeers,
    /// The key failed too often recently.
    NegativeCached,
    /// The key belongs to a banned router.
    Banned,
    /// Looking up ourselves is refused.
    LocalIdentity,
    Shutdown,
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound => write!(f, "record not found"),
            LookupError::Timeout => write!(f, "lookup timed out"),
            LookupError::NoPeers => write!(f, "no peers known to query"),
            LookupError::NegativeCached => write!(f, "key is negatively cached"),
            LookupError::Banned => write!(f, "key belongs to a banned router"),
            LookupError::LocalIdentity => write!(f, "refusing to look up the local identity"),
            LookupError::Shutdown => write!(f, "network database shut down"),
        }
    }
}

impl std::error::Error for LookupError {}

pub type LookupOutcome = Result<DatabaseEntry, LookupError>;

#[derive(Clone, Copy, Debug)]
pub struct LookupRequest {
    pub key: Identity,
    pub kind: LookupKind,
    pub timeout: Duration,
}

/// Run one lookup with the chosen strategy.
pub async fn run<T: Transport>(
    ctx: Arc<NetDbContext<T>>,
    strategy: LookupStrategy,
    request: LookupRequest,
) -> LookupOutcome {
    trace!(key = %request.key.short(), ?strategy, timeout_ms = request.timeout.as_millis() as u64, "lookup started");
    match strategy {
        LookupStrategy::Iterative => iterative_search::search(ctx, request).await,
        LookupStrategy::FloodOnly => flood_search::search(ctx, request).await,
        LookupStrategy::Classic => classic_search::search(ctx, request).await,
    }
}

// ============================================================================
// Per-peer bookkeeping
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct Outstanding {
    sent: Instant,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct SearchState {
    pending: HashMap<Identity, Outstanding>,
    attempted: HashSet<Identity>,
    failed: HashSet<Identity>,
    succeeded: HashSet<Identity>,
}

impl SearchState {
    /// Record a query sent to `peer`. Returns false if it was already attempted.
    pub fn dispatch(&mut self, peer: Identity, now: Instant, deadline: Instant) -> bool {
        if !self.attempted.insert(peer) {
            return false;
        }
        self.pending.insert(peer, Outstanding { sent: now, deadline });
        true
    }

    pub fn is_pending(&self, peer: &Identity) -> bool {
        self.pending.contains_key(peer)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_peers(&self) -> Vec<Identity> {
        self.pending.keys().copied().collect()
    }

    pub fn was_attempted(&self, peer: &Identity) -> bool {
        self.attempted.contains(peer)
    }

    pub fn attempted(&self) -> &HashSet<Identity> {
        &self.attempted
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn succeeded(&self) -> &HashSet<Identity> {
        &self.succeeded
    }

    /// Move `peer` from pending to failed. Returns false if it was not pending,
    /// so a timeout or failure is only ever acted on once.
    pub fn fail(&mut self, peer: &Identity) -> bool {
        if self.pending.remove(peer).is_none() {
            return false;
        }
        self.failed.insert(*peer);
        true
    }

    /// Move `peer` from pending to succeeded and return its response time.
    pub fn succeed(&mut self, peer: &Identity, now: Instant) -> Option<Duration> {
        let out = self.pending.remove(peer)?;
        self.succeeded.insert(*peer);
        Some(now.saturating_duration_since(out.sent))
    }

    /// Time since the query to `peer` was sent, if it is still pending.
    pub fn elapsed(&self, peer: &Identity, now: Instant) -> Option<Duration> {
        self.pending
            .get(peer)
            .map(|o| now.saturating_duration_since(o.sent))
    }

    /// Earliest per-peer deadline among pending queries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|o| o.deadline).min()
    }

    /// Fail every pending peer whose deadline has passed and return them.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<Identity> {
        let expired: Vec<Identity> = self
            .pending
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(p, _)| *p)
            .collect();
        for peer in &expired {
            self.fail(peer);
        }
        expired
    }
}

// ============================================================================
// Reply handling
// ============================================================================

/// What a reply means for the search that received it.
#[derive(Debug)]
pub enum ReplyClass {
    /// The record, already accepted into the data store.
    Found(DatabaseEntry),
    /// A miss naming peers believed closer to the key.
    Closer(Vec<Identity>),
    /// A valid record of a kind the lookup did not ask for.
    WrongKind,
    /// A record that failed validation.
    Invalid,
    /// Not an answer to this lookup.
    Unrelated,
}

/// Selector matching answers for `key`: a store or a search reply.
pub fn reply_selector(key: Identity) -> Selector {
    Box::new(move |_, message| match message {
        NetDbMessage::Store(m) => m.key == key,
        NetDbMessage::SearchReply(m) => m.key == key,
        _ => false,
    })
}

/// Classify a reply and store any record it carries.
pub fn classify_reply<T: Transport>(
    ctx: &NetDbContext<T>,
    request: &LookupRequest,
    message: NetDbMessage,
) -> ReplyClass {
    match message {
        NetDbMessage::Store(store) if store.key == request.key => {
            if !request.kind.accepts(store.entry.kind()) {
                return ReplyClass::WrongKind;
            }
            match ctx.accept_entry(store.key, store.entry.clone()) {
                PutOutcome::Accepted { .. } | PutOutcome::Duplicate => ReplyClass::Found(store.entry),
                PutOutcome::Stale => match ctx.data.get(&store.key) {
                    Some(held) => ReplyClass::Found(held),
                    None => ReplyClass::Found(store.entry),
                },
                PutOutcome::Rejected(_) => ReplyClass::Invalid,
            }
        }
        NetDbMessage::SearchReply(reply) if reply.key == request.key => ReplyClass::Closer(reply.peers),
        _ => ReplyClass::Unrelated,
    }
}
