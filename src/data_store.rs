//! # Data Store
//!
//! Validated in-memory map of identity hash to [`DatabaseEntry`].
//!
//! `put` checks, in order:
//!
//! 1. the record's self-computed hash equals the key it is stored under
//! 2. structure bounds and signature
//! 3. freshness: nothing stamped beyond the clock fudge in the future,
//!    no already-expired or overlong lease sets, no ancient router
//!    descriptors (unless we know almost no routers)
//! 4. a key never changes kind: a lease set cannot replace a router
//!    descriptor held under the same hash, nor the other way round
//! 5. ordering: an older version than the one held is dropped, an identical
//!    version is a no-op
//!
//! Nothing here expires entries on a timer. Removal only happens through
//! [`DataStore::remove`], called by maintenance or `NetDb::fail`.
//!
//! A floodfill index is maintained alongside the map so selection never
//! scans every stored record to find floodfills.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, trace};

use crate::config::DataStoreConfig;
use crate::crypto::SignatureError;
use crate::identity::{now_ms, Identity};
use crate::record::{DatabaseEntry, RecordKind, RouterInfo};

/// Why a record was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Self-computed hash differs from the key.
    KeyMismatch,
    /// Too many addresses, leases or an empty lease set.
    Malformed,
    BadSignature(SignatureError),
    /// Stamped further in the future than the clock fudge allows.
    FromTheFuture,
    /// Lease set whose earliest lease already ended.
    Expired,
    /// Lease set claiming leases further ahead than allowed.
    LeaseTooLong,
    /// Router descriptor older than the router expiry.
    RouterTooOld,
    /// A record of the other kind is already held under this key.
    KindConflict,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::KeyMismatch => write!(f, "record hash does not match key"),
            RejectReason::Malformed => write!(f, "record structure out of bounds"),
            RejectReason::BadSignature(e) => write!(f, "bad record signature: {e}"),
            RejectReason::FromTheFuture => write!(f, "record published too far in the future"),
            RejectReason::Expired => write!(f, "lease set already expired"),
            RejectReason::LeaseTooLong => write!(f, "lease set expires too far in the future"),
            RejectReason::RouterTooOld => write!(f, "router descriptor too old"),
            RejectReason::KindConflict => write!(f, "key already holds a record of another kind"),
        }
    }
}

impl std::error::Error for RejectReason {}

/// Result of [`DataStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored; carries the version it replaced, if any.
    Accepted { previous: Option<DatabaseEntry> },
    /// Same version already held; nothing changed.
    Duplicate,
    /// A newer version is already held; nothing changed.
    Stale,
    Rejected(RejectReason),
}

impl PutOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PutOutcome::Accepted { .. })
    }

    /// True if the store now holds a version at least as new as the one offered.
    pub fn is_current(&self) -> bool {
        matches!(self, PutOutcome::Accepted { .. } | PutOutcome::Duplicate)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Identity, DatabaseEntry>,
    floodfills: HashSet<Identity>,
    routers: usize,
}

impl Inner {
    fn index(&mut self, key: Identity, entry: &DatabaseEntry, delta_in: bool) {
        if entry.kind() == RecordKind::RouterInfo {
            if delta_in {
                self.routers += 1;
            } else {
                self.routers = self.routers.saturating_sub(1);
            }
        }
        if entry.is_floodfill_router() {
            if delta_in {
                self.floodfills.insert(key);
            } else {
                self.floodfills.remove(&key);
            }
        }
    }
}

pub struct DataStore {
    inner: RwLock<Inner>,
    config: DataStoreConfig,
}

impl DataStore {
    pub fn new(config: DataStoreConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
        }
    }

    pub fn get(&self, key: &Identity) -> Option<DatabaseEntry> {
        self.read().entries.get(key).cloned()
    }

    pub fn router_info(&self, key: &Identity) -> Option<RouterInfo> {
        match self.read().entries.get(key) {
            Some(DatabaseEntry::RouterInfo(ri)) => Some(ri.clone()),
            _ => None,
        }
    }

    pub fn is_known(&self, key: &Identity) -> bool {
        self.read().entries.contains_key(key)
    }

    /// True if we hold a descriptor for `key` that does not advertise floodfill.
    pub fn is_known_non_floodfill(&self, key: &Identity) -> bool {
        let inner = self.read();
        matches!(inner.entries.get(key), Some(DatabaseEntry::RouterInfo(ri)) if !ri.is_floodfill())
    }

    pub fn keys(&self) -> Vec<Identity> {
        self.read().entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn router_count(&self) -> usize {
        self.read().routers
    }

    pub fn lease_set_count(&self) -> usize {
        let inner = self.read();
        inner.entries.len() - inner.routers
    }

    /// Identities of every stored router advertising floodfill.
    pub fn floodfills(&self) -> Vec<Identity> {
        self.read().floodfills.iter().copied().collect()
    }

    pub fn floodfill_count(&self) -> usize {
        self.read().floodfills.len()
    }

    pub fn put(&self, key: Identity, entry: DatabaseEntry) -> PutOutcome {
        if let Err(reason) = self.validate(&key, &entry) {
            debug!(key = %key.short(), kind = ?entry.kind(), reason = %reason, "netdb store rejected");
            return PutOutcome::Rejected(reason);
        }

        let mut inner = self.write();
        if let Some(existing) = inner.entries.get(&key) {
            if existing.kind() != entry.kind() {
                debug!(key = %key.short(), held = ?existing.kind(), offered = ?entry.kind(), "netdb store rejected: kind conflict");
                return PutOutcome::Rejected(RejectReason::KindConflict);
            }
            if existing.published() > entry.published() {
                trace!(key = %key.short(), "netdb store ignored: newer version held");
                return PutOutcome::Stale;
            }
            if existing.published() == entry.published() {
                return PutOutcome::Duplicate;
            }
        }

        let previous = inner.entries.insert(key, entry.clone());
        if let Some(prev) = &previous {
            inner.index(key, prev, false);
        }
        inner.index(key, &entry, true);
        PutOutcome::Accepted { previous }
    }

    pub fn remove(&self, key: &Identity) -> Option<DatabaseEntry> {
        let mut inner = self.write();
        let removed = inner.entries.remove(key);
        if let Some(entry) = &removed {
            inner.index(*key, entry, false);
        }
        removed
    }

    fn validate(&self, key: &Identity, entry: &DatabaseEntry) -> Result<(), RejectReason> {
        if entry.identity() != *key {
            return Err(RejectReason::KeyMismatch);
        }
        if !entry.validate_structure() {
            return Err(RejectReason::Malformed);
        }
        entry.verify().map_err(RejectReason::BadSignature)?;

        let now = now_ms();
        let fudge = self.config.clock_fudge.as_millis() as u64;
        if entry.published() > now.saturating_add(fudge) {
            return Err(RejectReason::FromTheFuture);
        }

        match entry {
            DatabaseEntry::LeaseSet(ls) => {
                if ls.earliest_expiration() <= now {
                    return Err(RejectReason::Expired);
                }
                let max_future = self.config.max_lease_future.as_millis() as u64;
                if ls.latest_expiration() > now.saturating_add(max_future) {
                    return Err(RejectReason::LeaseTooLong);
                }
            }
            DatabaseEntry::RouterInfo(ri) => {
                let expiry = self.config.router_expiry.as_millis() as u64;
                let too_old = ri.published.saturating_add(expiry) < now;
                if too_old && self.router_count() >= self.config.min_remaining_routers {
                    return Err(RejectReason::RouterTooOld);
                }
            }
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
