//! # Routing Table (XOR-Metric)
//!
//! Known peer identities partitioned into fixed buckets by XOR distance from
//! the local identity.
//!
//! ## Bucket Layout
//!
//! A distance's *bit length* is the index of its highest set bit plus one
//! (zero for the zero distance). Buckets cover consecutive bit-length ranges
//! of [`BUCKET_WIDTH_BITS`] each:
//!
//! ```text
//!   bucket 0        bit length 0..=3    distances [0, 2^3)
//!   bucket i        bit length 3i+1..=3i+3
//!   bucket last     absorbs the remainder up to bit length 256
//! ```
//!
//! Ranges are fixed at construction and there is no bucket splitting,
//! replacement cache or per-bucket capacity. Trimming stale peers is the job
//! of external maintenance via [`RoutingTable::remove`].
//!
//! ## Concurrency
//!
//! Each bucket has its own lock, so lookups touching different buckets never
//! contend. The total size is an atomic counter maintained on add/remove and
//! is approximate while mutations are in flight.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::error;

use crate::identity::Identity;

/// Bits of distance covered by one bucket.
pub const BUCKET_WIDTH_BITS: u16 = 3;

/// Bits in an identity hash.
const HASH_BITS: u16 = 256;

/// Inclusive range of distance bit lengths covered by one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketRange {
    pub begin: u16,
    pub end: u16,
}

impl BucketRange {
    #[inline]
    pub fn contains(&self, bit_len: u16) -> bool {
        self.begin <= bit_len && bit_len <= self.end
    }
}

/// Position of the highest set bit plus one; zero for the zero distance.
pub fn bit_length(distance: &[u8; 32]) -> u16 {
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as u16;
            return HASH_BITS - (byte_idx as u16 * 8 + leading);
        }
    }
    0
}

fn build_ranges(width: u16) -> Vec<BucketRange> {
    let width = width.clamp(1, HASH_BITS);
    let count = HASH_BITS / width;
    let mut ranges = Vec::with_capacity(count as usize);
    for i in 0..count {
        let begin = if i == 0 { 0 } else { i * width + 1 };
        let end = if i + 1 == count { HASH_BITS } else { (i + 1) * width };
        ranges.push(BucketRange { begin, end });
    }
    ranges
}

#[derive(Debug)]
pub struct RoutingTable {
    local: Identity,
    ranges: Vec<BucketRange>,
    buckets: Vec<RwLock<HashSet<Identity>>>,
    size: AtomicUsize,
}

impl RoutingTable {
    pub fn new(local: Identity) -> Self {
        Self::with_bucket_width(local, BUCKET_WIDTH_BITS)
    }

    pub fn with_bucket_width(local: Identity, width: u16) -> Self {
        let ranges = build_ranges(width);
        let buckets = ranges.iter().map(|_| RwLock::new(HashSet::new())).collect();
        Self {
            local,
            ranges,
            buckets,
            size: AtomicUsize::new(0),
        }
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    pub fn bucket_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn bucket_range(&self, index: usize) -> Option<BucketRange> {
        self.ranges.get(index).copied()
    }

    /// Index of the bucket whose range holds `peer`'s distance from us.
    ///
    /// Ranges cover every bit length by construction, so `None` means the
    /// table itself is broken; that is logged rather than raised.
    pub fn pick_bucket(&self, peer: &Identity) -> Option<usize> {
        let bit_len = bit_length(&self.local.xor_distance(peer));
        let found = self.ranges.iter().position(|r| r.contains(bit_len));
        if found.is_none() {
            error!(
                peer = %peer.short(),
                bit_len,
                buckets = self.ranges.len(),
                "no routing bucket covers distance"
            );
        }
        found
    }

    /// Returns true if the peer was not already present.
    pub fn add(&self, peer: Identity) -> bool {
        if peer == self.local {
            return false;
        }
        let Some(idx) = self.pick_bucket(&peer) else {
            return false;
        };
        let inserted = self.buckets[idx]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer);
        if inserted {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Returns true if the peer was present.
    pub fn remove(&self, peer: &Identity) -> bool {
        let Some(idx) = self.pick_bucket(peer) else {
            return false;
        };
        let removed = self.buckets[idx]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
        if removed {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn contains(&self, peer: &Identity) -> bool {
        self.pick_bucket(peer).is_some_and(|idx| {
            self.buckets[idx]
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(peer)
        })
    }

    /// Visit every known peer. Each bucket is locked only while it is visited.
    pub fn get_all(&self, mut visitor: impl FnMut(&Identity)) {
        for bucket in &self.buckets {
            let guard = bucket.read().unwrap_or_else(PoisonError::into_inner);
            for peer in guard.iter() {
                visitor(peer);
            }
        }
    }

    pub fn all(&self) -> Vec<Identity> {
        let mut out = Vec::with_capacity(self.approximate_size());
        self.get_all(|peer| out.push(*peer));
        out
    }

    /// Up to `count` random peers not in `exclude`.
    pub fn random_peers(&self, count: usize, exclude: &HashSet<Identity>) -> Vec<Identity> {
        let mut peers: Vec<Identity> = Vec::new();
        self.get_all(|peer| {
            if !exclude.contains(peer) {
                peers.push(*peer);
            }
        });
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(count);
        peers
    }

    /// Indices of buckets holding fewer than `threshold` peers.
    pub fn sparse_buckets(&self, threshold: usize) -> Vec<usize> {
        self.bucket_sizes()
            .into_iter()
            .enumerate()
            .filter(|(_, len)| *len < threshold)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// A random key whose distance from us falls inside bucket `index`.
    /// Never the local identity.
    pub fn random_key_in_bucket(&self, index: usize) -> Option<Identity> {
        let range = self.bucket_range(index)?;
        let mut rng = rand::thread_rng();
        let bit_len = rng.gen_range(range.begin.max(1)..=range.end);
        let top = bit_len - 1;
        let top_byte = 31 - (top / 8) as usize;
        let top_bit = (top % 8) as u32;

        let mut distance: [u8; 32] = rng.gen();
        distance[..top_byte].fill(0);
        distance[top_byte] &= u8::MAX >> (7 - top_bit);
        distance[top_byte] |= 1 << top_bit;

        let local = self.local.as_bytes();
        Some(Identity::from_bytes(std::array::from_fn(|i| local[i] ^ distance[i])))
    }

    /// Maintained incrementally; approximate under concurrent mutation.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .map(|b| b.read().unwrap_or_else(PoisonError::into_inner).len())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity_with_distance_bit(local: &Identity, bit_len: u16) -> Identity {
        let mut distance = [0u8; 32];
        if bit_len > 0 {
            let bit = bit_len - 1;
            let byte_idx = 31 - (bit / 8) as usize;
            distance[byte_idx] = 1 << (bit % 8);
        }
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = local.as_bytes()[i] ^ distance[i];
        }
        Identity::from_bytes(out)
    }

    #[test]
    fn ranges_partition_every_bit_length() {
        let ranges = build_ranges(BUCKET_WIDTH_BITS);
        assert_eq!(ranges.len(), 85);
        assert_eq!(ranges[0].begin, 0);
        assert_eq!(ranges.last().unwrap().end, HASH_BITS);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].begin, "gap or overlap between buckets");
        }
        for bit_len in 0..=HASH_BITS {
            let covering = ranges.iter().filter(|r| r.contains(bit_len)).count();
            assert_eq!(covering, 1, "bit length {bit_len} covered {covering} times");
        }
    }

    #[test]
    fn last_bucket_absorbs_remainder_bit() {
        let ranges = build_ranges(BUCKET_WIDTH_BITS);
        let last = ranges.last().unwrap();
        assert_eq!(last.end - last.begin + 1, BUCKET_WIDTH_BITS + 1);
    }

    #[test]
    fn bit_length_of_known_distances() {
        assert_eq!(bit_length(&[0u8; 32]), 0);
        let mut one = [0u8; 32];
        one[31] = 1;
        assert_eq!(bit_length(&one), 1);
        let mut top = [0u8; 32];
        top[0] = 0x80;
        assert_eq!(bit_length(&top), 256);
    }

    #[test]
    fn local_identity_is_never_added() {
        let local = Identity::random();
        let table = RoutingTable::new(local);
        assert!(!table.add(local));
        assert_eq!(table.approximate_size(), 0);
    }

    #[test]
    fn add_and_remove_report_membership_changes() {
        let local = Identity::random();
        let table = RoutingTable::new(local);
        let peer = Identity::random();

        assert!(table.add(peer));
        assert!(!table.add(peer));
        assert!(table.contains(&peer));
        assert_eq!(table.approximate_size(), 1);

        assert!(table.remove(&peer));
        assert!(!table.remove(&peer));
        assert!(!table.contains(&peer));
        assert_eq!(table.approximate_size(), 0);
    }

    #[test]
    fn peers_land_in_the_bucket_for_their_distance() {
        let local = Identity::random();
        let table = RoutingTable::new(local);
        for bit_len in [1u16, 3, 4, 100, 252, 253, 256] {
            let peer = identity_with_distance_bit(&local, bit_len);
            let idx = table.pick_bucket(&peer).unwrap();
            assert!(table.bucket_range(idx).unwrap().contains(bit_len));
            table.add(peer);
            assert!(table.bucket_sizes()[idx] >= 1);
        }
        assert_eq!(table.all().len(), 7);
    }

    #[test]
    fn random_bucket_keys_land_in_their_bucket() {
        let local = Identity::random();
        let table = RoutingTable::new(local);
        for idx in 0..table.bucket_count() {
            for _ in 0..8 {
                let key = table.random_key_in_bucket(idx).unwrap();
                assert_ne!(key, local);
                assert_eq!(table.pick_bucket(&key), Some(idx));
            }
        }
        assert_eq!(table.random_key_in_bucket(table.bucket_count()), None);
    }

    #[test]
    fn sparse_buckets_are_those_below_threshold() {
        let local = Identity::random();
        let table = RoutingTable::new(local);
        let last = table.bucket_count() - 1;
        assert!(table.add(identity_with_distance_bit(&local, 256)));
        assert_eq!(table.bucket_sizes()[last], 1);
        let sparse = table.sparse_buckets(1);
        assert!(!sparse.contains(&last));
        assert_eq!(sparse.len(), table.bucket_count() - 1);
        assert_eq!(table.sparse_buckets(0), Vec::<usize>::new());
    }

    #[test]
    fn random_peers_respects_exclusions() {
        let table = RoutingTable::new(Identity::random());
        let peers: Vec<_> = (0..10).map(|_| Identity::random()).collect();
        for p in &peers {
            table.add(*p);
        }
        let exclude: HashSet<_> = peers[..8].iter().copied().collect();
        let picked = table.random_peers(5, &exclude);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|p| !exclude.contains(p)));
    }

    proptest! {
        #[test]
        fn pick_bucket_finds_exactly_one_matching_range(local in any::<[u8; 32]>(), peer in any::<[u8; 32]>()) {
            let local = Identity::from_bytes(local);
            let peer = Identity::from_bytes(peer);
            let table = RoutingTable::new(local);
            let bit_len = bit_length(&local.xor_distance(&peer));

            let idx = table.pick_bucket(&peer).expect("every distance is covered");
            prop_assert!(table.bucket_range(idx).unwrap().contains(bit_len));

            let matches = (0..table.bucket_count())
                .filter(|i| table.bucket_range(*i).unwrap().contains(bit_len))
                .count();
            prop_assert_eq!(matches, 1);
        }

        #[test]
        fn a_peer_is_in_at_most_one_bucket(peers in proptest::collection::vec(any::<[u8; 32]>(), 1..40)) {
            let table = RoutingTable::new(Identity::from_bytes([0x5a; 32]));
            for p in &peers {
                table.add(Identity::from_bytes(*p));
            }
            let total: usize = table.bucket_sizes().iter().sum();
            let unique: HashSet<_> = table.all().into_iter().collect();
            prop_assert_eq!(total, unique.len());
            prop_assert_eq!(total, table.approximate_size());
        }
    }
}
