//! # Identities, Routing Keys and Signing Keys
//!
//! - [`Identity`]: 32-byte identity hash naming a router or a database record
//! - [`RoutingKey`]: the time-rotated form of an identity used for every
//!   XOR-distance comparison
//! - [`Keypair`]: Ed25519 signing keypair owning a router or destination
//!
//! ## Identity Model
//!
//! A router's identity hash is `BLAKE3(signing public key)`. Lease sets are
//! keyed the same way by their destination's signing key, so both record
//! kinds share one keyspace and one XOR metric.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - XOR distance is symmetric and zero only for equal identities
//! - Distances compare as big-endian unsigned integers ([`distance_cmp`])

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Returns current time as milliseconds since Unix epoch.
/// Used for publish timestamps and freshness checks on records.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Identity Hash
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Identity hash of arbitrary key material.
    pub fn hash_of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// A uniformly random identity, used for exploration targets and tests.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR of the two identities, read as a big-endian 256-bit distance.
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        std::array::from_fn(|i| self.0[i] ^ other.0[i])
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes in hex, the form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map(Self)
            .map_err(|_| hex::FromHexError::InvalidStringLength)
    }
}

/// Order two XOR distances; smaller is closer.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    // Byte arrays compare lexicographically, which is big-endian order.
    a.cmp(b)
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(id: Identity) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Routing Key (time-rotated keyspace position)
// ============================================================================

/// Position of a content key in the XOR keyspace for a given day.
///
/// SECURITY: Distances are never computed against the raw content hash.
/// Rotating the mapping daily stops an attacker from parking identities next
/// to a fixed target region ahead of time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKey(Identity);

impl RoutingKey {
    #[inline]
    pub const fn new(position: Identity) -> Self {
        Self(position)
    }

    #[inline]
    pub fn as_identity(&self) -> &Identity {
        &self.0
    }

    /// XOR distance from this routing key to a peer.
    #[inline]
    pub fn distance_to(&self, peer: &Identity) -> [u8; 32] {
        self.0.xor_distance(peer)
    }

    /// Orders two peers by closeness to this key.
    #[inline]
    pub fn closer(&self, a: &Identity, b: &Identity) -> std::cmp::Ordering {
        distance_cmp(&self.distance_to(a), &self.distance_to(b))
    }
}

impl std::fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingKey({})", &self.0.to_hex()[..16])
    }
}

// ============================================================================
// Network prefix (IP-based locality)
// ============================================================================

/// Coarse network origin of a peer address.
///
/// IPv4 is reduced to its `/24`, IPv6 to its `/48`. Two floodfills sharing a
/// prefix are likely run by one operator, so a single lookup avoids querying
/// more than one of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetPrefix([u8; 6]);

impl NetPrefix {
    pub fn from_ip(ip: IpAddr) -> Self {
        let mut out = [0u8; 6];
        match ip {
            IpAddr::V4(v4) => out[..3].copy_from_slice(&v4.octets()[..3]),
            IpAddr::V6(v6) => out.copy_from_slice(&v6.octets()[..6]),
        }
        Self(out)
    }
}

// ============================================================================
// Signing Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Identity hash of this keypair's public key.
    pub fn identity(&self) -> Identity {
        Identity::hash_of(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().short())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_bytes_and_hex() {
        let bytes = [7u8; 32];
        let id = Identity::from_bytes(bytes);
        assert_eq!(id.as_bytes(), &bytes);
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_for_self() {
        let a = Identity::random();
        let b = Identity::random();
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
    }

    #[test]
    fn distance_cmp_orders_big_endian() {
        let mut small = [0u8; 32];
        small[31] = 0xff;
        let mut large = [0u8; 32];
        large[0] = 0x01;
        assert!(distance_cmp(&small, &large).is_lt());
        assert!(distance_cmp(&large, &small).is_gt());
        assert!(distance_cmp(&large, &large).is_eq());
    }

    #[test]
    fn routing_key_orders_peers_by_closeness() {
        let key = RoutingKey::new(Identity::from_bytes([0u8; 32]));
        let mut near = [0u8; 32];
        near[31] = 1;
        let mut far = [0u8; 32];
        far[0] = 1;
        let near = Identity::from_bytes(near);
        let far = Identity::from_bytes(far);
        assert!(key.closer(&near, &far).is_lt());
    }

    #[test]
    fn keypair_identity_is_hash_of_public_key() {
        let keypair = Keypair::generate();
        assert_eq!(
            keypair.identity(),
            Identity::hash_of(&keypair.public_key_bytes())
        );
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.identity(), keypair.identity());
    }

    #[test]
    fn net_prefix_groups_ipv4_by_slash_24() {
        let a = NetPrefix::from_ip("10.1.2.3".parse().unwrap());
        let b = NetPrefix::from_ip("10.1.2.200".parse().unwrap());
        let c = NetPrefix::from_ip("10.1.3.3".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
