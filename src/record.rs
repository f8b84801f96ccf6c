//! # Database Records
//!
//! Two signed record kinds live in the network database:
//!
//! | Kind | Keyed by | Timestamp used for ordering |
//! |------|----------|-----------------------------|
//! | [`RouterInfo`] | hash of the router's signing key | publish time |
//! | [`LeaseSet`] | hash of the destination's signing key | publish time |
//!
//! A record carries its own signing key, so its identity hash can always be
//! recomputed and compared against the key it is claimed under.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, LEASE_SET_SIGNATURE_DOMAIN,
    ROUTER_INFO_SIGNATURE_DOMAIN,
};
use crate::identity::{Identity, Keypair, NetPrefix};

/// Maximum addresses a router descriptor may advertise.
/// SECURITY: Bounds per-record memory and signature payload size.
pub const MAX_ADDRESSES: usize = 16;

/// Maximum introducers per address.
pub const MAX_INTRODUCERS: usize = 4;

/// Maximum leases in a lease set.
pub const MAX_LEASES: usize = 16;

/// Maximum capability string length.
pub const MAX_CAPABILITIES_LEN: usize = 16;

/// Capability flag advertising floodfill participation.
pub const FLOODFILL_CAPABILITY: char = 'f';

/// Bandwidth class letters, slowest first.
pub const BANDWIDTH_CLASSES: &[char] = &['K', 'L', 'M', 'N', 'O', 'P', 'X'];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    RouterInfo,
    LeaseSet,
}

/// Kind hint carried by a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LookupKind {
    Any,
    RouterInfo,
    LeaseSet,
    /// Peer discovery under a random key; answered with nearby routers of
    /// any capability, never with a record.
    Exploration,
}

impl From<RecordKind> for LookupKind {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::RouterInfo => LookupKind::RouterInfo,
            RecordKind::LeaseSet => LookupKind::LeaseSet,
        }
    }
}

impl LookupKind {
    pub fn accepts(&self, kind: RecordKind) -> bool {
        match self {
            LookupKind::Any => true,
            LookupKind::RouterInfo => kind == RecordKind::RouterInfo,
            LookupKind::LeaseSet => kind == RecordKind::LeaseSet,
            LookupKind::Exploration => false,
        }
    }
}

// ============================================================================
// Router Descriptor
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterAddress {
    /// Transport style, e.g. "SSU2" or "NTCP2".
    pub style: String,
    /// Published endpoint; `None` for firewalled routers.
    pub addr: Option<SocketAddr>,
    /// Relay introducers for routers that cannot accept inbound connections.
    pub introducers: Vec<Identity>,
}

impl RouterAddress {
    pub fn direct(style: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            style: style.into(),
            addr: Some(addr),
            introducers: Vec::new(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInfo {
    pub signing_key: [u8; 32],
    pub addresses: Vec<RouterAddress>,
    /// Capability letters, e.g. "fO" for a floodfill with class O bandwidth.
    pub capabilities: String,
    pub published: u64,
    pub signature: Vec<u8>,
}

impl RouterInfo {
    pub fn new_signed(
        keypair: &Keypair,
        addresses: Vec<RouterAddress>,
        capabilities: impl Into<String>,
        published: u64,
    ) -> Self {
        let mut info = Self {
            signing_key: keypair.public_key_bytes(),
            addresses,
            capabilities: capabilities.into(),
            published,
            signature: Vec::new(),
        };
        info.signature =
            sign_with_domain(keypair, ROUTER_INFO_SIGNATURE_DOMAIN, &info.signed_payload());
        info
    }

    pub fn identity(&self) -> Identity {
        Identity::hash_of(&self.signing_key)
    }

    pub fn is_floodfill(&self) -> bool {
        self.capabilities.contains(FLOODFILL_CAPABILITY)
    }

    /// Highest bandwidth class letter advertised, if any.
    pub fn bandwidth_class(&self) -> Option<char> {
        BANDWIDTH_CLASSES
            .iter()
            .rev()
            .find(|c| self.capabilities.contains(**c))
            .copied()
    }

    /// True if at least one address is reachable without relay introducers.
    pub fn is_directly_reachable(&self) -> bool {
        self.addresses
            .iter()
            .any(|a| a.addr.is_some() && a.introducers.is_empty())
    }

    pub fn net_prefixes(&self) -> Vec<NetPrefix> {
        self.addresses
            .iter()
            .filter_map(|a| a.addr.map(|s| NetPrefix::from_ip(s.ip())))
            .collect()
    }

    pub fn validate_structure(&self) -> bool {
        self.addresses.len() <= MAX_ADDRESSES
            && self.capabilities.len() <= MAX_CAPABILITIES_LEN
            && self
                .addresses
                .iter()
                .all(|a| a.introducers.len() <= MAX_INTRODUCERS && a.style.len() <= 16)
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        verify_with_domain(
            &self.signing_key,
            ROUTER_INFO_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.signing_key);
        out.extend_from_slice(&(self.addresses.len() as u32).to_le_bytes());
        for address in &self.addresses {
            push_str(&mut out, &address.style);
            push_str(
                &mut out,
                &address.addr.map(|a| a.to_string()).unwrap_or_default(),
            );
            out.extend_from_slice(&(address.introducers.len() as u32).to_le_bytes());
            for introducer in &address.introducers {
                out.extend_from_slice(introducer.as_bytes());
            }
        }
        push_str(&mut out, &self.capabilities);
        out.extend_from_slice(&self.published.to_le_bytes());
        out
    }
}

impl std::fmt::Debug for RouterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterInfo")
            .field("identity", &self.identity())
            .field("caps", &self.capabilities)
            .field("published", &self.published)
            .field("addresses", &self.addresses.len())
            .finish()
    }
}

// ============================================================================
// Lease Set
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub gateway: Identity,
    pub tunnel_id: u32,
    /// Lease end, milliseconds since Unix epoch.
    pub end_date: u64,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSet {
    pub signing_key: [u8; 32],
    pub leases: Vec<Lease>,
    pub published: u64,
    pub signature: Vec<u8>,
}

impl LeaseSet {
    pub fn new_signed(keypair: &Keypair, leases: Vec<Lease>, published: u64) -> Self {
        let mut set = Self {
            signing_key: keypair.public_key_bytes(),
            leases,
            published,
            signature: Vec::new(),
        };
        set.signature = sign_with_domain(keypair, LEASE_SET_SIGNATURE_DOMAIN, &set.signed_payload());
        set
    }

    pub fn identity(&self) -> Identity {
        Identity::hash_of(&self.signing_key)
    }

    /// Earliest lease end; zero for an empty set, which is always expired.
    pub fn earliest_expiration(&self) -> u64 {
        self.leases.iter().map(|l| l.end_date).min().unwrap_or(0)
    }

    /// Latest lease end.
    pub fn latest_expiration(&self) -> u64 {
        self.leases.iter().map(|l| l.end_date).max().unwrap_or(0)
    }

    pub fn validate_structure(&self) -> bool {
        !self.leases.is_empty() && self.leases.len() <= MAX_LEASES
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        verify_with_domain(
            &self.signing_key,
            LEASE_SET_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48 + self.leases.len() * 44);
        out.extend_from_slice(&self.signing_key);
        out.extend_from_slice(&(self.leases.len() as u32).to_le_bytes());
        for lease in &self.leases {
            out.extend_from_slice(lease.gateway.as_bytes());
            out.extend_from_slice(&lease.tunnel_id.to_le_bytes());
            out.extend_from_slice(&lease.end_date.to_le_bytes());
        }
        out.extend_from_slice(&self.published.to_le_bytes());
        out
    }
}

impl std::fmt::Debug for LeaseSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseSet")
            .field("identity", &self.identity())
            .field("leases", &self.leases.len())
            .field("published", &self.published)
            .field("earliest_expiration", &self.earliest_expiration())
            .finish()
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

// ============================================================================
// Database Entry
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseEntry {
    RouterInfo(RouterInfo),
    LeaseSet(LeaseSet),
}

impl DatabaseEntry {
    /// Self-computed identity hash.
    pub fn identity(&self) -> Identity {
        match self {
            DatabaseEntry::RouterInfo(ri) => ri.identity(),
            DatabaseEntry::LeaseSet(ls) => ls.identity(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            DatabaseEntry::RouterInfo(_) => RecordKind::RouterInfo,
            DatabaseEntry::LeaseSet(_) => RecordKind::LeaseSet,
        }
    }

    /// Timestamp that orders versions of the same record.
    pub fn published(&self) -> u64 {
        match self {
            DatabaseEntry::RouterInfo(ri) => ri.published,
            DatabaseEntry::LeaseSet(ls) => ls.published,
        }
    }

    pub fn as_router_info(&self) -> Option<&RouterInfo> {
        match self {
            DatabaseEntry::RouterInfo(ri) => Some(ri),
            DatabaseEntry::LeaseSet(_) => None,
        }
    }

    pub fn is_floodfill_router(&self) -> bool {
        self.as_router_info().is_some_and(RouterInfo::is_floodfill)
    }

    pub fn validate_structure(&self) -> bool {
        match self {
            DatabaseEntry::RouterInfo(ri) => ri.validate_structure(),
            DatabaseEntry::LeaseSet(ls) => ls.validate_structure(),
        }
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        match self {
            DatabaseEntry::RouterInfo(ri) => ri.verify(),
            DatabaseEntry::LeaseSet(ls) => ls.verify(),
        }
    }
}

impl From<RouterInfo> for DatabaseEntry {
    fn from(ri: RouterInfo) -> Self {
        DatabaseEntry::RouterInfo(ri)
    }
}

impl From<LeaseSet> for DatabaseEntry {
    fn from(ls: LeaseSet) -> Self {
        DatabaseEntry::LeaseSet(ls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::now_ms;

    fn router(caps: &str) -> (Keypair, RouterInfo) {
        let keypair = Keypair::generate();
        let info = RouterInfo::new_signed(
            &keypair,
            vec![RouterAddress::direct("SSU2", "10.0.0.1:9000".parse().unwrap())],
            caps,
            now_ms(),
        );
        (keypair, info)
    }

    #[test]
    fn router_info_signature_covers_capabilities() {
        let (_, mut info) = router("fO");
        assert!(info.verify().is_ok());
        info.capabilities = "O".into();
        assert_eq!(info.verify(), Err(SignatureError::VerificationFailed));
    }

    #[test]
    fn router_info_identity_matches_keypair() {
        let (keypair, info) = router("O");
        assert_eq!(info.identity(), keypair.identity());
    }

    #[test]
    fn capability_parsing() {
        let (_, ff) = router("fP");
        assert!(ff.is_floodfill());
        assert_eq!(ff.bandwidth_class(), Some('P'));
        assert!(ff.is_directly_reachable());

        let (_, plain) = router("L");
        assert!(!plain.is_floodfill());
        assert_eq!(plain.bandwidth_class(), Some('L'));
    }

    #[test]
    fn introduced_addresses_are_not_direct() {
        let keypair = Keypair::generate();
        let info = RouterInfo::new_signed(
            &keypair,
            vec![RouterAddress {
                style: "SSU2".into(),
                addr: None,
                introducers: vec![Identity::random()],
            }],
            "O",
            now_ms(),
        );
        assert!(!info.is_directly_reachable());
    }

    #[test]
    fn lease_set_earliest_expiration_is_min_end_date() {
        let keypair = Keypair::generate();
        let gateway = Identity::random();
        let ls = LeaseSet::new_signed(
            &keypair,
            vec![
                Lease { gateway, tunnel_id: 1, end_date: 5_000 },
                Lease { gateway, tunnel_id: 2, end_date: 3_000 },
            ],
            1_000,
        );
        assert_eq!(ls.earliest_expiration(), 3_000);
        assert_eq!(ls.latest_expiration(), 5_000);
        assert!(ls.verify().is_ok());
        assert_eq!(DatabaseEntry::from(ls).kind(), RecordKind::LeaseSet);
    }

    #[test]
    fn lookup_kind_accepts() {
        assert!(LookupKind::Any.accepts(RecordKind::LeaseSet));
        assert!(LookupKind::RouterInfo.accepts(RecordKind::RouterInfo));
        assert!(!LookupKind::RouterInfo.accepts(RecordKind::LeaseSet));
        assert!(!LookupKind::Exploration.accepts(RecordKind::RouterInfo));
    }
}
