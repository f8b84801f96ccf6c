//! # Floodnet - Network Database for an Anonymity-Network Router
//!
//! Floodnet keeps the distributed directory of router descriptors and lease
//! sets that routers use to find each other:
//!
//! - **Routing table**: XOR-metric buckets over every known router
//! - **Data store**: validated, signature-checked records with freshness rules
//! - **Lookup engine**: an iterative walk over floodfills, plus flood-only and
//!   classic fallbacks, with single-flight deduplication per key
//! - **Store pipeline**: redundant stores, verification at a second floodfill,
//!   and the flood fan-out across the daily key rotation
//! - **Floodfill election**: decides whether this router serves the database
//! - **Exploration**: periodic walks toward random keys in sparse buckets to
//!   discover routers we do not know yet
//!
//! ## Architecture
//!
//! [`NetDb`] is a cheap-to-clone handle. Lookups go through a private actor
//! that owns the in-flight table; everything else works on a shared
//! [`NetDbContext`] whose tables each carry their own lock. Waiting for a
//! reply never blocks: searches register a selector with the reply registry
//! and race the resulting channel against their own deadlines.
//!
//! Transport, peer reputation, bans, key rotation, router health and
//! persistence are injected through the traits in [`protocols`].
//!
//! ## Security Model
//!
//! - Every record is self-certifying: its key is the hash of its signing key
//!   and its signature must verify before it is stored
//! - Records from the future, overlong lease sets and stale descriptors are
//!   refused
//! - Inbound lookups and floods are throttled per requester and per key
//! - Every table that grows with peer input is bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `netdb` | Public facade, single-flight lookups, inbound handling, diagnostics |
//! | `context` | Shared state of one database instance |
//! | `routing_table` | Fixed-range XOR buckets |
//! | `peer_selector` | Nearest-peer and tiered floodfill selection |
//! | `data_store` | Validated record map |
//! | `search` | Lookup contract and per-peer bookkeeping |
//! | `iterative_search` | Production floodfill walk |
//! | `flood_search` | Direct fan-out to known floodfills |
//! | `classic_search` | Breadth-limited nearest-peer walk and exploration |
//! | `store` | Store, verify and flood |
//! | `floodfill_monitor` | Floodfill election loop |
//! | `throttle` | Lookup and flood throttles, negative lookup cache |
//! | `replies` | Reply registry |
//! | `routing_key` | Daily routing key rotation |
//! | `profiles` | In-memory reliability, banlist and router status |
//! | `protocols` | Collaborator traits |
//! | `messages` | Logical message types and the decode boundary |
//! | `record` | Router descriptors, lease sets |
//! | `identity` | Identity hashes, routing keys, keypairs |
//! | `crypto` | Domain-separated signatures |
//! | `config` | Configuration and defaults |
//! | `sim` | In-memory loopback network |

pub mod classic_search;
pub mod config;
pub mod context;
pub mod crypto;
pub mod data_store;
pub mod flood_search;
pub mod floodfill_monitor;
pub mod identity;
pub mod iterative_search;
pub mod messages;
pub mod netdb;
pub mod peer_selector;
pub mod profiles;
pub mod protocols;
pub mod record;
pub mod replies;
pub mod routing_key;
pub mod routing_table;
pub mod search;
pub mod sim;
pub mod store;
pub mod throttle;

pub use config::{FloodfillMode, NetDbConfig};
pub use context::{Collaborators, NetDbContext};
pub use data_store::{DataStore, PutOutcome, RejectReason};
pub use identity::{Identity, Keypair, RoutingKey};
pub use messages::NetDbMessage;
pub use netdb::{NetDb, NetDbSnapshot};
pub use protocols::{Banlist, KeyRotation, PeerReliability, Persistence, Route, RouterStatus, Transport};
pub use record::{DatabaseEntry, LeaseSet, LookupKind, RecordKind, RouterInfo};
pub use routing_table::RoutingTable;
pub use search::{LookupError, LookupStrategy};
pub use sim::Simulation;
pub use store::{StoreError, StoreOptions, StoreReceipt, VerifyOutcome};
