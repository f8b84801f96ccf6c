//! # Network Database Messages
//!
//! Logical message types exchanged between network database peers. Byte
//! framing is owned by the transport; this module provides the bounded
//! bincode codec used at the decode boundary.
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `Lookup` | requester → floodfill | ask for a record by key |
//! | `Store` | any → floodfill, floodfill → requester | carry a record |
//! | `SearchReply` | floodfill → requester | miss, naming closer floodfills |
//! | `DeliveryAck` | recipient → storer | confirm a store carrying a token |
//!
//! ## Security Limits
//!
//! - `MAX_MESSAGE_SIZE`: maximum deserialization buffer (prevents OOM)
//! - `MAX_DONT_INCLUDE`: exclusion list bound on inbound lookups
//! - `MAX_SEARCH_REPLY_PEERS`: peers named by one search reply

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::identity::Identity;
use crate::record::{DatabaseEntry, LookupKind};

/// Maximum size of an encoded message.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Maximum peers a lookup may ask us not to mention.
pub const MAX_DONT_INCLUDE: usize = 512;

/// Maximum peers named in a single search reply.
pub const MAX_SEARCH_REPLY_PEERS: usize = 16;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_message(message: &NetDbMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

/// Decode an inbound message, dropping anything malformed or out of bounds.
///
/// A corrupt message is logged and discarded here; it never reaches a search
/// or store in progress.
pub fn decode_message(from: &Identity, bytes: &[u8]) -> Option<NetDbMessage> {
    let message: NetDbMessage = match deserialize_bounded(bytes) {
        Ok(m) => m,
        Err(e) => {
            debug!(from = %from.short(), len = bytes.len(), error = %e, "dropping malformed netdb message");
            return None;
        }
    };
    if !message.within_bounds() {
        debug!(from = %from.short(), "dropping oversized netdb message");
        return None;
    }
    Some(message)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseLookup {
    pub key: Identity,
    pub kind: LookupKind,
    /// Router the reply should go back to.
    pub from: Identity,
    /// Reply tunnel, when the requester hides behind one.
    pub reply_tunnel: Option<u32>,
    /// Peers not to name in a search reply.
    pub dont_include: Vec<Identity>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStore {
    pub key: Identity,
    pub entry: DatabaseEntry,
    /// When set, the recipient answers with a [`DeliveryAck`] carrying it.
    pub reply_token: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReply {
    pub key: Identity,
    pub from: Identity,
    pub peers: Vec<Identity>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub token: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetDbMessage {
    Lookup(DatabaseLookup),
    Store(DatabaseStore),
    SearchReply(SearchReply),
    DeliveryAck(DeliveryAck),
}

impl NetDbMessage {
    /// Database key the message concerns, if any.
    pub fn key(&self) -> Option<&Identity> {
        match self {
            NetDbMessage::Lookup(m) => Some(&m.key),
            NetDbMessage::Store(m) => Some(&m.key),
            NetDbMessage::SearchReply(m) => Some(&m.key),
            NetDbMessage::DeliveryAck(_) => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NetDbMessage::Lookup(_) => "lookup",
            NetDbMessage::Store(_) => "store",
            NetDbMessage::SearchReply(_) => "search_reply",
            NetDbMessage::DeliveryAck(_) => "delivery_ack",
        }
    }

    fn within_bounds(&self) -> bool {
        match self {
            NetDbMessage::Lookup(m) => m.dont_include.len() <= MAX_DONT_INCLUDE,
            NetDbMessage::Store(m) => m.entry.validate_structure(),
            NetDbMessage::SearchReply(m) => m.peers.len() <= MAX_SEARCH_REPLY_PEERS,
            NetDbMessage::DeliveryAck(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{now_ms, Keypair};
    use crate::record::{RouterAddress, RouterInfo};

    fn store_message() -> NetDbMessage {
        let keypair = Keypair::generate();
        let info = RouterInfo::new_signed(
            &keypair,
            vec![RouterAddress::direct("SSU2", "10.0.0.1:9000".parse().unwrap())],
            "fO",
            now_ms(),
        );
        NetDbMessage::Store(DatabaseStore {
            key: info.identity(),
            entry: info.into(),
            reply_token: Some(7),
        })
    }

    #[test]
    fn decode_accepts_well_formed_store() {
        let from = Identity::random();
        let message = store_message();
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&from, &bytes), Some(message));
    }

    #[test]
    fn decode_drops_garbage() {
        let from = Identity::random();
        assert!(decode_message(&from, &[0xff, 0x00, 0x13]).is_none());
        assert!(decode_message(&from, &[]).is_none());
    }

    #[test]
    fn decode_drops_oversized_search_reply() {
        let from = Identity::random();
        let reply = NetDbMessage::SearchReply(SearchReply {
            key: Identity::random(),
            from,
            peers: (0..MAX_SEARCH_REPLY_PEERS + 1).map(|_| Identity::random()).collect(),
        });
        let bytes = encode_message(&reply).unwrap();
        assert!(decode_message(&from, &bytes).is_none());
    }

    #[test]
    fn decode_drops_truncated_message() {
        let from = Identity::random();
        let bytes = encode_message(&store_message()).unwrap();
        assert!(decode_message(&from, &bytes[..bytes.len() / 2]).is_none());
    }

    #[test]
    fn message_key_accessor() {
        let key = Identity::random();
        let lookup = NetDbMessage::Lookup(DatabaseLookup {
            key,
            kind: LookupKind::Any,
            from: Identity::random(),
            reply_tunnel: None,
            dont_include: Vec::new(),
        });
        assert_eq!(lookup.key(), Some(&key));
        assert_eq!(NetDbMessage::DeliveryAck(DeliveryAck { token: 1 }).key(), None);
    }
}
