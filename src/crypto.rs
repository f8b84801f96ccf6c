//! # Record Signatures
//!
//! Domain-separated Ed25519 signing for database records.
//!
//! - **Signatures**: every record is signed over its bincode payload with a
//!   per-kind domain prefix
//! - **Content hashing**: BLAKE3, see [`crate::identity::Identity::hash_of`]
//!
//! ## Security Properties
//!
//! - Only Ed25519 signatures are accepted, verified with `verify_strict`
//! - Domain separation prevents a router descriptor signature being replayed
//!   as a lease set signature and vice versa

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::Keypair;

/// Why a record signature was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    /// Not 64 bytes.
    InvalidLength,
    VerificationFailed,
    /// The signing key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self {
            SignatureError::Missing => "record is unsigned",
            SignatureError::InvalidLength => "record signature is not 64 bytes",
            SignatureError::VerificationFailed => "record signature does not verify",
            SignatureError::InvalidPublicKey => "record signing key is not a valid point",
        };
        f.write_str(what)
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domains
// ============================================================================
//
// SECURITY: Each signed record kind uses a unique prefix so a signature can
// never be reused in a different context.

pub const ROUTER_INFO_SIGNATURE_DOMAIN: &[u8] = b"floodnet-routerinfo-v1:";

pub const LEASE_SET_SIGNATURE_DOMAIN: &[u8] = b"floodnet-leaseset-v1:";

fn domain_message(domain: &[u8], data: &[u8]) -> Vec<u8> {
    [domain, data].concat()
}

/// Sign `data` under `domain`. Returns the 64-byte Ed25519 signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&domain_message(domain, data)).to_bytes().to_vec()
}

/// Check a signature made by [`sign_with_domain`] against a raw signing key.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let bytes: [u8; 64] = match signature.len() {
        0 => return Err(SignatureError::Missing),
        64 => signature.try_into().map_err(|_| SignatureError::InvalidLength)?,
        _ => return Err(SignatureError::InvalidLength),
    };
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    key.verify_strict(&domain_message(domain, data), &Signature::from_bytes(&bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_under_its_own_domain_only() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, ROUTER_INFO_SIGNATURE_DOMAIN, b"payload");

        assert!(verify_with_domain(
            &keypair.public_key_bytes(),
            ROUTER_INFO_SIGNATURE_DOMAIN,
            b"payload",
            &sig
        )
        .is_ok());

        assert_eq!(
            verify_with_domain(
                &keypair.public_key_bytes(),
                LEASE_SET_SIGNATURE_DOMAIN,
                b"payload",
                &sig
            ),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_classified() {
        let keypair = Keypair::generate();
        let pk = keypair.public_key_bytes();
        assert_eq!(
            verify_with_domain(&pk, ROUTER_INFO_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, ROUTER_INFO_SIGNATURE_DOMAIN, b"x", &[0u8; 10]),
            Err(SignatureError::InvalidLength)
        );
    }
}
