//! Cryptographic identity handling for v3 Onion Services
//!
//! Ed25519 key material and deterministic derivation from a passphrase.
//! All crypto operations are isolated here - no IO allowed.

pub mod keys;
pub mod keystream;

pub use keys::OnionIdentity;
pub use keystream::{Keystream, KEYGEN_LABEL};

use crate::error::Error;

/// Derive a reproducible onion identity from a passphrase.
///
/// Same passphrase, same identity - the keystream is seeded with a fixed
/// domain-separation label so this derivation cannot collide with any
/// other use of the passphrase.
pub fn derive_identity(passphrase: &str) -> Result<OnionIdentity, Error> {
    let mut keystream = Keystream::new(passphrase.as_bytes(), KEYGEN_LABEL)?;
    let mut seed = [0u8; 32];
    keystream.read(&mut seed);
    Ok(OnionIdentity::from_seed(&seed))
}
