//! Ed25519 identity for v3 Onion Services

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha512};
use sha3::Sha3_256;

/// A v3 onion service identity key pair.
#[derive(Clone)]
pub struct OnionIdentity {
    signing_key: SigningKey,
}

impl OnionIdentity {
    /// Create from raw seed bytes (32 bytes).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The expanded secret key in Tor's `ED25519-V3` blob layout:
    /// clamped private scalar (32 bytes) followed by the PRF secret
    /// (32 bytes), both taken from SHA-512 of the seed.
    pub fn expanded_secret_key(&self) -> [u8; 64] {
        let mut hasher = Sha512::new();
        hasher.update(self.signing_key.to_bytes());
        let expanded = hasher.finalize();

        let mut blob = [0u8; 64];
        blob.copy_from_slice(&expanded);
        // Ed25519 clamping on the scalar half
        blob[0] &= 248;
        blob[31] &= 63;
        blob[31] |= 64;
        blob
    }

    /// Derive the v3 onion address from the public key.
    pub fn onion_address(&self) -> String {
        // v3 address = base32(pubkey || checksum || version)
        let pubkey = self.public_key_bytes();

        // Checksum = H(".onion checksum" || pubkey || version)[:2]
        let mut hasher = Sha3_256::new();
        hasher.update(b".onion checksum");
        hasher.update(pubkey);
        hasher.update([0x03]); // version 3
        let checksum = hasher.finalize();

        let mut addr_bytes = [0u8; 35];
        addr_bytes[..32].copy_from_slice(&pubkey);
        addr_bytes[32..34].copy_from_slice(&checksum[..2]);
        addr_bytes[34] = 0x03;

        format!(
            "{}.onion",
            BASE32_NOPAD.encode(&addr_bytes).to_lowercase()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_has_v3_shape() {
        let identity = OnionIdentity::from_seed(&[0u8; 32]);
        let addr = identity.onion_address();
        assert!(addr.ends_with(".onion"));
        assert_eq!(addr.len(), 56 + 6); // 56 base32 chars + ".onion"
        assert!(addr
            .trim_end_matches(".onion")
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
    }

    #[test]
    fn same_seed_same_address() {
        let a = OnionIdentity::from_seed(&[42u8; 32]);
        let b = OnionIdentity::from_seed(&[42u8; 32]);
        assert_eq!(a.onion_address(), b.onion_address());
    }

    #[test]
    fn expanded_key_is_clamped() {
        let identity = OnionIdentity::from_seed(&[7u8; 32]);
        let blob = identity.expanded_secret_key();
        assert_eq!(blob[0] & 7, 0);
        assert_eq!(blob[31] & 0b1100_0000, 0b0100_0000);
    }
}
