//! Deterministic keystream expansion
//!
//! Expands a low-entropy secret plus a fixed label into pseudorandom
//! bytes suitable as key-generation input, via the SHAKE-256 XOF.

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Shake256, Shake256Reader};

use crate::error::Error;

/// Domain-separation label for onion key derivation. Fixed so that this
/// derivation can never collide with another use of the same secret.
pub const KEYGEN_LABEL: &[u8] = b"onionize-keygen";

/// An unbounded pseudorandom byte stream derived from a secret.
pub struct Keystream {
    reader: Shake256Reader,
}

impl Keystream {
    /// Build a keystream over `secret || label`.
    pub fn new(secret: &[u8], label: &[u8]) -> Result<Self, Error> {
        if secret.is_empty() {
            return Err(Error::KeyDerivation("empty secret".to_string()));
        }
        let mut xof = Shake256::default();
        xof.update(secret);
        xof.update(label);
        Ok(Self {
            reader: xof.finalize_xof(),
        })
    }

    /// Fill `buf` with the next bytes of the stream.
    pub fn read(&mut self, buf: &mut [u8]) {
        self.reader.read(buf);
    }
}
