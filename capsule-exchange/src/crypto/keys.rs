// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use thiserror::Error;
use x25519_dalek::StaticSecret;

use crate::crypto::secret::Secret;
use crate::crypto::rng::{Rng, RngError};

/// Size of x25519 public keys on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Shared secret derived identically by both sides of an exchange.
///
/// Source of all per-part keys and fingerprints; never transmitted, never persisted, zeroed on
/// drop.
pub type SharedSecret = Secret<32>;

/// Private half of an x25519 keypair.
///
/// The transmitting side generates one per exchange and drops it as soon as the shared secret is
/// derived; the listening side holds a static one for as long as it is reachable.
#[derive(Clone)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a fresh secret key.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(StaticSecret::from(rng.random_array::<32>()?)))
    }

    /// Create a `SecretKey` from its raw bytes representation.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// The public counterpart of this key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Derive the Diffie-Hellman shared secret with the given public key.
    pub fn shared_secret(&self, their_public_key: &PublicKey) -> SharedSecret {
        let shared = self.0.diffie_hellman(&their_public_key.0);
        SharedSecret::from_bytes(*shared.as_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal the key when printing debug info.
        f.debug_struct("SecretKey").field("value", &"***").finish()
    }
}

/// Public half of an x25519 keypair.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    /// Create a `PublicKey` from its raw bytes representation.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    /// Convert the public key to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let value_len = value.len();

        let checked_value: [u8; PUBLIC_KEY_LEN] = value
            .try_into()
            .map_err(|_| KeyError::InvalidLength(value_len, PUBLIC_KEY_LEN))?;

        Ok(Self::from_bytes(checked_value))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Errors from handling key material.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// Key bytes have an invalid length.
    #[error("invalid key length {0}, expected {1}")]
    InvalidLength(usize, usize),
}

#[cfg(test)]
mod tests {
    use crate::crypto::rng::Rng;

    use super::SecretKey;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let rng = Rng::from_seed([1; 32]);

        let alice = SecretKey::generate(&rng).unwrap();
        let bob = SecretKey::generate(&rng).unwrap();

        let alice_shared = alice.shared_secret(&bob.public_key());
        let bob_shared = bob.shared_secret(&alice.public_key());

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn fresh_keypairs_are_independent() {
        let rng = Rng::from_seed([2; 32]);

        let key_1 = SecretKey::generate(&rng).unwrap();
        let key_2 = SecretKey::generate(&rng).unwrap();

        assert_ne!(key_1.public_key(), key_2.public_key());
    }
}
