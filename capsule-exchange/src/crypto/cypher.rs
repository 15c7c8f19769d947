// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::crypto::keys::SharedSecret;
use crate::crypto::secret::Secret;

/// Size of routing fingerprints.
pub const FINGERPRINT_LEN: usize = 32;

/// Size of message authentication tags.
pub const MAC_LEN: usize = 16;

/// Size of derived symmetric keys.
pub const KEY_LEN: usize = 32;

/// Nonce length of XChaCha20-Poly1305; taken from the leading fingerprint bytes.
const NONCE_LEN: usize = 24;

/// Role of a derived key within an exchange.
///
/// Keys and fingerprints are derived under role-distinct labels, so a fingerprint for a response
/// part can never collide with one for the request or a request part of the same exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The request message itself, always at index 0.
    Transmit,

    /// Supplementary request parts beyond the first message.
    RequestPart,

    /// Response parts sent back to the requester.
    Response,
}

impl Role {
    fn key_label(self) -> &'static [u8] {
        match self {
            Role::Transmit => b"capsule-exchange transmit key",
            Role::RequestPart => b"capsule-exchange request part key",
            Role::Response => b"capsule-exchange response key",
        }
    }

    fn fingerprint_label(self) -> &'static [u8] {
        match self {
            Role::Transmit => b"capsule-exchange transmit fingerprint",
            Role::RequestPart => b"capsule-exchange request part fingerprint",
            Role::Response => b"capsule-exchange response fingerprint",
        }
    }
}

/// Fixed-size opaque tag used to route inbound ciphertext to the right in-flight exchange
/// without revealing any identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Create a `Fingerprint` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Bytes of the fingerprint.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Convert the fingerprint to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Authentication tag accompanying one encrypted message on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Mac([u8; MAC_LEN]);

impl Mac {
    /// Create a `Mac` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }

    /// Bytes of the tag.
    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", hex::encode(self.0))
    }
}

/// Deterministic encryption state for one message of an exchange.
///
/// A cypher is a pure value derived from `(shared secret, part index, role)`. Both sides derive
/// the same fingerprint and key independently, which is what lets a sender pre-register the
/// fingerprints of response parts it has not received yet. Encryption uses no randomness: the
/// nonce is the leading bytes of the fingerprint.
pub struct Cypher {
    fingerprint: Fingerprint,
    key: Secret<KEY_LEN>,
}

impl Cypher {
    /// Derive the cypher for part `index` under the given role.
    pub fn derive(shared_secret: &SharedSecret, index: u64, role: Role) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());

        Self {
            fingerprint: Fingerprint(expand(&hkdf, role.fingerprint_label(), index)),
            key: Secret::from_bytes(expand(&hkdf, role.key_label(), index)),
        }
    }

    /// The routing fingerprint of this part.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Encrypt `plaintext`, returning the fingerprint to route it under, the ciphertext (same
    /// length as the plaintext) and the detached authentication tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> (Fingerprint, Vec<u8>, Mac) {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));
        let nonce = XNonce::from_slice(&self.fingerprint.0[..NONCE_LEN]);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(nonce, &[], &mut buffer)
            .expect("plaintext length is within XChaCha20-Poly1305 bounds");

        (self.fingerprint, buffer, Mac(tag.into()))
    }

    /// Verify `mac` over `ciphertext` and decrypt. Verification failure is a hard failure: the
    /// message is discarded and never retried, and no plaintext is released.
    pub fn decrypt(&self, ciphertext: &[u8], mac: &Mac) -> Result<Vec<u8>, CypherError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));
        let nonce = XNonce::from_slice(&self.fingerprint.0[..NONCE_LEN]);

        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(nonce, &[], &mut buffer, Tag::from_slice(&mac.0))
            .map_err(|_| CypherError::MacMismatch)?;

        Ok(buffer)
    }
}

impl fmt::Debug for Cypher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cypher")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Derive the cyphers for part indices `0..count` under the given role.
pub fn make_cyphers(shared_secret: &SharedSecret, count: u8, role: Role) -> Vec<Cypher> {
    (0..u64::from(count))
        .map(|index| Cypher::derive(shared_secret, index, role))
        .collect()
}

fn expand(hkdf: &Hkdf<Sha256>, label: &'static [u8], index: u64) -> [u8; 32] {
    let mut info = Vec::with_capacity(label.len() + 8);
    info.extend_from_slice(label);
    info.extend_from_slice(&index.to_be_bytes());

    let mut out = [0u8; 32];
    hkdf.expand(&info, &mut out)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

/// Errors from decrypting an inbound message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CypherError {
    /// The message failed authentication.
    #[error("message failed authentication")]
    MacMismatch,
}
