// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Size of recipient identifiers.
pub const RECIPIENT_ID_LEN: usize = 32;

/// 32-byte identifier a message can be delivered to.
///
/// For single-use exchanges the identifier is content-addressed: it is derived from the sender's
/// ephemeral public key and the plaintext request payload (which embeds a random nonce). Every
/// exchange therefore answers to a fresh pseudonymous identity that cannot be linked back to the
/// sender. Long-lived listeners use a `RecipientId` handed to them by the embedding client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientId([u8; RECIPIENT_ID_LEN]);

impl RecipientId {
    /// Derive a content-addressed identifier from a public key and the payload it accompanies.
    pub fn derive(public_key: &[u8], payload: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(public_key);
        hasher.update(payload);
        Self(*hasher.finalize().as_bytes())
    }

    /// Create a `RecipientId` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; RECIPIENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; RECIPIENT_ID_LEN] {
        &self.0
    }

    /// Convert the identifier to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for RecipientId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; RECIPIENT_ID_LEN]> for RecipientId {
    fn from(value: [u8; RECIPIENT_ID_LEN]) -> Self {
        Self(value)
    }
}

impl From<RecipientId> for [u8; RECIPIENT_ID_LEN] {
    fn from(value: RecipientId) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for RecipientId {
    type Error = IdError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let value_len = value.len();

        let checked_value: [u8; RECIPIENT_ID_LEN] = value
            .try_into()
            .map_err(|_| IdError::InvalidLength(value_len, RECIPIENT_ID_LEN))?;

        Ok(Self(checked_value))
    }
}

impl FromStr for RecipientId {
    type Err = IdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(hex::decode(value)?.as_slice())
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientId({})", self.to_hex())
    }
}

/// Errors from handling recipient identifiers.
#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    /// Identifier bytes have an invalid length.
    #[error("invalid identifier length {0}, expected {1}")]
    InvalidLength(usize, usize),

    /// Identifier string contains invalid hex characters.
    #[error("invalid hex encoding in identifier string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{IdError, RecipientId};

    #[test]
    fn derivation_is_deterministic() {
        let id_1 = RecipientId::derive(&[1; 32], b"payload");
        let id_2 = RecipientId::derive(&[1; 32], b"payload");
        assert_eq!(id_1, id_2);
    }

    #[test]
    fn derivation_is_content_addressed() {
        let id = RecipientId::derive(&[1; 32], b"payload");

        // Changing either input yields a different identity.
        assert_ne!(id, RecipientId::derive(&[2; 32], b"payload"));
        assert_ne!(id, RecipientId::derive(&[1; 32], b"payloae"));
    }

    #[test]
    fn hex_roundtrip() {
        let id = RecipientId::derive(&[7; 32], b"test");
        let id_again = RecipientId::from_str(&id.to_hex()).unwrap();
        assert_eq!(id, id_again);
    }

    #[test]
    fn invalid_bytes() {
        assert_eq!(
            RecipientId::try_from([0u8; 31].as_slice()),
            Err(IdError::InvalidLength(31, 32))
        );
        assert!(RecipientId::from_str("not hex").is_err());
    }
}
