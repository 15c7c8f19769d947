// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::crypto::{PUBLIC_KEY_LEN, PublicKey, Rng, RngError};
use crate::message::{
    MESSAGE_VERSION, MessageError, NONCE_LEN, NUM_PARTS_LEN, SIZE_LEN, VERSION_LEN, read_u16,
    write_u16,
};

const PUBLIC_KEY_OFFSET: usize = VERSION_LEN;
const PAYLOAD_OFFSET: usize = VERSION_LEN + PUBLIC_KEY_LEN;

/// Outer wire format of a single-use request.
///
/// The ephemeral public key travels in the clear so the receiver can derive the shared secret;
/// everything after it is the encrypted [`RequestPayload`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    data: Vec<u8>,
}

impl Request {
    /// Build an empty request filling a wire message of `external_size` bytes.
    pub fn new(external_size: usize) -> Result<Self, MessageError> {
        if external_size < PAYLOAD_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: external_size,
                kind: "request",
                min: PAYLOAD_OFFSET,
            });
        }

        let mut data = vec![0; external_size];
        data[0] = MESSAGE_VERSION;

        Ok(Self { data })
    }

    /// Parse a request from inbound bytes.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < PAYLOAD_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: bytes.len(),
                kind: "request",
                min: PAYLOAD_OFFSET,
            });
        }

        Ok(Self {
            data: bytes.to_vec(),
        })
    }

    /// Version of the message.
    pub fn version(&self) -> u8 {
        self.data[0]
    }

    /// The embedded ephemeral public key.
    pub fn public_key(&self) -> PublicKey {
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(&self.data[PUBLIC_KEY_OFFSET..PAYLOAD_OFFSET]);
        PublicKey::from_bytes(bytes)
    }

    /// Store the ephemeral public key.
    pub fn set_public_key(&mut self, public_key: &PublicKey) {
        self.data[PUBLIC_KEY_OFFSET..PAYLOAD_OFFSET].copy_from_slice(public_key.as_bytes());
    }

    /// The encrypted payload slot.
    pub fn payload(&self) -> &[u8] {
        &self.data[PAYLOAD_OFFSET..]
    }

    /// Size of the encrypted payload slot.
    pub fn payload_size(&self) -> usize {
        self.data.len() - PAYLOAD_OFFSET
    }

    /// Store the encrypted payload. The payload must fill its slot exactly.
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), MessageError> {
        if payload.len() != self.payload_size() {
            return Err(MessageError::PayloadSizeMismatch {
                size: payload.len(),
                expected: self.payload_size(),
            });
        }

        self.data[PAYLOAD_OFFSET..].copy_from_slice(payload);
        Ok(())
    }

    /// Serialized bytes of the request.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the request into its serialized bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

const NUM_REQUEST_PARTS_OFFSET: usize = NONCE_LEN;
const MAX_RESPONSE_PARTS_OFFSET: usize = NONCE_LEN + NUM_PARTS_LEN;
const REQUEST_SIZE_OFFSET: usize = NONCE_LEN + 2 * NUM_PARTS_LEN;
const REQUEST_CONTENTS_OFFSET: usize = NONCE_LEN + 2 * NUM_PARTS_LEN + SIZE_LEN;

/// Plaintext layout of the encrypted payload inside a [`Request`].
///
/// The nonce randomizes the content-addressed reception identity; `num_request_parts` is always
/// 1 on the send path (requests are single-part by design) but is honored on the receive path;
/// `max_response_parts` tells the receiver how many reply parts the sender is prepared to
/// collect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestPayload {
    data: Vec<u8>,
}

impl RequestPayload {
    /// Build a payload of `payload_size` bytes carrying `contents`.
    pub fn new(
        payload_size: usize,
        contents: &[u8],
        max_response_parts: u8,
    ) -> Result<Self, MessageError> {
        if payload_size < REQUEST_CONTENTS_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: payload_size,
                kind: "request payload",
                min: REQUEST_CONTENTS_OFFSET,
            });
        }

        let mut payload = Self {
            data: vec![0; payload_size],
        };
        payload.data[NUM_REQUEST_PARTS_OFFSET] = 1;
        payload.data[MAX_RESPONSE_PARTS_OFFSET] = max_response_parts;
        payload.set_contents(contents)?;

        Ok(payload)
    }

    /// Parse a payload from decrypted bytes.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < REQUEST_CONTENTS_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: bytes.len(),
                kind: "request payload",
                min: REQUEST_CONTENTS_OFFSET,
            });
        }

        let payload = Self {
            data: bytes.to_vec(),
        };

        let declared = payload.contents_size();
        let capacity = payload.max_contents_size();
        if declared > capacity {
            return Err(MessageError::ContentsSizeOutOfRange {
                size: declared,
                capacity,
            });
        }

        Ok(payload)
    }

    /// The random nonce distinguishing this exchange.
    pub fn nonce(&self) -> u64 {
        let mut bytes = [0u8; NONCE_LEN];
        bytes.copy_from_slice(&self.data[..NONCE_LEN]);
        u64::from_be_bytes(bytes)
    }

    /// Draw a fresh nonce from the generator.
    pub fn set_nonce(&mut self, rng: &Rng) -> Result<(), RngError> {
        let nonce: [u8; NONCE_LEN] = rng.random_array()?;
        self.data[..NONCE_LEN].copy_from_slice(&nonce);
        Ok(())
    }

    /// Number of parts the request was split into.
    pub fn num_request_parts(&self) -> u8 {
        self.data[NUM_REQUEST_PARTS_OFFSET]
    }

    /// Declare the number of request parts.
    pub fn set_num_request_parts(&mut self, num: u8) {
        self.data[NUM_REQUEST_PARTS_OFFSET] = num;
    }

    /// Number of reply parts the sender is prepared to collect.
    pub fn max_response_parts(&self) -> u8 {
        self.data[MAX_RESPONSE_PARTS_OFFSET]
    }

    /// Declare the maximum number of reply parts.
    pub fn set_max_response_parts(&mut self, num: u8) {
        self.data[MAX_RESPONSE_PARTS_OFFSET] = num;
    }

    /// The stored contents.
    pub fn contents(&self) -> &[u8] {
        &self.data[REQUEST_CONTENTS_OFFSET..REQUEST_CONTENTS_OFFSET + self.contents_size()]
    }

    /// Size of the stored contents.
    pub fn contents_size(&self) -> usize {
        read_u16(&self.data[REQUEST_SIZE_OFFSET..REQUEST_SIZE_OFFSET + SIZE_LEN]) as usize
    }

    /// Capacity of the contents slot.
    pub fn max_contents_size(&self) -> usize {
        self.data.len() - REQUEST_CONTENTS_OFFSET
    }

    /// Store `contents`, rejecting anything beyond the slot capacity.
    pub fn set_contents(&mut self, contents: &[u8]) -> Result<(), MessageError> {
        if contents.len() > self.max_contents_size() {
            return Err(MessageError::ContentsTooLarge {
                size: contents.len(),
                capacity: self.max_contents_size(),
            });
        }

        write_u16(
            &mut self.data[REQUEST_SIZE_OFFSET..REQUEST_SIZE_OFFSET + SIZE_LEN],
            contents.len() as u16,
        );
        self.data[REQUEST_CONTENTS_OFFSET..REQUEST_CONTENTS_OFFSET + contents.len()]
            .copy_from_slice(contents);

        Ok(())
    }

    /// Serialized bytes of the payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::crypto::{Rng, SecretKey};
    use crate::message::MessageError;

    use super::{Request, RequestPayload};

    #[test]
    fn request_roundtrip() {
        let rng = Rng::from_seed([1; 32]);
        let public_key = SecretKey::generate(&rng).unwrap().public_key();

        let mut request = Request::new(256).unwrap();
        request.set_public_key(&public_key);
        request.set_payload(&vec![7; request.payload_size()]).unwrap();

        let request_again = Request::unmarshal(request.as_bytes()).unwrap();
        assert_eq!(request_again.version(), 0);
        assert_eq!(request_again.public_key(), public_key);
        assert_eq!(request_again.payload(), vec![7; 256 - 33]);
    }

    #[test]
    fn request_too_small() {
        assert_matches!(
            Request::new(16),
            Err(MessageError::BufferTooSmall { size: 16, .. })
        );
        assert_matches!(
            Request::unmarshal(&[0; 16]),
            Err(MessageError::BufferTooSmall { size: 16, .. })
        );
    }

    #[test]
    fn request_payload_must_fill_its_slot() {
        let mut request = Request::new(256).unwrap();
        assert_matches!(
            request.set_payload(&[1, 2, 3]),
            Err(MessageError::PayloadSizeMismatch { size: 3, .. })
        );
    }

    #[test]
    fn payload_roundtrip() {
        let rng = Rng::from_seed([2; 32]);

        let mut payload = RequestPayload::new(128, b"hello", 6).unwrap();
        payload.set_nonce(&rng).unwrap();

        let payload_again = RequestPayload::unmarshal(payload.as_bytes()).unwrap();
        assert_eq!(payload_again.contents(), b"hello");
        assert_eq!(payload_again.num_request_parts(), 1);
        assert_eq!(payload_again.max_response_parts(), 6);
        assert_eq!(payload_again.nonce(), payload.nonce());
        assert_eq!(payload_again.max_contents_size(), 128 - 12);
    }

    #[test]
    fn payload_contents_bounded_by_capacity() {
        assert_matches!(
            RequestPayload::new(16, &[0; 16], 1),
            Err(MessageError::ContentsTooLarge { size: 16, capacity: 4 })
        );
    }

    #[test]
    fn payload_rejects_forged_contents_size() {
        let payload = RequestPayload::new(32, b"abc", 1).unwrap();
        let mut bytes = payload.as_bytes().to_vec();

        // Forge a declared contents size pointing past the end of the buffer.
        bytes[10] = 0xff;
        bytes[11] = 0xff;

        assert_matches!(
            RequestPayload::unmarshal(&bytes),
            Err(MessageError::ContentsSizeOutOfRange { .. })
        );
    }
}
