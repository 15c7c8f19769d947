// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-layout wire codecs of the exchange protocol.
//!
//! Every codec owns one buffer sized from the transport's maximum message length and maps named
//! fields onto fixed big-endian offsets, so the formats adapt to any transport without
//! recompilation. Building a codec over a buffer too small for its fixed header, or storing
//! contents beyond the remaining capacity, is a construction error: programmer misuse, fatal to
//! the operation, never retried. Failing to unmarshal inbound bytes is an ordinary runtime
//! condition, since an open network guarantees noise.
//!
//! ```text
//! Request       version(1) ‖ public key(32) ‖ encrypted payload
//! RequestPayload    nonce(8) ‖ num request parts(1) ‖ max response parts(1) ‖ size(2) ‖ contents
//! RequestPart   part number(1) ‖ size(2) ‖ contents
//! ResponsePart  version(1) ‖ part number(1) ‖ max parts(1) ‖ size(2) ‖ contents
//! ```
mod request;
mod request_part;
mod response_part;

use thiserror::Error;

pub use request::{Request, RequestPayload};
pub use request_part::RequestPart;
pub use response_part::ResponsePart;

use crate::crypto::PUBLIC_KEY_LEN;

/// Version of all wire formats produced by this crate.
pub const MESSAGE_VERSION: u8 = 0;

pub(crate) const VERSION_LEN: usize = 1;
pub(crate) const NONCE_LEN: usize = 8;
pub(crate) const PART_NUMBER_LEN: usize = 1;
pub(crate) const NUM_PARTS_LEN: usize = 1;
pub(crate) const SIZE_LEN: usize = 2;

/// Size of the encrypted payload slot inside a [`Request`] of `max_message_length` bytes.
pub fn request_payload_size(max_message_length: usize) -> usize {
    max_message_length.saturating_sub(VERSION_LEN + PUBLIC_KEY_LEN)
}

/// Maximum contents of a single-part request sent over messages of `max_message_length` bytes.
pub fn request_contents_size(max_message_length: usize) -> usize {
    request_payload_size(max_message_length)
        .saturating_sub(NONCE_LEN + NUM_PARTS_LEN + NUM_PARTS_LEN + SIZE_LEN)
}

/// Maximum contents of one supplementary request part.
pub fn request_part_contents_size(max_message_length: usize) -> usize {
    max_message_length.saturating_sub(PART_NUMBER_LEN + SIZE_LEN)
}

/// Maximum contents of one response part.
pub fn response_part_contents_size(max_message_length: usize) -> usize {
    max_message_length.saturating_sub(VERSION_LEN + PART_NUMBER_LEN + NUM_PARTS_LEN + SIZE_LEN)
}

/// Errors from building or parsing wire messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The buffer is too small to hold the fixed fields of the format.
    #[error("buffer of {size} bytes too small to fit a {kind} of at least {min} bytes")]
    BufferTooSmall {
        size: usize,
        kind: &'static str,
        min: usize,
    },

    /// Contents exceed the remaining capacity of the buffer.
    #[error("contents of {size} bytes exceed the available capacity of {capacity} bytes")]
    ContentsTooLarge { size: usize, capacity: usize },

    /// A payload did not match the exact size of its slot.
    #[error("payload of {size} bytes does not match the expected size of {expected} bytes")]
    PayloadSizeMismatch { size: usize, expected: usize },

    /// The declared contents size points past the end of the buffer.
    #[error("declared contents size {size} exceeds the available capacity of {capacity} bytes")]
    ContentsSizeOutOfRange { size: usize, capacity: usize },
}

pub(crate) fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

pub(crate) fn write_u16(bytes: &mut [u8], value: u16) {
    bytes.copy_from_slice(&value.to_be_bytes());
}
