// SPDX-License-Identifier: MIT OR Apache-2.0

//! `capsule-exchange` implements single-use communication: a protocol for sending one anonymous,
//! ephemerally-keyed encrypted request to a contact and receiving one or more encrypted response
//! parts, without establishing a long-lived session.
//!
//! Because the request inherently carries the key negotiation with it, no interactive handshake
//! is needed. The sender generates a fresh Diffie-Hellman keypair and a fresh reception identity
//! for every exchange, so nothing on the wire links the exchange to the sender's long-term
//! identity, and nothing is reusable once the exchange completes (forward secrecy and
//! unlinkability).
//!
//! ## Protocol
//!
//! A sender derives a shared secret from its ephemeral secret key and the recipient's static
//! public key, encrypts a one-part request and attaches the ephemeral public key in the clear.
//! Before sending it pre-registers one routing [`Fingerprint`] per expected response part with
//! the transport, so arriving ciphertext is dispatched directly to the right in-flight exchange.
//! The receiver derives the same shared secret from the embedded public key and its own static
//! secret key, decrypts, and surfaces an [`IncomingRequest`] whose [`IncomingRequest::respond`]
//! partitions, encrypts and sends the reply parts in the opposite direction. All per-part keys
//! and fingerprints are derived deterministically from the shared secret, so both sides agree on
//! them independently.
//!
//! The underlying anonymous delivery network is abstracted behind the [`traits::Transport`]
//! trait and is not part of this crate; an in-memory loopback implementation for tests lives in
//! the `test_utils` module (behind the `test_utils` feature).
mod address;
mod collator;
mod crypto;
mod error;
mod fingerprints;
mod listener;
pub mod message;
mod pending;
mod round;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
mod transmit;

pub use address::{AddressError, MAX_ADDRESS_ATTEMPTS};
pub use collator::{Collator, CollatorError};
pub use crypto::{
    Cypher, CypherError, FINGERPRINT_LEN, Fingerprint, KeyError, MAC_LEN, Mac, PUBLIC_KEY_LEN,
    PublicKey, Rng, RngError, Role, SecretKey, SharedSecret,
};
pub use error::ExchangeError;
pub use listener::{IncomingRequest, Listener, listen};
pub use message::MessageError;
pub use transmit::{Contact, RequestParams, Response, ResponseCallback, Transmitter};
