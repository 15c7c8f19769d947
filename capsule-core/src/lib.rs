// SPDX-License-Identifier: MIT OR Apache-2.0

//! `capsule-core` provides the identifier and addressing primitives shared by the capsule
//! protocol crates.
//!
//! Single-use exchanges never reveal a long-term identity on the wire. Instead, every exchange
//! answers to a fresh [`RecipientId`] derived from the content of the request itself, and is
//! reachable under a short-lived, time-windowed [`EphemeralAddress`] derived from that
//! identifier. Both derivations are deterministic so that sender and receiver agree on them
//! without any extra round trips.
pub mod address;
pub mod id;
pub mod round;
mod serde;

pub use address::{ADDRESS_ROTATION_PERIOD, AddressWindow, EphemeralAddress};
pub use id::{IdError, RECIPIENT_ID_LEN, RecipientId};
pub use round::RoundId;
