// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use crate::id::RecipientId;

/// Rotation period of ephemeral addresses in nanoseconds (24 hours).
pub const ADDRESS_ROTATION_PERIOD: u64 = 24 * 60 * 60 * 1_000_000_000;

const OFFSET_CONTEXT: &str = "capsule-core address rotation offset";
const ADDRESS_CONTEXT: &str = "capsule-core ephemeral address";

/// Short-lived pseudonymous address derived from a [`RecipientId`].
///
/// Addresses live in a small, configurable space (`address_bits` wide) so that many identities
/// collide on the same address and an observer cannot tell which one a message was meant for.
/// They rotate once per [`ADDRESS_ROTATION_PERIOD`]; each identity is staggered into the period
/// by a stable offset so the whole network does not rotate at the same instant.
///
/// Derivation is fully determined by `(id, address_bits, now)`, allowing both ends of an
/// exchange to agree on the address without communicating.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EphemeralAddress(u64);

/// An ephemeral address together with the validity window of its rotation.
///
/// Timestamps are nanoseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressWindow {
    /// The derived address.
    pub address: EphemeralAddress,

    /// Start of the rotation window the address is valid in.
    pub valid_from: u64,

    /// End of the rotation window the address is valid in.
    pub valid_to: u64,
}

impl EphemeralAddress {
    /// Derive the address of `id` for the rotation window containing `now_nanos`.
    pub fn derive(id: &RecipientId, address_bits: u8, now_nanos: u64) -> AddressWindow {
        let offset = rotation_offset(id);
        let rotation = now_nanos.saturating_sub(offset) / ADDRESS_ROTATION_PERIOD;

        let valid_from = offset + rotation * ADDRESS_ROTATION_PERIOD;
        let valid_to = valid_from + ADDRESS_ROTATION_PERIOD;

        let mut hasher = blake3::Hasher::new_derive_key(ADDRESS_CONTEXT);
        hasher.update(id.as_bytes());
        hasher.update(&rotation.to_be_bytes());
        hasher.update(&[address_bits]);
        let digest = hasher.finalize();

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest.as_bytes()[..8]);
        let address = u64::from_be_bytes(raw) & address_mask(address_bits);

        AddressWindow {
            address: EphemeralAddress(address),
            valid_from,
            valid_to,
        }
    }

    /// Numeric value of the address.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl AddressWindow {
    /// Returns true when the validity window contains the whole interval `[start, end]`.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.valid_from <= start && end <= self.valid_to
    }
}

impl fmt::Display for EphemeralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EphemeralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EphemeralAddress({})", self.0)
    }
}

/// Stable per-identity offset into the rotation period.
fn rotation_offset(id: &RecipientId) -> u64 {
    let digest = blake3::Hasher::new_derive_key(OFFSET_CONTEXT)
        .update(id.as_bytes())
        .finalize();

    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(raw) % ADDRESS_ROTATION_PERIOD
}

fn address_mask(address_bits: u8) -> u64 {
    match address_bits {
        0 => 0,
        1..=63 => (1 << address_bits) - 1,
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use crate::id::RecipientId;

    use super::{ADDRESS_ROTATION_PERIOD, EphemeralAddress};

    // Some arbitrary timestamp well past the Unix epoch (2022-01-01).
    const NOW: u64 = 1_640_995_200_000_000_000;

    #[test]
    fn derivation_is_deterministic() {
        let id = RecipientId::derive(&[1; 32], b"payload");

        let window_1 = EphemeralAddress::derive(&id, 16, NOW);
        let window_2 = EphemeralAddress::derive(&id, 16, NOW);
        assert_eq!(window_1, window_2);
    }

    #[test]
    fn window_contains_now() {
        let id = RecipientId::derive(&[1; 32], b"payload");

        let window = EphemeralAddress::derive(&id, 16, NOW);
        assert!(window.valid_from <= NOW);
        assert!(NOW < window.valid_to);
        assert_eq!(window.valid_to - window.valid_from, ADDRESS_ROTATION_PERIOD);
    }

    #[test]
    fn address_fits_address_space() {
        let id = RecipientId::derive(&[2; 32], b"payload");

        let window = EphemeralAddress::derive(&id, 8, NOW);
        assert!(window.address.value() < 256);
    }

    #[test]
    fn rotation_changes_address() {
        let id = RecipientId::derive(&[3; 32], b"payload");

        let window = EphemeralAddress::derive(&id, 64, NOW);
        let next = EphemeralAddress::derive(&id, 64, window.valid_to + 1);

        assert_ne!(window.address, next.address);
        assert_eq!(next.valid_from, window.valid_to);
    }

    #[test]
    fn covers_checks_both_bounds() {
        let id = RecipientId::derive(&[4; 32], b"payload");
        let window = EphemeralAddress::derive(&id, 16, NOW);

        assert!(window.covers(window.valid_from, window.valid_to));
        assert!(!window.covers(window.valid_from.saturating_sub(1), window.valid_to));
        assert!(!window.covers(window.valid_from, window.valid_to + 1));
    }
}
