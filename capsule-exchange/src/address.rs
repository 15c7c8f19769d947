// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capsule_core::{EphemeralAddress, RecipientId};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{PublicKey, Rng, RngError};
use crate::message::RequestPayload;
use crate::traits::EphemeralIdentity;

/// Maximum number of nonce regenerations when searching for an acceptable address window.
///
/// The search is expected to succeed within a handful of attempts; hitting the cap means the
/// clock and the address rotation disagree badly, and looping further would hang forever.
pub const MAX_ADDRESS_ATTEMPTS: usize = 1000;

/// Generate the reception identity of an outbound exchange.
///
/// Embeds a fresh nonce into the payload, derives the content-addressed identity from the
/// public key and payload bytes, and derives the identity's current ephemeral address. The
/// address validity window must cover `now ± 2×timeout` so the identity stays reachable for the
/// whole exchange; otherwise the nonce is regenerated and the search retried, up to
/// [`MAX_ADDRESS_ATTEMPTS`].
pub(crate) fn make_ids(
    payload: &mut RequestPayload,
    public_key: &PublicKey,
    address_bits: u8,
    timeout: Duration,
    now_nanos: u64,
    rng: &Rng,
) -> Result<EphemeralIdentity, AddressError> {
    let margin = saturating_nanos(2 * timeout);
    let window_start = now_nanos.saturating_sub(margin);
    let window_end = now_nanos.saturating_add(margin);

    for attempt in 0..MAX_ADDRESS_ATTEMPTS {
        payload.set_nonce(rng)?;

        let id = RecipientId::derive(public_key.as_bytes(), payload.as_bytes());
        let window = EphemeralAddress::derive(&id, address_bits, now_nanos);

        if window.covers(window_start, window_end) {
            debug!(%id, address = %window.address, attempt, "generated reception identity");

            return Ok(EphemeralIdentity {
                id,
                address: window.address,
                valid_from: window.valid_from,
                valid_to: window.valid_to,
            });
        }
    }

    Err(AddressError::WindowExceeded {
        attempts: MAX_ADDRESS_ATTEMPTS,
        timeout,
    })
}

/// Nanoseconds since the Unix epoch.
pub(crate) fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_nanos)
        .unwrap_or(0)
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Errors from generating an ephemeral reception identity.
#[derive(Debug, Error)]
pub enum AddressError {
    /// No generated identity had an address window covering the exchange lifetime.
    #[error(
        "no address window covering ±2×{timeout:?} around now after {attempts} attempts; \
         the clock disagrees with the address rotation"
    )]
    WindowExceeded { attempts: usize, timeout: Duration },

    /// Drawing a nonce failed.
    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use capsule_core::ADDRESS_ROTATION_PERIOD;

    use crate::crypto::{Rng, SecretKey};
    use crate::message::RequestPayload;

    use super::{AddressError, make_ids};

    // Some arbitrary timestamp well past the Unix epoch (2022-01-01).
    const NOW: u64 = 1_640_995_200_000_000_000;

    #[test]
    fn identity_window_covers_the_exchange_lifetime() {
        let rng = Rng::from_seed([1; 32]);
        let public_key = SecretKey::generate(&rng).unwrap().public_key();
        let mut payload = RequestPayload::new(128, b"hello", 1).unwrap();

        let timeout = Duration::from_secs(30);
        let identity =
            make_ids(&mut payload, &public_key, 16, timeout, NOW, &rng).unwrap();

        let margin = 2 * timeout.as_nanos() as u64;
        assert!(identity.valid_from <= NOW - margin);
        assert!(NOW + margin <= identity.valid_to);
    }

    #[test]
    fn identity_is_derived_from_the_nonced_payload() {
        let rng = Rng::from_seed([2; 32]);
        let public_key = SecretKey::generate(&rng).unwrap().public_key();
        let mut payload = RequestPayload::new(128, b"hello", 1).unwrap();

        let timeout = Duration::from_secs(30);
        let identity_1 =
            make_ids(&mut payload, &public_key, 16, timeout, NOW, &rng).unwrap();
        let identity_2 =
            make_ids(&mut payload, &public_key, 16, timeout, NOW, &rng).unwrap();

        // A fresh nonce yields a fresh identity.
        assert_ne!(identity_1.id, identity_2.id);
    }

    #[test]
    fn impossible_window_fails_loudly() {
        let rng = Rng::from_seed([3; 32]);
        let public_key = SecretKey::generate(&rng).unwrap().public_key();
        let mut payload = RequestPayload::new(128, b"hello", 1).unwrap();

        // A timeout so large that no rotation window can ever cover ±2×timeout.
        let timeout = Duration::from_nanos(ADDRESS_ROTATION_PERIOD);

        assert_matches!(
            make_ids(&mut payload, &public_key, 16, timeout, NOW, &rng),
            Err(AddressError::WindowExceeded { .. })
        );
    }
}
