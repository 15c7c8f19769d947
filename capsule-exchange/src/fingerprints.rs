// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::Mutex;

use crate::crypto::{Cypher, Fingerprint};

/// Per-exchange lookup table from response fingerprints to part indices.
///
/// A fingerprint is consumed (looked up and removed) at most once per exchange: a second
/// delivery under the same fingerprint is a replay and gets dropped by the caller.
#[derive(Debug)]
pub(crate) struct FingerprintMap {
    inner: Mutex<HashMap<Fingerprint, u64>>,
}

impl FingerprintMap {
    /// Build the map over the fingerprints of the given cyphers, keyed to their indices.
    pub fn new(cyphers: &[Cypher]) -> Self {
        let fingerprints = cyphers
            .iter()
            .enumerate()
            .map(|(index, cypher)| (cypher.fingerprint(), index as u64))
            .collect();

        Self {
            inner: Mutex::new(fingerprints),
        }
    }

    /// Look up the part index of a fingerprint without consuming it.
    pub fn index_of(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(fingerprint).copied())
    }

    /// Consume a fingerprint, returning its part index. Returns `None` if the fingerprint is
    /// unknown or has already been consumed.
    pub fn pop(&self, fingerprint: &Fingerprint) -> Option<u64> {
        self.inner
            .lock()
            .ok()
            .and_then(|mut map| map.remove(fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::{Role, SecretKey, Rng, make_cyphers};

    use super::FingerprintMap;

    #[test]
    fn fingerprints_are_consumed_once() {
        let rng = Rng::from_seed([1; 32]);
        let ours = SecretKey::generate(&rng).unwrap();
        let theirs = SecretKey::generate(&rng).unwrap();
        let secret = ours.shared_secret(&theirs.public_key());

        let cyphers = make_cyphers(&secret, 3, Role::Response);
        let map = FingerprintMap::new(&cyphers);

        let fingerprint = cyphers[1].fingerprint();
        assert_eq!(map.index_of(&fingerprint), Some(1));
        assert_eq!(map.pop(&fingerprint), Some(1));

        // A second lookup finds nothing.
        assert_eq!(map.index_of(&fingerprint), None);
        assert_eq!(map.pop(&fingerprint), None);

        // Other fingerprints are unaffected.
        assert_eq!(map.pop(&cyphers[2].fingerprint()), Some(2));
    }
}
