// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives of the exchange protocol: ephemeral x25519 keys, deterministic
//! per-part key and fingerprint derivation, and authenticated encryption.
mod cypher;
mod keys;
mod rng;
mod secret;

pub use cypher::{
    Cypher, CypherError, FINGERPRINT_LEN, Fingerprint, KEY_LEN, MAC_LEN, Mac, Role, make_cyphers,
};
pub use keys::{KeyError, PUBLIC_KEY_LEN, PublicKey, SecretKey, SharedSecret};
pub use rng::{Rng, RngError};
pub use secret::Secret;
