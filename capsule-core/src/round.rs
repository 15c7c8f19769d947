// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one delivery round of the underlying transport.
///
/// Rounds are issued by the transport when a message is handed over for delivery and can later
/// be queried for their delivery outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId(pub u64);

impl From<u64> for RoundId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RoundId> for u64 {
    fn from(value: RoundId) -> Self {
        value.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
