// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;

use thiserror::Error;

use crate::message::{MessageError, ResponsePart};

/// Reassembles the parts of a multi-part payload, in any arrival order.
///
/// The expected number of parts is latched exactly once from the first part seen; completion is
/// detected purely by count and index uniqueness. One mutex per instance makes concurrent calls
/// from independent delivery tasks safe.
#[derive(Debug)]
pub struct Collator {
    inner: Mutex<Slots>,
}

#[derive(Debug)]
struct Slots {
    parts: Vec<Option<Vec<u8>>>,
    max_parts: Option<u8>,
    received: u8,
}

impl Collator {
    /// Create a collator able to hold up to `capacity` parts.
    pub fn new(capacity: u8) -> Self {
        Self {
            inner: Mutex::new(Slots {
                parts: vec![None; capacity as usize],
                max_parts: None,
                received: 0,
            }),
        }
    }

    /// Feed one raw response part. Returns the reassembled payload once all parts have arrived.
    pub fn collate(&self, raw_part: &[u8]) -> Result<Option<Vec<u8>>, CollatorError> {
        let part = ResponsePart::unmarshal(raw_part)?;
        self.insert(part.part_number(), part.max_parts(), part.contents())
    }

    /// Store the contents of part `index` of `declared_max` total parts.
    ///
    /// A rejected part leaves all previously stored slots unmodified.
    pub fn insert(
        &self,
        index: u8,
        declared_max: u8,
        contents: &[u8],
    ) -> Result<Option<Vec<u8>>, CollatorError> {
        let mut slots = self.inner.lock().map_err(|_| CollatorError::LockPoisoned)?;

        // Latch the number of expected parts from the first part seen.
        let max_parts = match slots.max_parts {
            Some(max_parts) => max_parts,
            None => {
                if declared_max as usize > slots.parts.len() {
                    return Err(CollatorError::TooManyParts {
                        declared: declared_max,
                        capacity: slots.parts.len() as u8,
                    });
                }
                slots.max_parts = Some(declared_max);
                declared_max
            }
        };

        if index >= max_parts {
            return Err(CollatorError::PartOutOfRange { index, max_parts });
        }

        if slots.parts[index as usize].is_some() {
            return Err(CollatorError::DuplicatePart(index));
        }

        slots.parts[index as usize] = Some(contents.to_vec());
        slots.received += 1;

        if slots.received < max_parts {
            return Ok(None);
        }

        // Every index below max_parts is unique and filled, so the payload is complete.
        let payload = slots
            .parts
            .iter_mut()
            .take(max_parts as usize)
            .filter_map(Option::take)
            .flatten()
            .collect();

        Ok(Some(payload))
    }
}

/// Errors from collating payload parts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollatorError {
    /// A part declared more total parts than the collator was prepared for.
    #[error("part declares {declared} total parts, exceeding the expected maximum of {capacity}")]
    TooManyParts { declared: u8, capacity: u8 },

    /// A part carried an index at or above the declared total.
    #[error("part number {index} is out of range for a payload of {max_parts} parts")]
    PartOutOfRange { index: u8, max_parts: u8 },

    /// A part with this index has already been collated.
    #[error("part number {0} has already been received")]
    DuplicatePart(u8),

    /// The collator lock is poisoned.
    #[error("collator lock is poisoned")]
    LockPoisoned,

    /// The raw part could not be parsed.
    #[error(transparent)]
    Message(#[from] MessageError),
}
