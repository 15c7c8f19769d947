// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::message::{MessageError, PART_NUMBER_LEN, SIZE_LEN, read_u16, write_u16};

const SIZE_OFFSET: usize = PART_NUMBER_LEN;
const CONTENTS_OFFSET: usize = PART_NUMBER_LEN + SIZE_LEN;

/// Wire format of one supplementary request part.
///
/// The send path of this crate never produces these (requests are single-part by design), but
/// the receive path honors senders that declare more than one part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestPart {
    data: Vec<u8>,
}

impl RequestPart {
    /// Build an empty part filling a wire message of `external_size` bytes.
    pub fn new(external_size: usize) -> Result<Self, MessageError> {
        if external_size < CONTENTS_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: external_size,
                kind: "request part",
                min: CONTENTS_OFFSET,
            });
        }

        Ok(Self {
            data: vec![0; external_size],
        })
    }

    /// Parse a part from decrypted bytes.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < CONTENTS_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: bytes.len(),
                kind: "request part",
                min: CONTENTS_OFFSET,
            });
        }

        let part = Self {
            data: bytes.to_vec(),
        };

        let declared = part.contents_size();
        let capacity = part.max_contents_size();
        if declared > capacity {
            return Err(MessageError::ContentsSizeOutOfRange {
                size: declared,
                capacity,
            });
        }

        Ok(part)
    }

    /// Index of this part within the request.
    pub fn part_number(&self) -> u8 {
        self.data[0]
    }

    /// Set the index of this part.
    pub fn set_part_number(&mut self, num: u8) {
        self.data[0] = num;
    }

    /// The stored contents.
    pub fn contents(&self) -> &[u8] {
        &self.data[CONTENTS_OFFSET..CONTENTS_OFFSET + self.contents_size()]
    }

    /// Size of the stored contents.
    pub fn contents_size(&self) -> usize {
        read_u16(&self.data[SIZE_OFFSET..SIZE_OFFSET + SIZE_LEN]) as usize
    }

    /// Capacity of the contents slot.
    pub fn max_contents_size(&self) -> usize {
        self.data.len() - CONTENTS_OFFSET
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
            &mut self.data[SIZE_OFFSET..SIZE_OFFSET + SIZE_LEN],
            contents.len() as u16,
        );
        self.data[CONTENTS_OFFSET..CONTENTS_OFFSET + contents.len()].copy_from_slice(contents);

        Ok(())
    }

    /// Serialized bytes of the part.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::message::MessageError;

    use super::RequestPart;

    #[test]
    fn roundtrip() {
        let mut part = RequestPart::new(64).unwrap();
        part.set_part_number(3);
        part.set_contents(b"more request data").unwrap();

        let part_again = RequestPart::unmarshal(part.as_bytes()).unwrap();
        assert_eq!(part_again.part_number(), 3);
        assert_eq!(part_again.contents(), b"more request data");
        assert_eq!(part_again.max_contents_size(), 61);
    }

    #[test]
    fn contents_bounded_by_capacity() {
        let mut part = RequestPart::new(8).unwrap();
        assert_matches!(
            part.set_contents(&[0; 9]),
            Err(MessageError::ContentsTooLarge { size: 9, capacity: 5 })
        );
    }

    #[test]
    fn unmarshal_rejects_short_buffers() {
        assert_matches!(
            RequestPart::unmarshal(&[0; 2]),
            Err(MessageError::BufferTooSmall { size: 2, .. })
        );
    }
}
