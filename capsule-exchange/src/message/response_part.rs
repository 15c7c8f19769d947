// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::message::{
    MESSAGE_VERSION, MessageError, NUM_PARTS_LEN, PART_NUMBER_LEN, SIZE_LEN, VERSION_LEN,
    read_u16, write_u16,
};

const PART_NUMBER_OFFSET: usize = VERSION_LEN;
const MAX_PARTS_OFFSET: usize = VERSION_LEN + PART_NUMBER_LEN;
const SIZE_OFFSET: usize = VERSION_LEN + PART_NUMBER_LEN + NUM_PARTS_LEN;
const CONTENTS_OFFSET: usize = VERSION_LEN + PART_NUMBER_LEN + NUM_PARTS_LEN + SIZE_LEN;

/// Wire format of one response part.
///
/// Every part declares the total number of parts of the response, so the collator can latch the
/// expected count from whichever part arrives first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponsePart {
    data: Vec<u8>,
}

impl ResponsePart {
    /// Build an empty part filling a wire message of `external_size` bytes.
    pub fn new(external_size: usize) -> Result<Self, MessageError> {
        if external_size < CONTENTS_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: external_size,
                kind: "response part",
                min: CONTENTS_OFFSET,
            });
        }

        let mut data = vec![0; external_size];
        data[0] = MESSAGE_VERSION;

        Ok(Self { data })
    }

    /// Parse a part from decrypted bytes.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < CONTENTS_OFFSET {
            return Err(MessageError::BufferTooSmall {
                size: bytes.len(),
                kind: "response part",
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

    /// Version of the message.
    pub fn version(&self) -> u8 {
        self.data[0]
    }

    /// Index of this part within the response.
    pub fn part_number(&self) -> u8 {
        self.data[PART_NUMBER_OFFSET]
    }

    /// Set the index of this part.
    pub fn set_part_number(&mut self, num: u8) {
        self.data[PART_NUMBER_OFFSET] = num;
    }

    /// Total number of parts of the response.
    pub fn max_parts(&self) -> u8 {
        self.data[MAX_PARTS_OFFSET]
    }

    /// Declare the total number of parts of the response.
    pub fn set_max_parts(&mut self, num: u8) {
        self.data[MAX_PARTS_OFFSET] = num;
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

    use super::ResponsePart;

    #[test]
    fn roundtrip() {
        let mut part = ResponsePart::new(64).unwrap();
        part.set_part_number(1);
        part.set_max_parts(3);
        part.set_contents(b"response data").unwrap();

        let part_again = ResponsePart::unmarshal(part.as_bytes()).unwrap();
        assert_eq!(part_again.version(), 0);
        assert_eq!(part_again.part_number(), 1);
        assert_eq!(part_again.max_parts(), 3);
        assert_eq!(part_again.contents(), b"response data");
        assert_eq!(part_again.max_contents_size(), 59);
    }

    #[test]
    fn contents_bounded_by_capacity() {
        let mut part = ResponsePart::new(16).unwrap();
        assert_matches!(
            part.set_contents(&[0; 12]),
            Err(MessageError::ContentsTooLarge { size: 12, capacity: 11 })
        );
    }

    #[test]
    fn unmarshal_rejects_garbage() {
        assert_matches!(
            ResponsePart::unmarshal(&[0; 3]),
            Err(MessageError::BufferTooSmall { size: 3, .. })
        );

        // Declared size runs past the buffer.
        let mut bytes = vec![0u8; 16];
        bytes[3] = 0xff;
        bytes[4] = 0xff;
        assert_matches!(
            ResponsePart::unmarshal(&bytes),
            Err(MessageError::ContentsSizeOutOfRange { .. })
        );
    }
}
