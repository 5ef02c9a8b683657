//! Container header validation.

use crate::bitstream::Bitstream;
use crate::error::DecodeError;
use crate::input::InputCursor;

/// "BZh0" — the digit slot carries the block-size multiplier.
const MAGIC_BASE: u32 = 0x425A_6830;

/// Validated container identity.
///
/// The level digit (1–9) fixes the maximum size of a decoded block at
/// `level * 100_000` bytes; decode buffers are provisioned from it. Created
/// once per stream, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    level: u8,
}

impl StreamHeader {
    /// Read and validate the 4-byte stream header. `Ok(None)` means more
    /// input is needed.
    pub fn read(bs: &mut Bitstream, cursor: &InputCursor) -> Result<Option<Self>, DecodeError> {
        if !cursor.ensure(bs, 32)? {
            return Ok(None);
        }
        let head = bs.grab(32);
        if head <= MAGIC_BASE || head > MAGIC_BASE + 9 {
            return Err(DecodeError::InvalidContainerHeader);
        }
        Ok(Some(Self {
            level: (head - MAGIC_BASE) as u8,
        }))
    }

    /// Block-size multiplier digit, 1–9.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Maximum decoded size of one block in bytes.
    pub fn max_block_size(&self) -> usize {
        self.level as usize * 100_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ByteSource;
    use std::io::Cursor;

    fn read_header(bytes: &[u8]) -> Result<Option<StreamHeader>, DecodeError> {
        let mut source = ByteSource::new(Cursor::new(bytes.to_vec()), 64);
        let mut cursor = InputCursor::new();
        let mut bs = Bitstream::new();
        cursor.more(&mut bs, &mut source).unwrap();
        if !cursor.eof() {
            cursor.more(&mut bs, &mut source).unwrap();
        }
        StreamHeader::read(&mut bs, &cursor)
    }

    #[test]
    fn accepts_all_level_digits() {
        for digit in 1..=9u8 {
            let header = read_header(&[b'B', b'Z', b'h', b'0' + digit])
                .unwrap()
                .unwrap();
            assert_eq!(header.level(), digit);
            assert_eq!(header.max_block_size(), digit as usize * 100_000);
        }
    }

    #[test]
    fn rejects_bad_signatures() {
        for bad in [*b"BZh0", *b"BZh:", *b"GZh5", *b"\x00\x00\x00\x00"] {
            assert!(matches!(
                read_header(&bad),
                Err(DecodeError::InvalidContainerHeader)
            ));
        }
    }

    #[test]
    fn short_input_is_unexpected_eof() {
        assert!(matches!(
            read_header(b"BZ"),
            Err(DecodeError::UnexpectedEndOfInput)
        ));
    }
}
