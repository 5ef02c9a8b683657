//! Resumable block-boundary parser.
//!
//! Sits between the container header and the per-block decoder: it walks the
//! bitstream looking for the 48-bit magic that opens each compressed block
//! or the 48-bit end-of-stream marker, pulls the 32-bit checksum that
//! follows either one, and keeps the running combination of block checksums
//! that the trailer must match. The state machine suspends whenever the
//! buffered input runs out, and resuming after a refill continues from the
//! same bit — nothing is ever re-parsed.
//!
//! The parser only ever sees the stream with the cursor parked exactly at a
//! boundary: the decoder consumes a block's payload bit-for-bit, so no
//! scanning or resynchronisation is needed.

use crate::bitstream::Bitstream;
use crate::error::DecodeError;
use crate::header::StreamHeader;
use crate::input::InputCursor;

const BLOCK_MAGIC_HI: u32 = 0x0031_4159;
const BLOCK_MAGIC_LO: u32 = 0x0026_5359;
const END_MAGIC_HI: u32 = 0x0017_7245;
const END_MAGIC_LO: u32 = 0x0038_5090;

/// Per-block facts the parser hands to the dispatcher: the checksum the
/// decoded payload must reproduce. The payload itself is consumed in place,
/// starting at the cursor position at which this header was yielded.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub crc: u32,
}

/// Outcome of one [`BlockParser::step`] call.
#[derive(Debug)]
pub enum ParseEvent {
    /// The buffered input is exhausted; refill and call again.
    NeedMore,
    /// A compressed block starts at the current cursor position.
    Block(BlockHeader),
    /// End-of-stream marker seen and trailer checksum verified.
    Finished,
}

#[derive(Debug, Clone, Copy)]
enum State {
    MagicHi,
    MagicLo { end_of_stream: bool },
    BlockCrc,
    StreamCrc,
    Finished,
}

/// State machine locating block boundaries and the stream trailer.
pub struct BlockParser {
    state: State,
    combined_crc: u32,
    blocks: u64,
    garbage_bits: u32,
    level: u8,
}

impl BlockParser {
    pub fn new(header: &StreamHeader) -> Self {
        Self {
            state: State::MagicHi,
            combined_crc: 0,
            blocks: 0,
            garbage_bits: 0,
            level: header.level(),
        }
    }

    /// Number of blocks announced so far.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Bits left over after the trailer, at most 31 by construction. Only
    /// meaningful once `Finished` has been returned.
    pub fn garbage_bits(&self) -> u32 {
        self.garbage_bits
    }

    /// Advance until a block, the verified trailer, or input starvation.
    pub fn step(
        &mut self,
        bs: &mut Bitstream,
        cursor: &InputCursor,
    ) -> Result<ParseEvent, DecodeError> {
        loop {
            match self.state {
                State::MagicHi => {
                    if !cursor.ensure(bs, 24)? {
                        return Ok(ParseEvent::NeedMore);
                    }
                    self.state = match bs.grab(24) {
                        BLOCK_MAGIC_HI => State::MagicLo {
                            end_of_stream: false,
                        },
                        END_MAGIC_HI => State::MagicLo {
                            end_of_stream: true,
                        },
                        _ => return Err(DecodeError::InvalidBlockHeader("bad block magic")),
                    };
                }
                State::MagicLo { end_of_stream } => {
                    if !cursor.ensure(bs, 24)? {
                        return Ok(ParseEvent::NeedMore);
                    }
                    let expected = if end_of_stream {
                        END_MAGIC_LO
                    } else {
                        BLOCK_MAGIC_LO
                    };
                    if bs.grab(24) != expected {
                        return Err(DecodeError::InvalidBlockHeader("bad block magic"));
                    }
                    self.state = if end_of_stream {
                        State::StreamCrc
                    } else {
                        State::BlockCrc
                    };
                }
                State::BlockCrc => {
                    if !cursor.ensure(bs, 32)? {
                        return Ok(ParseEvent::NeedMore);
                    }
                    let crc = bs.grab(32);
                    self.combined_crc = self.combined_crc.rotate_left(1) ^ crc;
                    self.blocks += 1;
                    self.state = State::MagicHi;
                    return Ok(ParseEvent::Block(BlockHeader { crc }));
                }
                State::StreamCrc => {
                    if !cursor.ensure(bs, 32)? {
                        return Ok(ParseEvent::NeedMore);
                    }
                    let stored = bs.grab(32);
                    if stored != self.combined_crc {
                        return Err(DecodeError::StreamChecksumMismatch {
                            stored,
                            computed: self.combined_crc,
                        });
                    }
                    self.garbage_bits = cursor.remaining_valid_bits(bs).max(0) as u32;
                    self.state = State::Finished;
                    tracing::debug!(
                        level = self.level,
                        blocks = self.blocks,
                        garbage_bits = self.garbage_bits,
                        "end of stream, trailer checksum verified"
                    );
                    return Ok(ParseEvent::Finished);
                }
                State::Finished => return Ok(ParseEvent::Finished),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ByteSource;
    use std::io::Cursor;

    const HELLO_BZ2: [u8; 56] = [
        66, 90, 104, 57, 49, 65, 89, 38, 83, 89, 216, 114, 1, 47, 0, 0, 1, 87, 128, 0, 16, 64, 0,
        0, 64, 0, 128, 6, 4, 144, 0, 32, 0, 34, 6, 134, 212, 32, 201, 136, 199, 105, 232, 40, 31,
        139, 185, 34, 156, 40, 72, 108, 57, 0, 151, 128,
    ];

    fn start(bytes: &[u8]) -> (ByteSource<Cursor<Vec<u8>>>, InputCursor, Bitstream, BlockParser) {
        let mut source = ByteSource::new(Cursor::new(bytes.to_vec()), 64 * 1024);
        let mut cursor = InputCursor::new();
        let mut bs = Bitstream::new();
        let header = loop {
            match StreamHeader::read(&mut bs, &cursor).unwrap() {
                Some(h) => break h,
                None => cursor.more(&mut bs, &mut source).unwrap(),
            }
        };
        let parser = BlockParser::new(&header);
        (source, cursor, bs, parser)
    }

    fn next_event(
        source: &mut ByteSource<Cursor<Vec<u8>>>,
        cursor: &mut InputCursor,
        bs: &mut Bitstream,
        parser: &mut BlockParser,
    ) -> Result<ParseEvent, DecodeError> {
        loop {
            match parser.step(bs, cursor)? {
                ParseEvent::NeedMore => cursor.more(bs, source)?,
                other => return Ok(other),
            }
        }
    }

    #[test]
    fn announces_the_first_block_with_its_checksum() {
        let (mut source, mut cursor, mut bs, mut parser) = start(&HELLO_BZ2);
        let event = next_event(&mut source, &mut cursor, &mut bs, &mut parser).unwrap();
        match event {
            ParseEvent::Block(head) => assert_eq!(head.crc, 0xD872_012F),
            other => panic!("expected a block, got {other:?}"),
        }
        assert_eq!(parser.blocks(), 1);
        // Header (32) + magic (48) + checksum (32) consumed so far.
        assert_eq!(cursor.consumed_bits(&bs), 112);
    }

    #[test]
    fn empty_container_finishes_immediately() {
        let empty = [
            b'B', b'Z', b'h', b'9', 0x17, 0x72, 0x45, 0x38, 0x50, 0x90, 0x00, 0x00, 0x00, 0x00,
        ];
        let (mut source, mut cursor, mut bs, mut parser) = start(&empty);
        let event = next_event(&mut source, &mut cursor, &mut bs, &mut parser).unwrap();
        assert!(matches!(event, ParseEvent::Finished));
        assert_eq!(parser.blocks(), 0);
        assert!(parser.garbage_bits() < 32);
        // Terminal state holds.
        let again = next_event(&mut source, &mut cursor, &mut bs, &mut parser).unwrap();
        assert!(matches!(again, ParseEvent::Finished));
    }

    #[test]
    fn trailer_mismatch_is_reported() {
        let bad = [
            b'B', b'Z', b'h', b'9', 0x17, 0x72, 0x45, 0x38, 0x50, 0x90, 0x00, 0x00, 0x00, 0x01,
        ];
        let (mut source, mut cursor, mut bs, mut parser) = start(&bad);
        let err = next_event(&mut source, &mut cursor, &mut bs, &mut parser).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::StreamChecksumMismatch {
                stored: 1,
                computed: 0
            }
        ));
    }

    #[test]
    fn garbage_where_a_magic_should_be_is_rejected() {
        let mut bad = HELLO_BZ2;
        bad[4] = 0x00;
        let (mut source, mut cursor, mut bs, mut parser) = start(&bad);
        let err = next_event(&mut source, &mut cursor, &mut bs, &mut parser).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidBlockHeader(_)));
    }

    #[test]
    fn truncation_before_any_block_is_unexpected_eof() {
        let (mut source, mut cursor, mut bs, mut parser) = start(&HELLO_BZ2[..8]);
        let err = next_event(&mut source, &mut cursor, &mut bs, &mut parser).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEndOfInput));
    }
}
