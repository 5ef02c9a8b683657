//! Chunked byte source and the buffer it feeds.
//!
//! The pipeline never assumes anything about how the input arrives: chunks
//! may be any size down to a single byte and their boundaries are unrelated
//! to anything in the container format. `ByteSource` pulls one chunk per
//! call from an underlying reader; `InputCursor` accumulates those chunks
//! into the buffer the bit parser reads from, discarding consumed bytes on
//! every refill so memory stays proportional to one chunk plus a partial
//! word.

use std::io::{self, Read};

use crate::bitstream::Bitstream;
use crate::error::DecodeError;

/// Pulls fixed-size chunks from an underlying reader.
pub struct ByteSource<R> {
    inner: R,
    chunk: Vec<u8>,
}

impl<R: Read> ByteSource<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk: vec![0u8; chunk_size.max(1)],
        }
    }

    /// Read the next chunk. Short reads are passed through as-is; `None`
    /// marks end of input.
    pub fn next_chunk(&mut self) -> io::Result<Option<&[u8]>> {
        loop {
            match self.inner.read(&mut self.chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(&self.chunk[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Buffered bytes not yet consumed by the bit parser.
///
/// The parser-visible window is always a whole number of 32-bit words:
/// before end of input it is the aligned prefix of the buffer, and once the
/// source is exhausted the buffer is zero-padded to alignment so every valid
/// bit becomes readable. The cursor tracks how many buffered bytes are
/// padding, which lets callers distinguish a genuinely truncated stream from
/// reads that would only land in filler.
#[derive(Debug, Default)]
pub struct InputCursor {
    buf: Vec<u8>,
    pad: usize,
    eof: bool,
    discarded: u64,
}

impl InputCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the underlying source has reported end of input.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// The word-aligned slice the bitstream may read from.
    pub fn window(&self) -> &[u8] {
        if self.eof {
            &self.buf
        } else {
            &self.buf[..self.buf.len() & !3]
        }
    }

    /// Absolute bit position of `bs` within the overall stream.
    pub fn consumed_bits(&self, bs: &Bitstream) -> u64 {
        (self.discarded + bs.pos() as u64) * 8 - u64::from(bs.live())
    }

    /// Bits of real (non-padding) input still ahead of `bs`. Negative once
    /// the cursor has read into end-of-input padding.
    pub fn remaining_valid_bits(&self, bs: &Bitstream) -> i64 {
        (self.buf.len() as i64 - self.pad as i64 - bs.pos() as i64) * 8 + i64::from(bs.live())
    }

    /// Drop consumed bytes and append the next chunk from `source`. On end
    /// of input, marks the cursor and pads the tail to word alignment.
    pub fn more<R: Read>(
        &mut self,
        bs: &mut Bitstream,
        source: &mut ByteSource<R>,
    ) -> Result<(), DecodeError> {
        debug_assert!(!self.eof, "refill after end of input");
        if bs.pos() > 0 {
            self.discarded += bs.pos() as u64;
            self.buf.drain(..bs.pos());
            bs.rebase();
        }
        match source.next_chunk()? {
            Some(chunk) => self.buf.extend_from_slice(chunk),
            None => {
                self.eof = true;
                let rem = self.buf.len() % 4;
                if rem != 0 {
                    self.pad = 4 - rem;
                    self.buf.resize(self.buf.len() + self.pad, 0);
                }
            }
        }
        Ok(())
    }

    /// Make `n` bits readable for `bs`. `Ok(true)` means go ahead,
    /// `Ok(false)` means the caller must refill first. Fails with
    /// [`DecodeError::UnexpectedEndOfInput`] when the source is exhausted
    /// and the bits either do not exist or would come from padding.
    pub fn ensure(&self, bs: &mut Bitstream, n: u32) -> Result<bool, DecodeError> {
        if bs.need(self.window(), n) {
            if self.eof && self.remaining_valid_bits(bs) < i64::from(n) {
                return Err(DecodeError::UnexpectedEndOfInput);
            }
            Ok(true)
        } else if self.eof {
            Err(DecodeError::UnexpectedEndOfInput)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn window_is_word_aligned_until_eof() {
        let mut source = ByteSource::new(Cursor::new(vec![1u8, 2, 3, 4, 5, 6]), 5);
        let mut cursor = InputCursor::new();
        let mut bs = Bitstream::new();

        cursor.more(&mut bs, &mut source).unwrap();
        assert_eq!(cursor.window(), &[1, 2, 3, 4]);

        cursor.more(&mut bs, &mut source).unwrap();
        assert_eq!(cursor.window(), &[1, 2, 3, 4]);

        // End of input: tail padded out to a whole word.
        cursor.more(&mut bs, &mut source).unwrap();
        assert!(cursor.eof());
        assert_eq!(cursor.window(), &[1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(cursor.remaining_valid_bits(&bs), 48);
    }

    #[test]
    fn ensure_rejects_reads_into_padding() {
        let mut source = ByteSource::new(Cursor::new(vec![0xAAu8; 5]), 64);
        let mut cursor = InputCursor::new();
        let mut bs = Bitstream::new();
        cursor.more(&mut bs, &mut source).unwrap();
        cursor.more(&mut bs, &mut source).unwrap();
        assert!(cursor.eof());

        assert!(cursor.ensure(&mut bs, 32).unwrap());
        bs.dump(32);
        // Only 8 valid bits remain; 24 more would be padding.
        assert!(matches!(
            cursor.ensure(&mut bs, 32),
            Err(DecodeError::UnexpectedEndOfInput)
        ));
        assert!(cursor.ensure(&mut bs, 8).unwrap());
    }
}
