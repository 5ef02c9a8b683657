use std::io;

use thiserror::Error;

/// The primary error type for all operations in the `parbz` crate.
///
/// Every variant is fatal for the current decode session: a corrupted or
/// truncated container cannot be repaired by re-reading, so there is no
/// retry. Output bytes delivered before the failure remain valid and are not
/// retracted.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The leading four bytes of the input are not a bzip2 stream header.
    #[error("not a bzip2 stream (bad container header)")]
    InvalidContainerHeader,

    /// A malformed block header or structurally corrupt block payload.
    #[error("corrupt block: {0}")]
    InvalidBlockHeader(&'static str),

    /// The stream trailer checksum disagrees with the accumulated block
    /// checksums.
    #[error("stream checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    StreamChecksumMismatch { stored: u32, computed: u32 },

    /// A decoded block's checksum disagrees with the value declared in its
    /// header.
    #[error("block checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    BlockChecksumMismatch { expected: u32, actual: u32 },

    /// The input ended before the container header or before the
    /// end-of-stream marker was reached.
    #[error("unexpected end of input")]
    UnexpectedEndOfInput,

    /// A decode stage reported a state that cannot occur with a conformant
    /// pipeline.
    #[error("internal decoder error: {0}")]
    EngineInternalError(&'static str),

    /// An I/O error from the underlying byte source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<DecodeError> for io::Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(e) => e,
            DecodeError::UnexpectedEndOfInput => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
