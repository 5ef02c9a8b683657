//! # parbz Core Library
//!
//! This crate provides the core functionality for the `parbz` parallel
//! bzip2 decompressor.
//!
//! It is designed to be used by the `parbz` command-line application, but
//! its public API can also be used to decompress bzip2 streams
//! programmatically from any `Read` source into any `Write` sink.
//!
//! ## Key Modules
//!
//! - [`input`]: Chunked byte source and the word-aligned parse buffer.
//! - [`bitstream`]: Bit-granular cursor with suspend/resume semantics.
//! - [`header`]: Container header validation.
//! - [`parser`]: Resumable block-boundary parser and trailer verification.
//! - [`decoder`]: Per-block decode engine (Huffman, move-to-front, inverse
//!   BWT, run-length expansion, checksums).
//! - [`pipeline`]: The order-preserving parallel dispatch pipeline.
//!
//! ## Example
//!
//! ```no_run
//! use std::fs::File;
//!
//! let input = File::open("data.bz2").unwrap();
//! let mut output = Vec::new();
//! parbz::decompress(input, &mut output, parbz::DecodeOptions::default()).unwrap();
//! ```

pub mod bitstream;
pub mod cli;
pub mod decoder;
pub mod error;
pub mod header;
pub mod input;
pub mod parser;
pub mod pipeline;

pub use error::DecodeError;
pub use pipeline::{decompress, DecodeOptions, ParallelDecoder, PipelineStats};
