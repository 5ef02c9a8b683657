//! Per-block decode engine.
//!
//! One `BlockDecoder` handles exactly one compressed block through three
//! phases that mirror how the work can be scheduled:
//!
//! 1. [`BlockDecoder::retrieve`] — bit-level decode of the block's
//!    entropy-coded representation (symbol map, selectors, delta-coded
//!    Huffman tables, then the RUNA/RUNB + move-to-front symbol stream)
//!    into owned working buffers. This is the only phase that touches the
//!    shared input cursor, so it runs on the producer thread and is
//!    resumable: when the buffered input runs out it returns `true` and the
//!    caller refills. It consumes the payload bit-for-bit and leaves the
//!    cursor parked exactly on the next block boundary.
//! 2. [`BlockDecoder::decode`] — the inverse Burrows-Wheeler transform.
//!    Needs no input, so it can run on any worker thread.
//! 3. [`BlockDecoder::emit`] — final run-length expansion producing the
//!    plain bytes plus their checksum. The engine does not compare the
//!    checksum itself; the dispatcher checks it against the block header.
//!
//! Blocks with the deprecated randomisation flag (last emitted by bzip2
//! 0.9.0) are rejected as corrupt.

use crate::bitstream::Bitstream;
use crate::error::DecodeError;
use crate::input::InputCursor;

const MAX_GROUPS: usize = 6;
const GROUP_SIZE: usize = 50;
/// 256 byte values + RUNA/RUNB + end-of-block.
const MAX_ALPHA: usize = 258;
const MAX_SELECTORS: usize = 2 + 900_000 / GROUP_SIZE;
const MAX_CODE_LEN: usize = 23;

const RUN_A: u16 = 0;
const RUN_B: u16 = 1;

/// CRC-32 as bzip2 computes it: polynomial 0x04C11DB7, bits fed most
/// significant first, no reflection, initial and final value complemented.
const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

#[inline]
pub(crate) fn crc_update(crc: u32, byte: u8) -> u32 {
    (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ byte) as usize]
}

/// Canonical Huffman decode tables for one coding group, laid out the way
/// the reference decoder walks them: `limit[n]` is the largest n-bit code,
/// `base[n]` rebases an n-bit code into `perm`.
struct HuffGroup {
    limit: [i32; MAX_CODE_LEN + 1],
    base: [i32; MAX_CODE_LEN + 1],
    perm: [u16; MAX_ALPHA],
    min_len: u32,
}

impl HuffGroup {
    fn build(lens: &[u8]) -> Self {
        let min_len = u32::from(lens.iter().copied().min().unwrap_or(1));
        let max_len = u32::from(lens.iter().copied().max().unwrap_or(1));

        let mut perm = [0u16; MAX_ALPHA];
        let mut pp = 0;
        let mut l = min_len;
        while l <= max_len {
            for (sym, &len) in lens.iter().enumerate() {
                if u32::from(len) == l {
                    perm[pp] = sym as u16;
                    pp += 1;
                }
            }
            l += 1;
        }

        let mut base = [0i32; MAX_CODE_LEN + 1];
        for &len in lens {
            base[len as usize + 1] += 1;
        }
        for i in 1..=MAX_CODE_LEN {
            base[i] += base[i - 1];
        }

        let mut limit = [0i32; MAX_CODE_LEN + 1];
        let mut vec = 0i32;
        for i in min_len as usize..=max_len as usize {
            vec += base[i + 1] - base[i];
            limit[i] = vec - 1;
            vec <<= 1;
        }
        for i in min_len as usize + 1..=max_len as usize {
            base[i] = ((limit[i - 1] + 1) << 1) - base[i];
        }

        Self {
            limit,
            base,
            perm,
            min_len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    BlockHead,
    MapCoarse,
    MapFine,
    GroupCount,
    Selectors,
    CodeLens,
    Symbols,
    Complete,
}

/// Decode state for a single block. See the module docs for the phase
/// protocol.
pub struct BlockDecoder {
    max_block: usize,
    stage: Stage,

    orig_ptr: u32,
    map_used: u32,
    map_row: usize,
    seq_to_unseq: Vec<u8>,
    alpha_size: usize,

    n_groups: usize,
    n_selectors: usize,
    sel_pos: [u8; MAX_GROUPS],
    selectors: Vec<u8>,

    lens: [[u8; MAX_ALPHA]; MAX_GROUPS],
    cur_group: usize,
    cur_sym: usize,
    cur_len: i32,
    len_seeded: bool,

    groups: Vec<HuffGroup>,
    sel_idx: usize,
    group_pos: usize,
    active_group: usize,
    mtf: Vec<u8>,
    run_len: u64,
    run_shift: u32,

    block: Vec<u8>,
    freq: [u32; 256],
    ibwt: Vec<u8>,
}

impl BlockDecoder {
    /// `max_block` is the stream's declared block capacity
    /// ([`crate::header::StreamHeader::max_block_size`]).
    pub fn new(max_block: usize) -> Self {
        Self {
            max_block,
            stage: Stage::BlockHead,
            orig_ptr: 0,
            map_used: 0,
            map_row: 0,
            seq_to_unseq: Vec::new(),
            alpha_size: 0,
            n_groups: 0,
            n_selectors: 0,
            sel_pos: [0; MAX_GROUPS],
            selectors: Vec::new(),
            lens: [[0; MAX_ALPHA]; MAX_GROUPS],
            cur_group: 0,
            cur_sym: 0,
            cur_len: 0,
            len_seeded: false,
            groups: Vec::new(),
            sel_idx: 0,
            group_pos: 0,
            active_group: 0,
            mtf: Vec::new(),
            run_len: 0,
            run_shift: 0,
            block: Vec::new(),
            freq: [0; 256],
            ibwt: Vec::new(),
        }
    }

    /// Consume the block payload from the shared cursor. Returns `true`
    /// while more input is required; after `Ok(false)` the engine is
    /// self-contained and the cursor sits on the next block boundary.
    pub fn retrieve(
        &mut self,
        bs: &mut Bitstream,
        cursor: &InputCursor,
    ) -> Result<bool, DecodeError> {
        loop {
            match self.stage {
                Stage::BlockHead => {
                    if !cursor.ensure(bs, 25)? {
                        return Ok(true);
                    }
                    if bs.grab(1) == 1 {
                        return Err(DecodeError::InvalidBlockHeader(
                            "randomised blocks are not supported",
                        ));
                    }
                    self.orig_ptr = bs.grab(24);
                    if self.orig_ptr as usize > 10 + self.max_block {
                        return Err(DecodeError::InvalidBlockHeader("origin pointer out of range"));
                    }
                    self.stage = Stage::MapCoarse;
                }
                Stage::MapCoarse => {
                    if !cursor.ensure(bs, 16)? {
                        return Ok(true);
                    }
                    self.map_used = bs.grab(16);
                    self.map_row = 0;
                    self.stage = Stage::MapFine;
                }
                Stage::MapFine => {
                    while self.map_row < 16 {
                        if self.map_used >> (15 - self.map_row) & 1 == 0 {
                            self.map_row += 1;
                            continue;
                        }
                        if !cursor.ensure(bs, 16)? {
                            return Ok(true);
                        }
                        let fine = bs.grab(16);
                        for bit in 0..16 {
                            if fine >> (15 - bit) & 1 == 1 {
                                self.seq_to_unseq.push((self.map_row * 16 + bit) as u8);
                            }
                        }
                        self.map_row += 1;
                    }
                    if self.seq_to_unseq.is_empty() {
                        return Err(DecodeError::InvalidBlockHeader("empty symbol map"));
                    }
                    self.alpha_size = self.seq_to_unseq.len() + 2;
                    self.stage = Stage::GroupCount;
                }
                Stage::GroupCount => {
                    if !cursor.ensure(bs, 18)? {
                        return Ok(true);
                    }
                    self.n_groups = bs.grab(3) as usize;
                    if !(2..=MAX_GROUPS).contains(&self.n_groups) {
                        return Err(DecodeError::InvalidBlockHeader("bad coding group count"));
                    }
                    self.n_selectors = bs.grab(15) as usize;
                    if !(1..=MAX_SELECTORS).contains(&self.n_selectors) {
                        return Err(DecodeError::InvalidBlockHeader("bad selector count"));
                    }
                    for (i, slot) in self.sel_pos.iter_mut().enumerate() {
                        *slot = i as u8;
                    }
                    self.selectors = Vec::with_capacity(self.n_selectors);
                    self.stage = Stage::Selectors;
                }
                Stage::Selectors => {
                    while self.selectors.len() < self.n_selectors {
                        // A selector is at most five 1-bits and a 0-bit.
                        if !cursor.ensure(bs, 6)? {
                            return Ok(true);
                        }
                        let mut j = 0;
                        while bs.grab(1) == 1 {
                            j += 1;
                            if j >= self.n_groups {
                                return Err(DecodeError::InvalidBlockHeader(
                                    "selector out of range",
                                ));
                            }
                        }
                        let chosen = self.sel_pos[j];
                        self.sel_pos.copy_within(0..j, 1);
                        self.sel_pos[0] = chosen;
                        self.selectors.push(chosen);
                    }
                    self.cur_group = 0;
                    self.len_seeded = false;
                    self.stage = Stage::CodeLens;
                }
                Stage::CodeLens => {
                    if self.read_code_lens(bs, cursor)? {
                        return Ok(true);
                    }
                }
                Stage::Symbols => {
                    if self.read_symbols(bs, cursor)? {
                        return Ok(true);
                    }
                }
                Stage::Complete => return Ok(false),
            }
        }
    }

    /// Delta-coded code lengths, one table per group. Advances to
    /// [`Stage::Symbols`] once all tables are read; returns `true` on input
    /// starvation.
    fn read_code_lens(
        &mut self,
        bs: &mut Bitstream,
        cursor: &InputCursor,
    ) -> Result<bool, DecodeError> {
        while self.cur_group < self.n_groups {
            if !self.len_seeded {
                if !cursor.ensure(bs, 5)? {
                    return Ok(true);
                }
                self.cur_len = bs.grab(5) as i32;
                self.len_seeded = true;
                self.cur_sym = 0;
            }
            while self.cur_sym < self.alpha_size {
                if !(1..=20).contains(&self.cur_len) {
                    return Err(DecodeError::InvalidBlockHeader("code length out of range"));
                }
                if !cursor.ensure(bs, 2)? {
                    return Ok(true);
                }
                if bs.grab(1) == 0 {
                    self.lens[self.cur_group][self.cur_sym] = self.cur_len as u8;
                    self.cur_sym += 1;
                } else if bs.grab(1) == 0 {
                    self.cur_len += 1;
                } else {
                    self.cur_len -= 1;
                }
            }
            self.cur_group += 1;
            self.len_seeded = false;
        }

        let mut groups = Vec::with_capacity(self.n_groups);
        for g in 0..self.n_groups {
            groups.push(HuffGroup::build(&self.lens[g][..self.alpha_size]));
        }
        self.groups = groups;
        self.sel_idx = 0;
        self.group_pos = 0;
        self.mtf = (0..self.seq_to_unseq.len()).map(|v| v as u8).collect();
        self.run_len = 0;
        self.run_shift = 0;
        self.block = Vec::with_capacity(self.max_block.min(1 << 20));
        self.stage = Stage::Symbols;
        Ok(false)
    }

    /// The Huffman symbol stream: RUNA/RUNB runs of the front symbol,
    /// move-to-front indices, terminated by the end-of-block symbol.
    fn read_symbols(
        &mut self,
        bs: &mut Bitstream,
        cursor: &InputCursor,
    ) -> Result<bool, DecodeError> {
        loop {
            // Worst case one symbol needs 20 bits plus the over-long probe
            // that flags corrupt data.
            if !cursor.ensure(bs, 21)? {
                return Ok(true);
            }
            let sym = self.next_symbol(bs)?;

            if sym <= RUN_B {
                self.run_len += u64::from(sym + 1) << self.run_shift;
                self.run_shift += 1;
                if self.run_len > self.max_block as u64 {
                    return Err(DecodeError::InvalidBlockHeader("run longer than block"));
                }
                continue;
            }

            if self.run_len > 0 {
                self.flush_run()?;
            }

            if sym as usize == self.alpha_size - 1 {
                if self.block.is_empty() {
                    return Err(DecodeError::InvalidBlockHeader("empty block"));
                }
                if self.orig_ptr as usize >= self.block.len() {
                    return Err(DecodeError::InvalidBlockHeader("origin pointer out of range"));
                }
                self.stage = Stage::Complete;
                return Ok(false);
            }

            let idx = (sym - 1) as usize;
            let front = self.mtf[idx];
            self.mtf.copy_within(0..idx, 1);
            self.mtf[0] = front;
            let byte = self.seq_to_unseq[front as usize];
            if self.block.len() >= self.max_block {
                return Err(DecodeError::InvalidBlockHeader("block overrun"));
            }
            self.freq[byte as usize] += 1;
            self.block.push(byte);
        }
    }

    fn flush_run(&mut self) -> Result<(), DecodeError> {
        let run = self.run_len as usize;
        let byte = self.seq_to_unseq[self.mtf[0] as usize];
        if self.block.len() + run > self.max_block {
            return Err(DecodeError::InvalidBlockHeader("block overrun"));
        }
        self.freq[byte as usize] += run as u32;
        self.block.resize(self.block.len() + run, byte);
        self.run_len = 0;
        self.run_shift = 0;
        Ok(())
    }

    fn next_symbol(&mut self, bs: &mut Bitstream) -> Result<u16, DecodeError> {
        if self.group_pos == 0 {
            if self.sel_idx >= self.selectors.len() {
                return Err(DecodeError::InvalidBlockHeader("selector overrun"));
            }
            self.active_group = self.selectors[self.sel_idx] as usize;
            self.sel_idx += 1;
            self.group_pos = GROUP_SIZE;
        }
        self.group_pos -= 1;

        let group = &self.groups[self.active_group];
        let mut zn = group.min_len;
        let mut zvec = bs.peek(zn) as i32;
        loop {
            if zn > 20 {
                return Err(DecodeError::InvalidBlockHeader("corrupt huffman code"));
            }
            if zvec <= group.limit[zn as usize] {
                break;
            }
            zn += 1;
            zvec = bs.peek(zn) as i32;
        }
        bs.dump(zn);
        let offset = zvec - group.base[zn as usize];
        if offset < 0 || offset as usize >= self.alpha_size {
            return Err(DecodeError::InvalidBlockHeader("corrupt huffman code"));
        }
        Ok(group.perm[offset as usize])
    }

    /// Inverse Burrows-Wheeler transform. Purely CPU-bound; the input
    /// buffers are released once the permutation walk is done.
    pub fn decode(&mut self) {
        debug_assert_eq!(self.stage, Stage::Complete);
        let n = self.block.len();

        let mut cftab = [0u32; 256];
        let mut sum = 0u32;
        for (slot, &count) in cftab.iter_mut().zip(self.freq.iter()) {
            *slot = sum;
            sum += count;
        }

        let mut next = vec![0u32; n];
        for (i, &byte) in self.block.iter().enumerate() {
            let slot = &mut cftab[byte as usize];
            next[*slot as usize] = i as u32;
            *slot += 1;
        }

        let mut out = Vec::with_capacity(n);
        let mut p = next[self.orig_ptr as usize];
        for _ in 0..n {
            out.push(self.block[p as usize]);
            p = next[p as usize];
        }

        self.ibwt = out;
        self.block = Vec::new();
    }

    /// Expand the final run-length layer and produce the plain bytes with
    /// their checksum. The output can legitimately exceed the nominal block
    /// capacity (a run byte covers up to 259 source bytes), so it grows as
    /// needed.
    pub fn emit(&mut self) -> Result<(Vec<u8>, u32), DecodeError> {
        let data = std::mem::take(&mut self.ibwt);
        let mut out = Vec::with_capacity(data.len() + data.len() / 2);
        let mut crc = u32::MAX;
        let mut i = 0;
        while i < data.len() {
            let byte = data[i];
            let mut run = 1;
            while run < 4 && i + run < data.len() && data[i + run] == byte {
                run += 1;
            }
            let total = if run == 4 {
                match data.get(i + 4) {
                    Some(&extra) => 4 + extra as usize,
                    None => return Err(DecodeError::InvalidBlockHeader("truncated run")),
                }
            } else {
                run
            };
            i += if run == 4 { 5 } else { run };
            out.resize(out.len() + total, byte);
            for _ in 0..total {
                crc = crc_update(crc, byte);
            }
        }
        Ok((out, !crc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::StreamHeader;
    use crate::input::ByteSource;
    use crate::parser::{BlockParser, ParseEvent};
    use std::io::Cursor;

    const HELLO_BZ2: [u8; 56] = [
        66, 90, 104, 57, 49, 65, 89, 38, 83, 89, 216, 114, 1, 47, 0, 0, 1, 87, 128, 0, 16, 64, 0,
        0, 64, 0, 128, 6, 4, 144, 0, 32, 0, 34, 6, 134, 212, 32, 201, 136, 199, 105, 232, 40, 31,
        139, 185, 34, 156, 40, 72, 108, 57, 0, 151, 128,
    ];

    fn crc_all(data: &[u8]) -> u32 {
        !data.iter().fold(u32::MAX, |crc, &b| crc_update(crc, b))
    }

    #[test]
    fn checksum_matches_the_reference_block_header() {
        // The declared checksum of the reference block for this payload.
        assert_eq!(crc_all(b"Hello World\n"), 0xD872_012F);
    }

    #[test]
    fn checksum_is_order_sensitive() {
        assert_ne!(crc_all(b"Hello World\n"), crc_all(b"World Hello\n"));
    }

    /// Full single-block walk: header, parse, retrieve with 1-byte chunks,
    /// decode, emit.
    #[test]
    fn decodes_the_reference_block() {
        let mut source = ByteSource::new(Cursor::new(HELLO_BZ2.to_vec()), 1);
        let mut cursor = crate::input::InputCursor::new();
        let mut bs = Bitstream::new();
        let header = loop {
            match StreamHeader::read(&mut bs, &cursor).unwrap() {
                Some(h) => break h,
                None => cursor.more(&mut bs, &mut source).unwrap(),
            }
        };
        assert_eq!(header.level(), 9);

        let mut parser = BlockParser::new(&header);
        let head = loop {
            match parser.step(&mut bs, &cursor).unwrap() {
                ParseEvent::NeedMore => cursor.more(&mut bs, &mut source).unwrap(),
                ParseEvent::Block(head) => break head,
                ParseEvent::Finished => panic!("no block found"),
            }
        };

        let mut engine = BlockDecoder::new(header.max_block_size());
        while engine.retrieve(&mut bs, &cursor).unwrap() {
            cursor.more(&mut bs, &mut source).unwrap();
        }
        engine.decode();
        let (payload, crc) = engine.emit().unwrap();
        assert_eq!(payload, b"Hello World\n");
        assert_eq!(crc, head.crc);

        // The cursor must be parked exactly on the end-of-stream marker.
        let finished = loop {
            match parser.step(&mut bs, &cursor).unwrap() {
                ParseEvent::NeedMore => cursor.more(&mut bs, &mut source).unwrap(),
                other => break other,
            }
        };
        assert!(matches!(finished, ParseEvent::Finished));
    }
}
