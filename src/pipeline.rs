//! Order-preserving parallel decode pipeline.
//!
//! One producer thread owns the input: it validates the stream header,
//! drives the boundary parser, and runs each block's `retrieve` phase (the
//! only phase that touches the shared cursor). Every completed retrieve
//! yields a self-contained [`BlockDecoder`] that is handed to a Rayon worker
//! for the CPU-heavy `decode` + `emit` + checksum comparison.
//!
//! Ordering and memory bounds both come from a single structure: a bounded
//! channel of per-block result slots. The producer enqueues a slot receiver
//! per block *in discovery order* and blocks when `max_in_flight` slots are
//! unconsumed — that blocking send is the backpressure point, so at most K
//! completed-but-undelivered blocks ever sit in memory no matter how slow
//! the consumer is. The assembler dequeues FIFO and waits on each slot, so
//! output comes out in stream order even though workers finish in any
//! order.
//!
//! Dropping a [`ParallelDecoder`] cancels the pipeline: the producer stops
//! at its next enqueue, while decode work already running finishes and has
//! its result discarded.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::bitstream::Bitstream;
use crate::decoder::BlockDecoder;
use crate::error::DecodeError;
use crate::header::StreamHeader;
use crate::input::{ByteSource, InputCursor};
use crate::parser::{BlockParser, ParseEvent};

/// Tuning knobs for a decode session.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Bytes pulled from the underlying reader per I/O operation. Affects
    /// granularity only, never the decoded result.
    pub chunk_size: usize,
    /// Capacity K of the result queue: how many blocks may be buffered
    /// between decode and delivery. Larger values trade memory for
    /// smoother throughput. Clamped to at least 1.
    pub max_in_flight: usize,
    /// Decode worker threads. 0 uses the shared global pool (one thread
    /// per core).
    pub threads: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            chunk_size: 128 * 1024,
            max_in_flight: 4,
            threads: 0,
        }
    }
}

/// Counters kept by the pipeline, readable at any point.
#[derive(Debug, Default)]
pub struct PipelineStats {
    discovered: AtomicU64,
    completed: AtomicU64,
    delivered: AtomicU64,
    peak_buffered: AtomicUsize,
}

impl PipelineStats {
    /// Blocks announced by the parser so far.
    pub fn discovered(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }

    /// Blocks whose decode work has finished.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Blocks handed to the consumer.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// High-water mark of completed-but-undelivered blocks; never exceeds
    /// `max_in_flight`.
    pub fn peak_buffered(&self) -> usize {
        self.peak_buffered.load(Ordering::Relaxed)
    }

    fn mark_completed(&self) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let delivered = self.delivered.load(Ordering::Relaxed);
        let buffered = completed.saturating_sub(delivered) as usize;
        self.peak_buffered.fetch_max(buffered, Ordering::Relaxed);
    }

    fn mark_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

type BlockResult = Result<Vec<u8>, DecodeError>;

/// Streaming parallel decoder over any byte source.
///
/// Blocks come back through [`Self::next_block`] in stream order; the
/// [`Read`] implementation flattens them into a byte stream.
pub struct ParallelDecoder {
    slots: Option<Receiver<Receiver<BlockResult>>>,
    producer: Option<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl ParallelDecoder {
    pub fn new<R: Read + Send + 'static>(reader: R, options: DecodeOptions) -> Self {
        let capacity = options.max_in_flight.max(1);
        let (slot_tx, slot_rx) = bounded::<Receiver<BlockResult>>(capacity);
        let stats = Arc::new(PipelineStats::default());

        let pool = if options.threads > 0 {
            Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(options.threads)
                    .build()
                    .expect("build decode worker pool"),
            ))
        } else {
            None
        };

        let producer_stats = Arc::clone(&stats);
        let producer = thread::Builder::new()
            .name("parbz-producer".into())
            .spawn(move || {
                if let Err(err) = run_producer(reader, options, &slot_tx, &producer_stats, pool) {
                    tracing::debug!(error = %err, "pipeline failed");
                    let (tx, rx) = bounded(1);
                    let _ = tx.send(Err(err));
                    let _ = slot_tx.send(rx);
                }
            })
            .expect("spawn producer thread");

        Self {
            slots: Some(slot_rx),
            producer: Some(producer),
            stats,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Next block payload in stream order, or `None` once the stream is
    /// fully delivered. The first `Err` closes the pipeline: no further
    /// work is issued and subsequent calls return `None`.
    pub fn next_block(&mut self) -> Option<BlockResult> {
        let received = match self.slots.as_ref() {
            None => return None,
            Some(slots) => slots.recv(),
        };
        match received {
            Err(_) => {
                self.slots = None;
                None
            }
            Ok(slot) => {
                self.stats.mark_delivered();
                let result = slot.recv().unwrap_or_else(|_| {
                    Err(DecodeError::EngineInternalError("decode worker vanished"))
                });
                if result.is_err() {
                    self.slots = None;
                }
                Some(result)
            }
        }
    }

    /// Live pipeline counters.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }
}

impl Read for ParallelDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pending_pos < self.pending.len() {
                let n = buf.len().min(self.pending.len() - self.pending_pos);
                buf[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                return Ok(n);
            }
            match self.next_block() {
                None => return Ok(0),
                Some(Ok(payload)) => {
                    self.pending = payload;
                    self.pending_pos = 0;
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}

impl Drop for ParallelDecoder {
    fn drop(&mut self) {
        // Closing the queue is the cancellation request: the producer's
        // next enqueue fails and it unwinds without issuing new work.
        self.slots.take();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}

/// Decode a whole stream from `reader` into `writer`, returning the number
/// of bytes written. Stops at the first error; bytes already written stay
/// written.
pub fn decompress<R, W>(reader: R, writer: &mut W, options: DecodeOptions) -> Result<u64, DecodeError>
where
    R: Read + Send + 'static,
    W: Write + ?Sized,
{
    let mut decoder = ParallelDecoder::new(reader, options);
    let mut total = 0u64;
    while let Some(block) = decoder.next_block() {
        let payload = block?;
        writer.write_all(&payload)?;
        total += payload.len() as u64;
    }
    Ok(total)
}

fn run_producer<R: Read>(
    reader: R,
    options: DecodeOptions,
    slot_tx: &Sender<Receiver<BlockResult>>,
    stats: &Arc<PipelineStats>,
    pool: Option<Arc<rayon::ThreadPool>>,
) -> Result<(), DecodeError> {
    let mut source = ByteSource::new(reader, options.chunk_size);
    let mut cursor = InputCursor::new();
    let mut bs = Bitstream::new();

    let header = loop {
        match StreamHeader::read(&mut bs, &cursor)? {
            Some(header) => break header,
            None => cursor.more(&mut bs, &mut source)?,
        }
    };
    tracing::debug!(level = header.level(), "validated stream header");

    let mut parser = BlockParser::new(&header);
    loop {
        match parser.step(&mut bs, &cursor)? {
            ParseEvent::NeedMore => cursor.more(&mut bs, &mut source)?,
            ParseEvent::Finished => break,
            ParseEvent::Block(head) => {
                let index = parser.blocks() - 1;
                let mut engine = BlockDecoder::new(header.max_block_size());
                while engine.retrieve(&mut bs, &cursor)? {
                    cursor.more(&mut bs, &mut source)?;
                }
                stats.discovered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(block = index, crc = head.crc, "dispatching block");

                let (tx, rx) = bounded::<BlockResult>(1);
                // Backpressure: blocks while `max_in_flight` slots are
                // unconsumed. An error means the consumer hung up.
                if slot_tx.send(rx).is_err() {
                    tracing::debug!(block = index, "consumer gone, cancelling");
                    return Ok(());
                }

                let worker_stats = Arc::clone(stats);
                let expected = head.crc;
                let task = move || {
                    engine.decode();
                    let result = engine.emit().and_then(|(payload, actual)| {
                        if actual == expected {
                            Ok(payload)
                        } else {
                            Err(DecodeError::BlockChecksumMismatch { expected, actual })
                        }
                    });
                    worker_stats.mark_completed();
                    let _ = tx.send(result);
                };
                match &pool {
                    Some(pool) => pool.spawn(task),
                    None => rayon::spawn(task),
                }
            }
        }
    }
    tracing::debug!(blocks = parser.blocks(), "stream finished");
    Ok(())
}
