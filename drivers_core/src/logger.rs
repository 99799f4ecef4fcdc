//! An interrupt-safe logger.
//!
//! Records are formatted into fixed-size chunks on a lock-free queue. Whoever manages to take the
//! sink lock drains the queue, so a record logged from a fast service routine never waits for
//! the UART.
use core::{
    fmt::Write,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam::queue::ArrayQueue;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::run_level::RunLevel;

/// ANSI colors indexed by `Level as usize`: red, yellow, green, blue, magenta.
const LEVEL_COLORS: [u8; 6] = [0, 31, 33, 32, 34, 35];

/// Values printed at the start of every line.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stamp {
    /// Time counter when the record was made.
    pub counter: u64,
    /// Run level the record was made at.
    pub run_level: RunLevel,
}

/// Supplies the [`Stamp`] for each record.
pub trait LogStamp {
    /// Read the stamp for the current context. Called from any run level.
    fn stamp() -> Stamp;
}

/// Destination for formatted log output.
pub trait LogSink {
    /// Accept one chunk of a formatted record.
    fn accept(&mut self, chunk: &[u8]);
}

const CHUNK_SIZE: usize = 120;

struct Chunk {
    len: usize,
    data: [u8; CHUNK_SIZE],
}

impl Chunk {
    const fn empty() -> Self {
        Self {
            len: 0,
            data: [0; CHUNK_SIZE],
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Copy as much of `bytes` as fits, returning the rest.
    fn fill<'b>(&mut self, bytes: &'b [u8]) -> &'b [u8] {
        let count = (CHUNK_SIZE - self.len).min(bytes.len());
        self.data[self.len..self.len + count].copy_from_slice(&bytes[..count]);
        self.len += count;
        &bytes[count..]
    }
}

/// Logger generic over the output sink `S` and the stamp source `G`.
pub struct Logger<S, G> {
    queue: ArrayQueue<Chunk>,
    lost_chunks: AtomicUsize,
    console: Mutex<S>,
    max_level: LevelFilter,
    _stamp: PhantomData<fn() -> G>,
}

/// Chunks queued when the caller does not say otherwise, a 16KiB buffer.
pub const DEFAULT_CHUNK_COUNT: usize = 128;

impl<S: LogSink, G: LogStamp> Logger<S, G> {
    /// Create a logger holding up to `chunk_count` unflushed chunks.
    pub fn new(sink: S, max_level: LevelFilter, chunk_count: usize) -> Self {
        Self {
            queue: ArrayQueue::new(chunk_count.max(1)),
            lost_chunks: AtomicUsize::new(0),
            console: Mutex::new(sink),
            max_level,
            _stamp: PhantomData,
        }
    }

    /// Number of chunks dropped since the last flush.
    pub fn lost_chunks(&self) -> usize {
        self.lost_chunks.load(Ordering::Relaxed)
    }

    fn enqueue(&self, record: &Record) {
        let stamp = G::stamp();
        let mut writer = ChunkWriter {
            logger: self,
            chunk: Chunk::empty(),
        };
        // The writer never fails; lost chunks are counted instead.
        let _ = writeln!(
            &mut writer,
            "\x1b[{}m{:<5}\x1b[0m {}@{}| {} RL{} | {}",
            LEVEL_COLORS[record.level() as usize],
            record.level(),
            record.module_path().unwrap_or("unknown module"),
            record.line().unwrap_or(0),
            stamp.counter,
            stamp.run_level.0,
            record.args()
        );
        writer.push();
    }

    /// Send up to `limit` chunks to `console`, reporting lost chunks first.
    fn drain(&self, console: &mut S, limit: usize) {
        let lost = self.lost_chunks.swap(0, Ordering::Acquire);
        if lost > 0 {
            let mut notice = Chunk::empty();
            let _ = writeln!(
                Cursor(&mut notice),
                "\x1b[31mlog overflow! {lost} chunks lost\x1b[0m"
            );
            console.accept(notice.bytes());
        }
        core::iter::from_fn(|| self.queue.pop())
            .take(limit)
            .for_each(|chunk| console.accept(chunk.bytes()));
    }
}

impl<S: LogSink + Send, G: LogStamp> Log for Logger<S, G> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.enqueue(record);
        if let Some(mut console) = self.console.try_lock() {
            self.drain(&mut console, self.queue.capacity() / 3 + 1);
        }
    }

    fn flush(&self) {
        self.drain(&mut self.console.lock(), usize::MAX);
    }
}

/// Formats into a chunk and queues it each time it fills.
struct ChunkWriter<'a, S, G> {
    logger: &'a Logger<S, G>,
    chunk: Chunk,
}

impl<S, G> ChunkWriter<'_, S, G> {
    fn push(&mut self) {
        if self.chunk.len == 0 {
            return;
        }
        let chunk = core::mem::replace(&mut self.chunk, Chunk::empty());
        if self.logger.queue.push(chunk).is_err() {
            self.logger.lost_chunks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<S, G> Write for ChunkWriter<'_, S, G> {
    fn write_str(&mut self, text: &str) -> core::fmt::Result {
        let mut rest = text.as_bytes();
        loop {
            rest = self.chunk.fill(rest);
            if rest.is_empty() {
                return Ok(());
            }
            self.push();
        }
    }
}

/// Writes into a single chunk, truncating.
struct Cursor<'a>(&'a mut Chunk);

impl Write for Cursor<'_> {
    fn write_str(&mut self, text: &str) -> core::fmt::Result {
        self.0.fill(text.as_bytes());
        Ok(())
    }
}
