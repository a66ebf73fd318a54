//! Per-direction reassembled byte stream.
//!
//! The assembler owns the producer half ([`ReassemblyStream`]) and feeds it
//! raw segments in arrival order; the consumer task owns the reader half
//! ([`StreamReader`]) and observes bytes in strict sequence order. The two
//! halves communicate through a bounded queue: when the consumer lags
//! behind, the oldest queued chunk is evicted so live capture never blocks
//! on a slow reader.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::tcp::{seq_before, Segment};

/// In-order byte run delivered to the reader, tagged with the segment that
/// produced it.
struct Chunk {
    bytes: Vec<u8>,
    uuid: Uuid,
    timestamp: DateTime<Utc>,
}

struct Queue {
    chunks: VecDeque<Chunk>,
    closed: bool,
    dropped: u64,
    overflow_warned: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
    label: String,
}

impl Shared {
    fn close(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Create the two halves of a reassembly stream with the given queue depth.
pub fn stream_pair(label: String, capacity: usize) -> (ReassemblyStream, StreamReader) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            chunks: VecDeque::new(),
            closed: false,
            dropped: 0,
            overflow_warned: false,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
        label,
    });

    let stream = ReassemblyStream {
        shared: Arc::clone(&shared),
        origin: None,
        expected: 0,
        buffered: BTreeMap::new(),
        fin_offset: None,
        closed: false,
        last_activity: Utc::now(),
    };

    let reader = StreamReader {
        shared,
        current: None,
        pos: 0,
        last_uuid: None,
        last_timestamp: None,
    };

    (stream, reader)
}

/// Producer half: reorders segments by sequence number and emits in-order
/// chunks to the reader.
///
/// Offsets are kept relative to the initial sequence number so 32-bit
/// wrap-around inside a session is handled transparently.
pub struct ReassemblyStream {
    shared: Arc<Shared>,
    /// Initial sequence number; first deliverable byte is offset 0 from it.
    origin: Option<u32>,
    /// Relative offset of the next byte to deliver.
    expected: u64,
    /// Out-of-order segments keyed by relative offset.
    buffered: BTreeMap<u64, Segment>,
    /// Relative offset at which FIN takes effect, once no gap precedes it.
    fin_offset: Option<u64>,
    closed: bool,
    last_activity: DateTime<Utc>,
}

impl ReassemblyStream {
    pub fn push(&mut self, segment: Segment) {
        if self.closed {
            return;
        }

        self.last_activity = segment.timestamp;

        if segment.rst {
            self.close();
            return;
        }

        let origin = match self.origin {
            Some(origin) => origin,
            None => {
                // SYN consumes one sequence number; data starts right after.
                let origin = if segment.syn {
                    segment.seq.wrapping_add(1)
                } else {
                    segment.seq
                };
                self.origin = Some(origin);
                origin
            }
        };

        if seq_before(segment.seq, origin) {
            // Stale retransmission predating the sequence number we
            // anchored on.
            return;
        }
        let rel = u64::from(segment.seq.wrapping_sub(origin));
        let end = rel + segment.payload.len() as u64;

        if segment.fin {
            self.fin_offset = Some(end);
        }

        if !segment.payload.is_empty() {
            if end <= self.expected {
                // Full duplicate.
            } else if rel <= self.expected {
                let skip = (self.expected - rel) as usize;
                self.emit(&segment.payload[skip..], segment.uuid, segment.timestamp);
                self.expected = end;
                self.drain_buffered();
            } else {
                // Keep the longer of two segments landing on the same offset.
                match self.buffered.get(&rel) {
                    Some(existing) if existing.payload.len() >= segment.payload.len() => {}
                    _ => {
                        self.buffered.insert(rel, segment);
                    }
                }
            }
        }

        self.try_finish();
    }

    fn drain_buffered(&mut self) {
        while let Some(entry) = self.buffered.first_entry() {
            let rel = *entry.key();
            if rel > self.expected {
                break;
            }

            let segment = entry.remove();
            let end = rel + segment.payload.len() as u64;
            if end <= self.expected {
                continue;
            }

            let skip = (self.expected - rel) as usize;
            self.emit(&segment.payload[skip..], segment.uuid, segment.timestamp);
            self.expected = end;
        }
    }

    fn try_finish(&mut self) {
        if matches!(self.fin_offset, Some(fin) if self.expected >= fin) {
            self.close();
        }
    }

    fn emit(&self, bytes: &[u8], uuid: Uuid, timestamp: DateTime<Utc>) {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return;
        }

        if queue.chunks.len() >= self.shared.capacity {
            queue.chunks.pop_front();
            queue.dropped += 1;
            if !queue.overflow_warned {
                queue.overflow_warned = true;
                warn!(stream = %self.shared.label, "Stream buffer full, dropping oldest data");
            }
        }

        queue.chunks.push_back(Chunk {
            bytes: bytes.to_vec(),
            uuid,
            timestamp,
        });
        drop(queue);

        self.shared.notify.notify_one();
    }

    /// Close the stream, discarding any segments still stuck behind a gap.
    ///
    /// The reader drains what was already delivered and then observes EOF.
    /// Idempotent; used for FIN/RST completion, idle eviction and shutdown.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buffered.clear();
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }
}

/// Consumer half: a blocking byte reader over the in-order chunk queue.
pub struct StreamReader {
    shared: Arc<Shared>,
    current: Option<Chunk>,
    pos: usize,
    last_uuid: Option<Uuid>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StreamReader {
    /// Read up to `buf.len()` bytes, waiting until at least one byte is
    /// deliverable. Returns 0 once the stream is closed and drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        loop {
            if let Some(chunk) = &self.current {
                let remaining = &chunk.bytes[self.pos..];
                if !remaining.is_empty() {
                    let n = buf.len().min(remaining.len());
                    buf[..n].copy_from_slice(&remaining[..n]);
                    self.pos += n;
                    return n;
                }
                self.current = None;
            }

            if !self.fetch().await {
                return 0;
            }
        }
    }

    pub async fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte).await {
            0 => None,
            _ => Some(byte[0]),
        }
    }

    /// Discard everything up to EOF and return the number of bytes dropped.
    pub async fn drain(&mut self) -> u64 {
        let mut scratch = [0u8; 4096];
        let mut total = 0u64;
        loop {
            match self.read(&mut scratch).await {
                0 => return total,
                n => total += n as u64,
            }
        }
    }

    async fn fetch(&mut self) -> bool {
        loop {
            {
                let mut queue = self.shared.queue.lock();
                if let Some(chunk) = queue.chunks.pop_front() {
                    self.last_uuid = Some(chunk.uuid);
                    self.last_timestamp = Some(chunk.timestamp);
                    self.current = Some(chunk);
                    self.pos = 0;
                    return true;
                }
                if queue.closed {
                    return false;
                }
            }

            self.shared.notify.notified().await;
        }
    }

    /// Identifier of the segment that produced the most recently read byte.
    pub fn last_uuid(&self) -> Option<Uuid> {
        self.last_uuid
    }

    /// Capture timestamp of the segment that produced the most recently
    /// read byte; approximates the wall-clock start of the message being
    /// parsed.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    /// Stop accepting new data; the producer silently discards from here on.
    pub fn close(&self) {
        self.shared.close();
    }
}
