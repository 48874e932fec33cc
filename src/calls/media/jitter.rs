//! Jitter buffer for reordering decrypted audio payloads.
//!
//! Payloads are keyed by stream sequence and released strictly in cursor
//! order. The buffer is the only ordering authority in the receive path; it
//! gives up on a gap rather than stalling when a packet lands too far ahead.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Configuration for the jitter buffer.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// First sequence number expected for playout.
    pub initial_sequence: u64,
    /// A push more than this far ahead of the cursor forces a forward jump.
    pub max_gap: u64,
    /// Maximum buffer size in packets.
    pub max_packets: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            initial_sequence: 1,
            max_gap: 5,
            max_packets: 50, // ~1 second at 20ms packets
        }
    }
}

/// A buffered payload with timing info.
#[derive(Debug)]
struct BufferedFrame {
    payload: Vec<u8>,
    received_at: Instant,
}

/// Result of [`JitterBuffer::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// Below the cursor; already played or skipped.
    Late,
    Duplicate,
    /// Buffer full and the payload is further ahead than anything held.
    Overflow,
}

/// Result of [`JitterBuffer::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playout {
    Frame { sequence: u64, payload: Vec<u8> },
    /// Nothing at the cursor. The cursor does not move.
    Underrun { expected: u64 },
}

/// Statistics about the jitter buffer.
#[derive(Debug, Clone, Default)]
pub struct JitterStats {
    /// Total payloads offered.
    pub packets_received: u64,
    /// Payloads played out.
    pub packets_played: u64,
    /// Payloads rejected as late.
    pub packets_late: u64,
    /// Payloads that were duplicates.
    pub packets_duplicate: u64,
    /// Sequence numbers given up on by forward jumps.
    pub packets_skipped: u64,
    /// Payloads refused or evicted because the buffer was full.
    pub packets_overflow: u64,
    /// Cursor positions filled from outside the buffer (FEC at underrun).
    pub packets_recovered: u64,
    /// Pulls that found nothing at the cursor.
    pub underruns: u64,
    /// Current buffer depth in packets.
    pub buffer_depth: usize,
    /// Mean time a played payload spent in the buffer, in milliseconds.
    pub average_wait_ms: f64,
}

/// Reordering buffer keyed by sequence number.
pub struct JitterBuffer {
    config: JitterBufferConfig,
    buffer: BTreeMap<u64, BufferedFrame>,
    /// Next sequence number to play.
    cursor: u64,
    stats: JitterStats,
    total_wait: Duration,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            cursor: config.initial_sequence,
            config,
            buffer: BTreeMap::new(),
            stats: JitterStats::default(),
            total_wait: Duration::ZERO,
        }
    }

    /// Offer a payload for playout.
    pub fn push(&mut self, sequence: u64, payload: Vec<u8>) -> PushOutcome {
        self.stats.packets_received += 1;

        if sequence < self.cursor {
            self.stats.packets_late += 1;
            return PushOutcome::Late;
        }
        if self.buffer.contains_key(&sequence) {
            self.stats.packets_duplicate += 1;
            return PushOutcome::Duplicate;
        }

        // Full: keep what is closest to the cursor.
        if self.buffer.len() >= self.config.max_packets {
            self.stats.packets_overflow += 1;
            match self.buffer.last_key_value() {
                Some((&newest, _)) if newest > sequence => {
                    self.buffer.remove(&newest);
                }
                _ => return PushOutcome::Overflow,
            }
        }

        self.buffer.insert(
            sequence,
            BufferedFrame {
                payload,
                received_at: Instant::now(),
            },
        );

        // Far ahead: abandon the gap and resume from the oldest buffered entry.
        if sequence - self.cursor > self.config.max_gap
            && let Some(&lowest) = self.buffer.keys().next()
        {
            self.advance_to(lowest);
        }

        self.stats.buffer_depth = self.buffer.len();
        PushOutcome::Buffered
    }

    /// Take the payload at the cursor.
    pub fn pull(&mut self) -> Playout {
        match self.buffer.remove(&self.cursor) {
            Some(frame) => {
                let sequence = self.cursor;
                self.cursor += 1;
                self.stats.packets_played += 1;
                self.total_wait += frame.received_at.elapsed();
                self.stats.average_wait_ms =
                    self.total_wait.as_secs_f64() * 1000.0 / self.stats.packets_played as f64;
                self.stats.buffer_depth = self.buffer.len();
                Playout::Frame {
                    sequence,
                    payload: frame.payload,
                }
            }
            None => {
                self.stats.underruns += 1;
                Playout::Underrun {
                    expected: self.cursor,
                }
            }
        }
    }

    /// Move the cursor forward, discarding anything left behind it.
    pub fn advance_to(&mut self, sequence: u64) {
        if sequence <= self.cursor {
            return;
        }
        self.stats.packets_skipped += sequence - self.cursor;
        self.buffer = self.buffer.split_off(&sequence);
        self.cursor = sequence;
        self.stats.buffer_depth = self.buffer.len();
    }

    /// The payload at the cursor was obtained elsewhere and played; step
    /// past it without counting a skip.
    pub fn mark_recovered(&mut self, sequence: u64) {
        if sequence != self.cursor {
            return;
        }
        self.buffer.remove(&sequence);
        self.cursor += 1;
        self.stats.packets_recovered += 1;
        self.stats.buffer_depth = self.buffer.len();
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Get buffer statistics.
    pub fn stats(&self) -> JitterStats {
        self.stats.clone()
    }

    pub fn depth(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Reset the buffer state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = self.config.initial_sequence;
        self.stats = JitterStats::default();
        self.total_wait = Duration::ZERO;
    }
}

impl std::fmt::Debug for JitterBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitterBuffer")
            .field("cursor", &self.cursor)
            .field("buffer_size", &self.buffer.len())
            .field("stats", &self.stats)
            .finish()
    }
}
