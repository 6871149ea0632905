//! Hardware device boundary.
//!
//! The streaming core talks to three trusted drivers through the traits
//! here: the serial DAC transfer engine ([`DacBus`]), the external
//! waveform flash ([`WaveFlash`]) and a monotonic millisecond tick
//! counter ([`TickClock`]). The traits document the guarantees the core
//! relies on; the real transaction-level implementations live outside
//! this crate. [`mock`] provides simulated implementations for tests and
//! host-side bring-up.

pub mod mock;

use crate::engine::timer::TimerDivision;
use crate::error::{BusError, FlashError};
use parking_lot::RwLock;
use std::sync::Arc;

/// Which half of the double buffer an event or flush refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferHalf {
    /// The first half (word 0 up to the midpoint).
    First,
    /// The second half (midpoint up to the end).
    Second,
}

/// Events raised by the transfer engine while a circular stream runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// The first half has been sent; it is free to refill while the
    /// second half is in flight.
    HalfComplete,
    /// The second half has been sent; the transfer wrapped to the start.
    FullComplete,
    /// The transfer engine reported an error. The stream keeps running;
    /// the health monitor decides whether to recover.
    Error,
}

/// The serial transfer engine feeding the multi-channel DAC.
///
/// Guarantees the core relies on:
/// - [`begin_stream`](DacBus::begin_stream) starts a circular transfer
///   over `total_words` words, releasing exactly `words_per_tick` words
///   per sample-timer tick, so the sample rate is set by the
///   [`TimerDivision`] alone.
/// - The two buffer halves are never read concurrently: between a
///   [`TransferEvent::HalfComplete`] and the following
///   [`TransferEvent::FullComplete`] only the second half is in flight,
///   and vice versa.
/// - [`words_transferred`](DacBus::words_transferred) is monotonic
///   within one stream session and resets on `begin_stream`.
pub trait DacBus {
    /// Transmit a single 32-bit frame, blocking until it is on the wire.
    fn send_frame(&mut self, frame: u32) -> Result<(), BusError>;

    /// Abort any in-flight transaction and reapply the bus configuration.
    fn reset(&mut self) -> Result<(), BusError>;

    /// Start a circular transfer of `total_words` words, gated to
    /// `words_per_tick` words per timer tick at the rate `division`
    /// produces.
    fn begin_stream(
        &mut self,
        total_words: usize,
        words_per_tick: u32,
        division: TimerDivision,
    ) -> Result<(), BusError>;

    /// Stop the circular transfer and the sample-rate timer.
    fn end_stream(&mut self);

    /// Drain the next pending transfer event, if any.
    fn poll_event(&mut self) -> Option<TransferEvent>;

    /// Hand a freshly filled buffer half to the transfer engine
    /// (cache maintenance, descriptor update — whatever the device
    /// needs before it reads the half).
    fn flush_half(&mut self, half: BufferHalf, words: &[u32]);

    /// Words sent since `begin_stream`, at sub-buffer resolution.
    fn words_transferred(&self) -> u64;
}

/// The external flash holding waveform partitions.
///
/// Transactional operations (`erase_block`, `program`, `read`) require
/// memory-mapped mode to be left first; [`mapped`](WaveFlash::mapped)
/// yields the read-only window only while memory-mapped mode is active.
/// Erase granularity and addressing live in
/// [`FlashLayout`](crate::config::FlashLayout).
pub trait WaveFlash: Send + Sync {
    /// Erase one erase-unit-sized block starting at `offset`.
    fn erase_block(&mut self, offset: u32) -> Result<(), FlashError>;

    /// Program `data` starting at `offset`. Programming can only clear
    /// bits; callers erase first.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read `out.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u32, out: &mut [u8]) -> Result<(), FlashError>;

    /// Switch the device into memory-mapped read mode.
    fn enter_memory_mapped(&mut self) -> Result<(), FlashError>;

    /// Leave memory-mapped mode so transactional operations work again.
    fn exit_memory_mapped(&mut self) -> Result<(), FlashError>;

    /// The full device contents as a read-only window, while
    /// memory-mapped mode is active.
    fn mapped(&self) -> Option<&[u8]>;

    /// Device capacity in bytes.
    fn capacity(&self) -> u32;
}

/// Shared handle to the waveform flash.
///
/// The partition store takes the write side during sync; the stream
/// engine takes brief read locks while filling from a mapped wave. All
/// sync-phase I/O happens while the stream is stopped, so the fill path
/// never contends with a writer.
pub type SharedFlash = Arc<RwLock<dyn WaveFlash>>;

/// Monotonic millisecond tick counter. Wraps at `u32::MAX`; consumers
/// use wraparound-safe signed differences.
pub trait TickClock: Send + Sync {
    /// Milliseconds since an arbitrary epoch.
    fn ticks_ms(&self) -> u32;
}

/// Wraparound-safe "a is at or after b" comparison of tick counts.
pub fn ticks_reached(now: u32, deadline: u32) -> bool {
    (deadline.wrapping_sub(now) as i32) <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_comparison_handles_wraparound() {
        assert!(ticks_reached(100, 100));
        assert!(ticks_reached(101, 100));
        assert!(!ticks_reached(99, 100));
        // Deadline just past the wrap point, now just before it.
        assert!(!ticks_reached(u32::MAX - 5, 10));
        assert!(ticks_reached(11, 10));
        assert!(ticks_reached(10, u32::MAX - 5));
    }
}
