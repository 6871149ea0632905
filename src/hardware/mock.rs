//! Mock hardware for tests and host-side bring-up.
//!
//! [`MockDacBus`] simulates the serial transfer engine in two modes:
//! manually scripted (tests push completion events and inject faults)
//! or clock-paced (virtual DMA progress derived from elapsed ticks and
//! the configured timer division, with optional random error
//! injection). [`SimFlash`] is a memory-mapped flash image with NOR
//! semantics. Both record enough of what the core did to assert the
//! contracts the real drivers rely on — most importantly that no buffer
//! half is ever written while it is in flight.

use crate::engine::timer::TimerDivision;
use crate::error::{BusError, FlashError};
use crate::hardware::{BufferHalf, DacBus, TickClock, TransferEvent, WaveFlash};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

// =============================================================================
// MockDacBus
// =============================================================================

struct Pacing {
    clock: Arc<dyn TickClock>,
    timer_clock_hz: u32,
    started_at: u32,
    error_rate: f64,
    rng: StdRng,
}

#[derive(Default)]
struct BusInner {
    pacing: Option<Pacing>,
    events: VecDeque<TransferEvent>,
    streaming: bool,
    frozen: bool,
    total_words: u64,
    division: Option<TimerDivision>,
    words_per_tick: u32,
    words_transferred: u64,
    next_boundary: u64,
    in_flight: Option<BufferHalf>,
    frames_sent: Vec<u32>,
    frame_failures_remaining: u32,
    fail_begin_stream: bool,
    resets: u32,
    flush_violations: u32,
    flushes: Vec<(BufferHalf, usize)>,
    last_flushes: [Option<Vec<u32>>; 2],
}

/// Simulated serial DAC transfer engine.
///
/// Cloning yields another handle onto the same simulated device, so a
/// test can keep one handle while the engine owns the other.
#[derive(Clone, Default)]
pub struct MockDacBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MockDacBus {
    /// A manually scripted bus: nothing happens until the test calls
    /// [`complete_half`](Self::complete_half) /
    /// [`complete_full`](Self::complete_full) /
    /// [`inject_error`](Self::inject_error).
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock-paced bus: virtual transfer progress follows elapsed
    /// ticks at the rate the [`TimerDivision`] produces from
    /// `timer_clock_hz`, raising half/full completion events as the
    /// virtual DMA crosses buffer boundaries.
    pub fn paced(clock: Arc<dyn TickClock>, timer_clock_hz: u32) -> Self {
        let bus = Self::default();
        bus.inner.lock().pacing = Some(Pacing {
            clock,
            timer_clock_hz,
            started_at: 0,
            error_rate: 0.0,
            rng: StdRng::seed_from_u64(0x5EED),
        });
        bus
    }

    /// Probability of an injected [`TransferEvent::Error`] per completed
    /// buffer half (clock-paced mode only).
    pub fn with_error_rate(self, error_rate: f64) -> Self {
        if let Some(pacing) = self.inner.lock().pacing.as_mut() {
            pacing.error_rate = error_rate;
        }
        self
    }

    /// Mark the first half sent: it becomes free while the second half
    /// goes in flight.
    pub fn complete_half(&self) {
        let mut inner = self.inner.lock();
        inner.words_transferred += inner.total_words / 2;
        inner.in_flight = Some(BufferHalf::Second);
        inner.events.push_back(TransferEvent::HalfComplete);
    }

    /// Mark the second half sent: the transfer wraps and the first half
    /// goes back in flight.
    pub fn complete_full(&self) {
        let mut inner = self.inner.lock();
        inner.words_transferred += inner.total_words / 2;
        inner.in_flight = Some(BufferHalf::First);
        inner.events.push_back(TransferEvent::FullComplete);
    }

    /// Queue a transfer-error event.
    pub fn inject_error(&self) {
        self.inner.lock().events.push_back(TransferEvent::Error);
    }

    /// Make the next `count` single-frame transmits fail.
    pub fn fail_next_frames(&self, count: u32) {
        self.inner.lock().frame_failures_remaining = count;
    }

    /// Make `begin_stream` fail until cleared.
    pub fn set_fail_begin_stream(&self, fail: bool) {
        self.inner.lock().fail_begin_stream = fail;
    }

    /// Halt virtual transfer progress (clock-paced mode), simulating a
    /// stalled transfer engine.
    pub fn freeze(&self, frozen: bool) {
        self.inner.lock().frozen = frozen;
    }

    /// Bus resets observed so far.
    pub fn resets(&self) -> u32 {
        self.inner.lock().resets
    }

    /// Every frame accepted by [`DacBus::send_frame`], in order.
    pub fn frames_sent(&self) -> Vec<u32> {
        self.inner.lock().frames_sent.clone()
    }

    /// Times a half was flushed while it was in flight. Must stay zero.
    pub fn flush_violations(&self) -> u32 {
        self.inner.lock().flush_violations
    }

    /// Log of every flush: which half and how many words.
    pub fn flushes(&self) -> Vec<(BufferHalf, usize)> {
        self.inner.lock().flushes.clone()
    }

    /// Contents of the most recent flush into `half`.
    pub fn last_flush(&self, half: BufferHalf) -> Option<Vec<u32>> {
        let index = match half {
            BufferHalf::First => 0,
            BufferHalf::Second => 1,
        };
        self.inner.lock().last_flushes[index].clone()
    }

    /// First word of the most recent flush into `half`.
    pub fn first_word(&self, half: BufferHalf) -> Option<u32> {
        self.last_flush(half).and_then(|words| words.first().copied())
    }

    /// Whether a circular transfer is active.
    pub fn is_streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    /// The timer division supplied to the active stream.
    pub fn division(&self) -> Option<TimerDivision> {
        self.inner.lock().division
    }

    fn advance(inner: &mut BusInner) {
        if !inner.streaming || inner.frozen || inner.total_words == 0 {
            return;
        }
        let Some(pacing) = inner.pacing.as_mut() else {
            return;
        };

        let elapsed_ms = pacing
            .clock
            .ticks_ms()
            .wrapping_sub(pacing.started_at) as u64;
        let tick_hz = inner
            .division
            .map(|d| d.achieved_hz(pacing.timer_clock_hz))
            .unwrap_or_default();
        let words_per_ms = tick_hz * f64::from(inner.words_per_tick) / 1000.0;
        let target = (elapsed_ms as f64 * words_per_ms) as u64;

        let half_words = inner.total_words / 2;
        while target >= inner.next_boundary {
            let boundary_index = inner.next_boundary / half_words;
            if boundary_index % 2 == 1 {
                inner.in_flight = Some(BufferHalf::Second);
                inner.events.push_back(TransferEvent::HalfComplete);
            } else {
                inner.in_flight = Some(BufferHalf::First);
                inner.events.push_back(TransferEvent::FullComplete);
            }
            if pacing.error_rate > 0.0 && pacing.rng.gen::<f64>() < pacing.error_rate {
                inner.events.push_back(TransferEvent::Error);
            }
            inner.next_boundary += half_words;
        }
        inner.words_transferred = target;
    }
}

impl DacBus for MockDacBus {
    fn send_frame(&mut self, frame: u32) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        if inner.frame_failures_remaining > 0 {
            inner.frame_failures_remaining -= 1;
            return Err(BusError::TransmitFailed);
        }
        inner.frames_sent.push(frame);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), BusError> {
        self.inner.lock().resets += 1;
        Ok(())
    }

    fn begin_stream(
        &mut self,
        total_words: usize,
        words_per_tick: u32,
        division: TimerDivision,
    ) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        if inner.fail_begin_stream {
            return Err(BusError::ConfigRejected("simulated begin failure"));
        }
        if total_words == 0 || total_words % 2 != 0 {
            return Err(BusError::ConfigRejected("total_words must be even"));
        }
        inner.streaming = true;
        inner.total_words = total_words as u64;
        inner.words_per_tick = words_per_tick;
        inner.division = Some(division);
        inner.words_transferred = 0;
        inner.next_boundary = total_words as u64 / 2;
        inner.in_flight = Some(BufferHalf::First);
        if let Some(pacing) = inner.pacing.as_mut() {
            pacing.started_at = pacing.clock.ticks_ms();
        }
        Ok(())
    }

    fn end_stream(&mut self) {
        let mut inner = self.inner.lock();
        inner.streaming = false;
        inner.in_flight = None;
        inner.events.clear();
    }

    fn poll_event(&mut self) -> Option<TransferEvent> {
        let mut inner = self.inner.lock();
        Self::advance(&mut inner);
        inner.events.pop_front()
    }

    fn flush_half(&mut self, half: BufferHalf, words: &[u32]) {
        let mut inner = self.inner.lock();
        if inner.streaming && inner.in_flight == Some(half) {
            inner.flush_violations += 1;
        }
        let index = match half {
            BufferHalf::First => 0,
            BufferHalf::Second => 1,
        };
        inner.last_flushes[index] = Some(words.to_vec());
        inner.flushes.push((half, words.len()));
    }

    fn words_transferred(&self) -> u64 {
        let mut inner = self.inner.lock();
        Self::advance(&mut inner);
        inner.words_transferred
    }
}

// =============================================================================
// SimFlash
// =============================================================================

/// Simulated waveform flash backed by a memory-mapped image file.
///
/// Models the device semantics the store relies on: erase granularity,
/// program-only-clears-bits (NOR), and the mapped window being readable
/// only while memory-mapped mode is active. The image persists across
/// runs, so load-from-flash boot paths can be exercised end to end.
pub struct SimFlash {
    mmap: MmapMut,
    capacity: u32,
    erase_unit: u32,
    memory_mapped: bool,
    fail_erase: bool,
    fail_program: bool,
    fail_read: bool,
}

impl SimFlash {
    /// Open (or create) a flash image of `capacity` bytes. A brand-new
    /// image starts fully erased (all 0xFF).
    pub fn open(path: &Path, capacity: u32, erase_unit: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let was_empty = file.metadata()?.len() == 0;
        file.set_len(u64::from(capacity))?;

        // SAFETY: the file was just sized to `capacity` bytes and the
        // mapping lives as long as `self`; this process creates no other
        // mapping of the file.
        #[allow(unsafe_code)]
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        if was_empty {
            mmap.fill(0xFF);
        }

        Ok(Self {
            mmap,
            capacity,
            erase_unit,
            memory_mapped: false,
            fail_erase: false,
            fail_program: false,
            fail_read: false,
        })
    }

    /// Force subsequent erases to fail.
    pub fn set_fail_erase(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    /// Force subsequent programs to fail.
    pub fn set_fail_program(&mut self, fail: bool) {
        self.fail_program = fail;
    }

    /// Force subsequent reads to fail.
    pub fn set_fail_read(&mut self, fail: bool) {
        self.fail_read = fail;
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), FlashError> {
        let end = u64::from(offset) + len as u64;
        if end > u64::from(self.capacity) {
            return Err(FlashError::OutOfBounds { offset, len });
        }
        Ok(())
    }
}

impl WaveFlash for SimFlash {
    fn erase_block(&mut self, offset: u32) -> Result<(), FlashError> {
        if self.memory_mapped {
            return Err(FlashError::MemoryMap);
        }
        if self.fail_erase {
            return Err(FlashError::Erase { offset });
        }
        self.check_range(offset, self.erase_unit as usize)?;
        let start = offset as usize;
        self.mmap[start..start + self.erase_unit as usize].fill(0xFF);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.memory_mapped {
            return Err(FlashError::MemoryMap);
        }
        if self.fail_program {
            return Err(FlashError::Program { offset });
        }
        self.check_range(offset, data.len())?;
        let start = offset as usize;
        // NOR programming can only clear bits.
        for (dst, &src) in self.mmap[start..start + data.len()].iter_mut().zip(data) {
            *dst &= src;
        }
        Ok(())
    }

    fn read(&mut self, offset: u32, out: &mut [u8]) -> Result<(), FlashError> {
        if self.memory_mapped {
            return Err(FlashError::MemoryMap);
        }
        if self.fail_read {
            return Err(FlashError::Read { offset });
        }
        self.check_range(offset, out.len())?;
        let start = offset as usize;
        out.copy_from_slice(&self.mmap[start..start + out.len()]);
        Ok(())
    }

    fn enter_memory_mapped(&mut self) -> Result<(), FlashError> {
        self.memory_mapped = true;
        Ok(())
    }

    fn exit_memory_mapped(&mut self) -> Result<(), FlashError> {
        self.memory_mapped = false;
        Ok(())
    }

    fn mapped(&self) -> Option<&[u8]> {
        self.memory_mapped.then_some(&self.mmap[..])
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }
}

// =============================================================================
// Clocks
// =============================================================================

/// Wall-clock tick source.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// A clock starting at tick zero.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for SystemClock {
    fn ticks_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// Test clock advanced explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU32,
}

impl ManualClock {
    /// A clock frozen at tick zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance(&self, ms: u32) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute tick.
    pub fn set(&self, ms: u32) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl TickClock for ManualClock {
    fn ticks_ms(&self) -> u32 {
        self.ms.load(Ordering::SeqCst)
    }
}
