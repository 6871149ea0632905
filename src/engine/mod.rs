//! Sample-stream engine.
//!
//! Keeps the serial transfer engine continuously fed with 4-channel
//! sample frames at the configured rate, switching between the
//! synthesized source and flash-resident waves without tearing, and
//! recovering autonomously from transient peripheral faults.
//!
//! # Execution contexts
//!
//! Two contexts touch the engine:
//!
//! - [`StreamEngine::pump_events`] drains transfer-complete events and
//!   runs the buffer-fill routine. On the target this work happens at
//!   interrupt priority; the fill path therefore never blocks and only
//!   touches the buffer half that just became free.
//! - [`StreamEngine::service`] runs on the owning task every few
//!   milliseconds: it watches transfer progress, requests the periodic
//!   reference refresh, and drives the stop/reset/restart recovery
//!   sequence when the transfer stalls or errors.
//!
//! Cross-context statistics are atomic counters; the double buffer needs
//! no lock because the hardware only ever reads the half that is not
//! being written (half/full-complete events are mutually exclusive in
//! time).

pub mod frame;
pub mod synth;
pub mod timer;

use crate::config::{EngineConfig, FlashLayout};
use crate::error::{BusError, StreamError};
use crate::hardware::{BufferHalf, DacBus, SharedFlash, TickClock, TransferEvent};
use crate::store::WaveInfo;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synth::SynthBank;
use timer::TimerDivision;
use tracing::{debug, info, warn};

/// Recovery-reason bit: the transfer engine reported an error.
pub const RECOVER_REASON_PERIPHERAL: u32 = 1 << 0;

/// Recovery-reason bit: transfer progress stagnated.
pub const RECOVER_REASON_STAGNANT: u32 = 1 << 1;

/// Where sample frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// LUT-driven synthesis.
    Synthesized,
    /// Memory-mapped flash-resident samples.
    FlashResident,
}

/// Cumulative transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Sample frames delivered to the transfer engine.
    pub ok: u32,
    /// Transfer errors plus failed configuration attempts.
    pub fail: u32,
    /// Frames filled from the synthesized fallback while a flash source
    /// was selected but unreadable.
    pub skip: u32,
}

/// Health-monitor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamHealth {
    /// Completed recovery cycles.
    pub recover_count: u32,
    /// Reasons of the most recent recovery (bitmask of
    /// [`RECOVER_REASON_PERIPHERAL`] / [`RECOVER_REASON_STAGNANT`]).
    pub recover_reason: u32,
    /// Successful internal-reference rearm transactions.
    pub ref_rearm_count: u32,
    /// Reference-refresh frames ridden on the stream.
    pub ref_refresh_count: u32,
    /// Consecutive stagnant windows observed so far.
    pub stagnant_count: u32,
}

/// Counters shared across execution contexts.
#[derive(Debug, Default)]
struct Counters {
    running: AtomicBool,
    sample_count: AtomicU32,
    fail: AtomicU32,
    skip: AtomicU32,
    recover_count: AtomicU32,
    recover_reason: AtomicU32,
    ref_rearm_count: AtomicU32,
    ref_refresh_count: AtomicU32,
    stagnant_count: AtomicU32,
    ref_refresh_pending: AtomicBool,
}

/// Active sample source.
#[derive(Debug, Clone, Copy)]
enum Source {
    Synth,
    Flash {
        addr: u32,
        sample_count: u32,
        index: u32,
        partition_id: u32,
    },
}

/// The sample-stream engine. One instance per process owns the double
/// buffer, the transfer engine and all stream state.
pub struct StreamEngine<B: DacBus> {
    bus: B,
    flash: SharedFlash,
    clock: Arc<dyn TickClock>,
    cfg: EngineConfig,
    layout: FlashLayout,
    synth: SynthBank,
    tx_buf: Vec<u32>,
    sample_rate_hz: u32,
    source: Source,
    counters: Arc<Counters>,
    service_last_tick: u32,
    service_last_samples: u32,
    service_last_fail: u32,
    last_ref_refresh_tick: u32,
}

impl<B: DacBus> StreamEngine<B> {
    /// Build an engine over the given devices. Call
    /// [`init`](Self::init) before [`start`](Self::start).
    pub fn new(
        bus: B,
        flash: SharedFlash,
        clock: Arc<dyn TickClock>,
        layout: FlashLayout,
        cfg: EngineConfig,
    ) -> Self {
        let sample_rate_hz = cfg.sample_rate_hz;
        let synth = SynthBank::new(&cfg.synth, sample_rate_hz);
        let tx_buf = vec![0u32; 2 * cfg.half_buffer_samples as usize * frame::WORDS_PER_SAMPLE];
        Self {
            bus,
            flash,
            clock,
            cfg,
            layout,
            synth,
            tx_buf,
            sample_rate_hz,
            source: Source::Synth,
            counters: Arc::new(Counters::default()),
            service_last_tick: 0,
            service_last_samples: 0,
            service_last_fail: 0,
            last_ref_refresh_tick: 0,
        }
    }

    /// Configure synthesis tables and reset-and-rearm the DAC. Does not
    /// start output; a rearm failure is survivable (the health monitor
    /// repeats the sequence on recovery) and is only logged.
    pub fn init(&mut self, sample_rate_hz: u32) {
        self.sample_rate_hz = if sample_rate_hz == 0 {
            self.cfg.sample_rate_hz
        } else {
            sample_rate_hz
        };
        self.synth.set_sample_rate(self.sample_rate_hz);
        self.synth.reset_phases();

        if let Err(err) = self.soft_reset_and_rearm() {
            warn!(%err, "dac init: reset-and-rearm failed");
        }
        info!(sample_rate_hz = self.sample_rate_hz, "dac engine initialized");
    }

    /// Start continuous output from the current source.
    ///
    /// Resets counters, prefills both buffer halves, and starts the
    /// timer-gated circular transfer (4 words per timer tick, one per
    /// channel). Fails closed: any configuration error increments the
    /// failure counter and leaves the stream stopped.
    pub fn start(&mut self) {
        self.counters.running.store(false, Ordering::SeqCst);
        self.bus.end_stream();
        if self.bus.reset().is_err() {
            self.counters.fail.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters.sample_count.store(0, Ordering::Relaxed);
        self.counters.skip.store(0, Ordering::Relaxed);
        if let Source::Flash { index, .. } = &mut self.source {
            *index = 0;
        }

        // Prefill both halves before the circular transfer starts, then
        // zero the counters again so prefill frames are not counted.
        self.fill_half(BufferHalf::First);
        self.fill_half(BufferHalf::Second);
        self.counters.sample_count.store(0, Ordering::Relaxed);
        self.counters.stagnant_count.store(0, Ordering::Relaxed);

        let division = TimerDivision::derive(self.cfg.timer_clock_hz, self.sample_rate_hz);
        if let Err(err) = self.bus.begin_stream(
            self.tx_buf.len(),
            frame::WORDS_PER_SAMPLE as u32,
            division,
        ) {
            self.counters.fail.fetch_add(1, Ordering::Relaxed);
            warn!(%err, "dac stream start failed");
            return;
        }

        self.counters.running.store(true, Ordering::SeqCst);
        self.counters.ref_refresh_pending.store(true, Ordering::SeqCst);
        self.service_last_samples = self.sample_counter();
        self.service_last_fail = self.counters.fail.load(Ordering::Relaxed);
        self.service_last_tick = self.clock.ticks_ms();
        self.last_ref_refresh_tick = self.service_last_tick;
        debug!(
            sample_rate_hz = self.sample_rate_hz,
            ?division,
            "dac stream started"
        );
    }

    /// Whether the circular transfer is currently running.
    pub fn is_running(&self) -> bool {
        self.counters.running.load(Ordering::SeqCst)
    }

    /// The active source mode.
    pub fn source_mode(&self) -> SourceMode {
        match self.source {
            Source::Synth => SourceMode::Synthesized,
            Source::Flash { .. } => SourceMode::FlashResident,
        }
    }

    /// Partition id of the active flash-resident wave, if any.
    pub fn active_partition(&self) -> Option<u32> {
        match self.source {
            Source::Synth => None,
            Source::Flash { partition_id, .. } => Some(partition_id),
        }
    }

    /// Switch the active source to a flash-resident wave.
    ///
    /// Rejects records outside the memory-mapped window or with no
    /// samples. If the stream is running it is stopped and restarted on
    /// the new source; the read index starts at zero either way. The
    /// timer keeps its configuration unless the record's rate differs.
    pub fn use_flash_wave(&mut self, wave: WaveInfo) -> Result<(), StreamError> {
        if !self.layout.contains_mapped(wave.source_address) {
            return Err(StreamError::AddressOutOfWindow {
                addr: wave.source_address,
            });
        }
        if wave.sample_count == 0 {
            return Err(StreamError::EmptyWave);
        }

        let was_running = self.is_running();
        if was_running {
            self.stop_transfer();
        }

        self.source = Source::Flash {
            addr: wave.source_address,
            sample_count: wave.sample_count,
            index: 0,
            partition_id: wave.partition_id,
        };
        if wave.sample_rate_hz != 0 && wave.sample_rate_hz != self.sample_rate_hz {
            self.sample_rate_hz = wave.sample_rate_hz;
            self.synth.set_sample_rate(self.sample_rate_hz);
        }

        info!(
            partition = wave.partition_id,
            addr = format_args!("{:#010x}", wave.source_address),
            samples = wave.sample_count,
            "source switched to flash wave"
        );
        if was_running {
            self.start();
        }
        Ok(())
    }

    /// Switch back to the LUT-driven synthesized source, with the same
    /// stop/restart semantics as [`use_flash_wave`](Self::use_flash_wave).
    pub fn use_synthesized_wave(&mut self) {
        let was_running = self.is_running();
        if was_running {
            self.stop_transfer();
        }
        self.source = Source::Synth;
        info!("source switched to synthesized waves");
        if was_running {
            self.start();
        }
    }

    /// Drive all four channels to one DC voltage. Only valid while the
    /// stream is stopped.
    pub fn output_fixed_voltage(&mut self, voltage: f32) -> Result<(), StreamError> {
        if self.is_running() {
            return Err(StreamError::StreamActive);
        }
        let code = synth::voltage_to_code(voltage);
        for channel in 0..frame::WORDS_PER_SAMPLE {
            self.bus.send_frame(frame::code_frame(channel, code))?;
        }
        Ok(())
    }

    /// Drain pending transfer events and refill freed buffer halves.
    ///
    /// Host-model stand-in for the interrupt-context fill routine; call
    /// it at least once per half-buffer period.
    pub fn pump_events(&mut self) {
        while let Some(event) = self.bus.poll_event() {
            match event {
                TransferEvent::Error => {
                    self.counters.fail.fetch_add(1, Ordering::Relaxed);
                }
                TransferEvent::HalfComplete if self.is_running() => {
                    self.fill_half(BufferHalf::First);
                }
                TransferEvent::FullComplete if self.is_running() => {
                    self.fill_half(BufferHalf::Second);
                }
                _ => {}
            }
        }
    }

    /// Periodic health check; never blocks. Call every ~5 ms from the
    /// owning task.
    ///
    /// Detects stagnation (no transfer progress across
    /// `stagnant_limit` consecutive windows) and peripheral errors, and
    /// runs the stop -> reset-and-rearm -> restart recovery for either.
    /// Also requests the periodic reference refresh, which the fill
    /// routine folds into the next transferred half.
    pub fn service(&mut self) {
        if !self.is_running() {
            return;
        }

        let now = self.clock.ticks_ms();
        let samples = self.sample_counter();
        let fails = self.counters.fail.load(Ordering::Relaxed);
        let mut reason = 0u32;

        if fails != self.service_last_fail {
            self.service_last_fail = fails;
            reason |= RECOVER_REASON_PERIPHERAL;
        }

        if samples == self.service_last_samples {
            if now.wrapping_sub(self.service_last_tick) >= self.cfg.stagnant_window_ms {
                self.service_last_tick = now;
                let windows = self.counters.stagnant_count.fetch_add(1, Ordering::Relaxed) + 1;
                if windows >= self.cfg.stagnant_limit {
                    reason |= RECOVER_REASON_STAGNANT;
                }
            }
        } else {
            self.service_last_samples = samples;
            self.service_last_tick = now;
            self.counters.stagnant_count.store(0, Ordering::Relaxed);
        }

        if now.wrapping_sub(self.last_ref_refresh_tick) >= self.cfg.ref_refresh_interval_ms {
            self.counters.ref_refresh_pending.store(true, Ordering::SeqCst);
            self.last_ref_refresh_tick = now;
        }

        if reason == 0 {
            return;
        }

        self.counters.recover_reason.store(reason, Ordering::Relaxed);
        self.counters.recover_count.fetch_add(1, Ordering::Relaxed);
        warn!(reason, samples, fails, "dac stream recovering");

        self.stop_transfer();
        if let Err(err) = self.soft_reset_and_rearm() {
            warn!(%err, "recovery reset-and-rearm failed");
        }
        self.start();
    }

    /// Cumulative transfer counters.
    pub fn get_stats(&self) -> StreamStats {
        StreamStats {
            ok: self.sample_counter(),
            fail: self.counters.fail.load(Ordering::Relaxed),
            skip: self.counters.skip.load(Ordering::Relaxed),
        }
    }

    /// Health-monitor counters.
    pub fn get_health(&self) -> StreamHealth {
        StreamHealth {
            recover_count: self.counters.recover_count.load(Ordering::Relaxed),
            recover_reason: self.counters.recover_reason.load(Ordering::Relaxed),
            ref_rearm_count: self.counters.ref_rearm_count.load(Ordering::Relaxed),
            ref_refresh_count: self.counters.ref_refresh_count.load(Ordering::Relaxed),
            stagnant_count: self.counters.stagnant_count.load(Ordering::Relaxed),
        }
    }

    /// Sample frames transferred so far, at sub-buffer resolution while
    /// the stream runs (derived from the transfer progress counter).
    fn sample_counter(&self) -> u32 {
        if self.is_running() {
            (self.bus.words_transferred() / frame::WORDS_PER_SAMPLE as u64) as u32
        } else {
            self.counters.sample_count.load(Ordering::Relaxed)
        }
    }

    fn stop_transfer(&mut self) {
        self.counters.running.store(false, Ordering::SeqCst);
        self.bus.end_stream();
        if let Err(err) = self.bus.reset() {
            debug!(%err, "bus reset after stop failed");
        }
    }

    /// Write `half_buffer_samples` frames into the half that just became
    /// free, then hand it to the transfer engine. A pending reference
    /// refresh replaces the first word so it rides the stream instead of
    /// needing an out-of-band transaction.
    fn fill_half(&mut self, half: BufferHalf) {
        let samples = self.cfg.half_buffer_samples as usize;
        let half_words = samples * frame::WORDS_PER_SAMPLE;
        let start = match half {
            BufferHalf::First => 0,
            BufferHalf::Second => half_words,
        };
        let end = start + half_words;

        let mut filled_from_flash = false;
        if let Source::Flash {
            addr,
            sample_count,
            index,
            ..
        } = &mut self.source
        {
            let flash = self.flash.read();
            if let Some(window) = flash.mapped() {
                let offset = addr.wrapping_sub(self.layout.mmap_base) as usize;
                let wave_bytes = *sample_count as usize * 8;
                if let Some(codes) = window.get(offset..offset + wave_bytes) {
                    let mut idx = *index;
                    for i in 0..samples {
                        let base = idx as usize * 8;
                        for ch in 0..frame::WORDS_PER_SAMPLE {
                            let code =
                                u16::from_le_bytes([codes[base + ch * 2], codes[base + ch * 2 + 1]]);
                            self.tx_buf[start + i * frame::WORDS_PER_SAMPLE + ch] =
                                frame::code_frame(ch, code);
                        }
                        idx += 1;
                        if idx >= *sample_count {
                            idx = 0;
                        }
                    }
                    *index = idx;
                    filled_from_flash = true;
                }
            }
        }

        if !filled_from_flash {
            if matches!(self.source, Source::Flash { .. }) {
                // Flash source selected but unreadable: fall back to
                // synthesis so the output never tears.
                self.counters.skip.fetch_add(samples as u32, Ordering::Relaxed);
            }
            for i in 0..samples {
                let codes = self.synth.next_codes();
                for ch in 0..frame::WORDS_PER_SAMPLE {
                    self.tx_buf[start + i * frame::WORDS_PER_SAMPLE + ch] =
                        frame::code_frame(ch, codes[ch]);
                }
            }
        }

        self.counters
            .sample_count
            .fetch_add(samples as u32, Ordering::Relaxed);

        if samples > 0 && self.counters.ref_refresh_pending.swap(false, Ordering::SeqCst) {
            self.tx_buf[start] = frame::INTERNAL_REF_ENABLE_FRAME;
            self.counters.ref_refresh_count.fetch_add(1, Ordering::Relaxed);
        }

        self.bus.flush_half(half, &self.tx_buf[start..end]);
    }

    fn send_frame_retry(&mut self, word: u32, retries: u32) -> Result<(), BusError> {
        for _ in 0..=retries {
            if self.bus.send_frame(word).is_ok() {
                return Ok(());
            }
            if let Err(err) = self.bus.reset() {
                debug!(%err, "bus reset between frame retries failed");
            }
            self.settle(self.cfg.reset_settle_ms);
        }
        Err(BusError::TransmitFailed)
    }

    fn rearm_internal_ref(&mut self, retries: u32) -> Result<(), BusError> {
        self.send_frame_retry(frame::INTERNAL_REF_ENABLE_FRAME, retries)?;
        self.counters.ref_rearm_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn soft_reset_and_rearm(&mut self) -> Result<(), BusError> {
        let reset = self.send_frame_retry(frame::SOFT_RESET_FRAME, 1);
        self.settle(self.cfg.reset_settle_ms);
        let rearm = self.rearm_internal_ref(2);
        self.settle(self.cfg.rearm_settle_ms);
        reset.and(rearm)
    }

    fn settle(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}
