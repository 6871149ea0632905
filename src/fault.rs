//! Fault-burst controller.
//!
//! Lets an operator temporarily substitute a fault partition's waveform
//! for the baseline output, for a bounded duration, then automatically
//! revert. The UI task never touches the stream engine: it posts into a
//! single-slot mailbox that the stream-owning task drains from
//! [`FaultController::service`]. A newer post overwrites an unconsumed
//! one — only the most recent operator intent matters.

use crate::config::FaultConfig;
use crate::engine::StreamEngine;
use crate::hardware::{ticks_reached, DacBus, TickClock};
use crate::store::WaveBank;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Sentinel for "no fault active".
const FAULT_NONE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultCommand {
    Trigger { fault_id: u8, duration_s: u32 },
    Stop,
}

/// Snapshot of controller state for UI polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultUiState {
    /// Bit `i` set means partition `i` is ready.
    pub ready_mask: u32,
    /// The active fault id, if a burst is running.
    pub active_fault: Option<u8>,
    /// Whole seconds left in the active burst (0 when idle).
    pub remaining_s: u32,
}

/// Per-system fault-burst state machine: Idle until a trigger is
/// accepted, Active until the burst expires or is stopped.
pub struct FaultController {
    bank: Arc<WaveBank>,
    clock: Arc<dyn TickClock>,
    cfg: FaultConfig,
    slot: Mutex<Option<FaultCommand>>,
    active_fault: AtomicU8,
    end_tick: AtomicU32,
    remaining_s: AtomicU32,
}

impl FaultController {
    /// Build a controller over the boot-time partition table.
    pub fn new(bank: Arc<WaveBank>, clock: Arc<dyn TickClock>, cfg: FaultConfig) -> Self {
        Self {
            bank,
            clock,
            cfg,
            slot: Mutex::new(None),
            active_fault: AtomicU8::new(FAULT_NONE),
            end_tick: AtomicU32::new(0),
            remaining_s: AtomicU32::new(0),
        }
    }

    /// Request a fault burst. Safe to call from the UI task.
    ///
    /// Validates cheaply (id range, stream running, baseline and fault
    /// partitions ready) and posts a trigger command; returns `false` if
    /// the request is rejected up front. The switch itself happens on
    /// the owning task's next [`service`](Self::service).
    pub fn trigger(&self, fault_id: u32, duration_s: u32) -> bool {
        if fault_id >= self.cfg.fault_count {
            return false;
        }
        let partition = fault_id + 1;
        if !self.bank.stream_started() {
            return false;
        }
        if !self.bank.partition_ready(0) || !self.bank.partition_ready(partition) {
            return false;
        }
        self.post(FaultCommand::Trigger {
            fault_id: fault_id as u8,
            duration_s,
        });
        true
    }

    /// Request an early stop. Idempotent; no-op when no burst is active
    /// or the baseline is unavailable.
    pub fn stop(&self) {
        if !self.bank.stream_started() || !self.bank.partition_ready(0) {
            return;
        }
        self.post(FaultCommand::Stop);
    }

    /// State snapshot for the UI; pure reads, safe to poll every frame.
    pub fn get_ui_state(&self) -> FaultUiState {
        let active = self.active_fault.load(Ordering::SeqCst);
        FaultUiState {
            ready_mask: self.bank.ready_mask(),
            active_fault: (active != FAULT_NONE).then_some(active),
            remaining_s: self.remaining_s.load(Ordering::SeqCst),
        }
    }

    /// Drain the mailbox and run the burst countdown. Called
    /// periodically by the task that owns the stream engine.
    pub fn service<B: DacBus>(&self, engine: &mut StreamEngine<B>) {
        // Take the slot before acting so a command posted mid-drain is
        // deferred to the next cycle instead of lost, and the poster
        // never waits on the switch itself.
        let command = self.slot.lock().take();
        if let Some(command) = command {
            match command {
                FaultCommand::Trigger {
                    fault_id,
                    duration_s,
                } => {
                    if !self.apply_trigger(engine, u32::from(fault_id), duration_s) {
                        warn!(fault_id, duration_s, "fault burst trigger rejected");
                    }
                }
                FaultCommand::Stop => {
                    self.apply_stop(engine);
                    info!("fault burst stopped");
                }
            }
        }

        if self.active_fault.load(Ordering::SeqCst) == FAULT_NONE {
            return;
        }

        let end = self.end_tick.load(Ordering::SeqCst);
        let now = self.clock.ticks_ms();
        if ticks_reached(now, end) {
            self.apply_stop(engine);
            info!("fault burst expired");
            return;
        }

        let remaining_ms = end.wrapping_sub(now);
        let remaining_s = (remaining_ms + 999) / 1000;
        self.remaining_s.store(remaining_s, Ordering::SeqCst);
    }

    fn post(&self, command: FaultCommand) {
        // Last writer wins: a command posted over an unconsumed one
        // replaces it.
        *self.slot.lock() = Some(command);
    }

    fn apply_trigger<B: DacBus>(
        &self,
        engine: &mut StreamEngine<B>,
        fault_id: u32,
        duration_s: u32,
    ) -> bool {
        if fault_id >= self.cfg.fault_count {
            return false;
        }
        let partition = fault_id + 1;
        let duration_s = self.cfg.clamp_duration_s(duration_s);
        if !self.bank.stream_started() {
            return false;
        }
        if !self.bank.partition_ready(0) || !self.bank.partition_ready(partition) {
            return false;
        }
        let Some(wave) = self.bank.info(partition) else {
            return false;
        };
        if engine.use_flash_wave(wave).is_err() {
            return false;
        }

        let now = self.clock.ticks_ms();
        self.active_fault
            .store(fault_id as u8, Ordering::SeqCst);
        self.end_tick
            .store(now.wrapping_add(duration_s * 1000), Ordering::SeqCst);
        self.remaining_s.store(duration_s, Ordering::SeqCst);
        info!(fault_id, duration_s, "fault burst active");
        true
    }

    fn apply_stop<B: DacBus>(&self, engine: &mut StreamEngine<B>) {
        if !self.bank.stream_started() || !self.bank.partition_ready(0) {
            return;
        }
        if let Some(baseline) = self.bank.info(0) {
            if let Err(err) = engine.use_flash_wave(baseline) {
                warn!(%err, "baseline restore failed");
            }
        }
        self.active_fault.store(FAULT_NONE, Ordering::SeqCst);
        self.end_tick.store(0, Ordering::SeqCst);
        self.remaining_s.store(0, Ordering::SeqCst);
    }
}
