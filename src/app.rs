//! Application wiring: boot sequence and periodic service loop.
//!
//! Mirrors the stream-owning task of the target firmware: populate the
//! partition table (full sync from removable storage, or validation of
//! prior flash contents), hand the baseline wave to the stream engine,
//! then service the fault controller and the engine's health monitor on
//! a ~5 ms cadence with a once-per-second stats line.

use crate::config::WaveConfig;
use crate::engine::StreamEngine;
use crate::fault::FaultController;
use crate::hardware::{DacBus, SharedFlash, TickClock};
use crate::store::{partition_name, PartitionStore, WaveBank, WaveInfo};
use std::sync::Arc;
use tracing::{info, warn};

/// UI-facing lifecycle hooks, injected at construction.
///
/// The UI decides what to unlock from these notifications without the
/// core knowing about screens.
pub trait BootHooks {
    /// Every partition has been synced or validated.
    fn on_boot_complete(&self, _ready_mask: u32) {}

    /// Continuous baseline output is running.
    fn on_stream_started(&self) {}
}

/// No-op hooks for headless operation.
pub struct NullHooks;

impl BootHooks for NullHooks {}

/// How to populate the partition table at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Stream every partition from removable storage, falling back to
    /// prior flash contents per partition on failure.
    FullSync,
    /// Only validate prior flash contents (fast path).
    LoadOnly,
}

/// The assembled system: engine, store, fault controller and hooks.
pub struct WaveApp<B: DacBus> {
    cfg: WaveConfig,
    engine: StreamEngine<B>,
    store: PartitionStore,
    clock: Arc<dyn TickClock>,
    hooks: Box<dyn BootHooks>,
    bank: Option<Arc<WaveBank>>,
    fault: Option<FaultController>,
    last_stats_tick: u32,
}

impl<B: DacBus> WaveApp<B> {
    /// Wire the subsystems together. Call [`boot`](Self::boot) next.
    pub fn new(
        cfg: WaveConfig,
        bus: B,
        flash: SharedFlash,
        clock: Arc<dyn TickClock>,
        hooks: Box<dyn BootHooks>,
    ) -> Self {
        let engine = StreamEngine::new(
            bus,
            flash.clone(),
            clock.clone(),
            cfg.flash.clone(),
            cfg.engine.clone(),
        );
        let store = PartitionStore::new(flash, cfg.flash.clone());
        Self {
            cfg,
            engine,
            store,
            clock,
            hooks,
            bank: None,
            fault: None,
            last_stats_tick: 0,
        }
    }

    /// Populate the partition table, start baseline output if possible,
    /// and arm the fault controller. Returns the ready mask.
    pub fn boot(&mut self, mode: BootMode) -> u32 {
        self.engine.init(self.cfg.engine.sample_rate_hz);

        let count = self.cfg.flash.partition_count;
        let mut infos = vec![WaveInfo::default(); count as usize];
        let mut synced_mask = 0u32;
        info!(partitions = count, ?mode, "partition table boot begin");

        for partition in 0..count {
            let name = partition_name(partition);
            if mode == BootMode::FullSync {
                let path = self.cfg.sync.wave_dir.join(format!("{name}.bin"));
                match self.store.sync_partition_from_source(&path, partition) {
                    Ok(info) => {
                        synced_mask |= 1 << partition;
                        infos[partition as usize] = info;
                        continue;
                    }
                    Err(err) => {
                        warn!(partition = name, path = %path.display(), %err, "sync failed");
                    }
                }
            }

            match self.store.load_partition_from_flash(partition) {
                Ok(info) => {
                    infos[partition as usize] = info;
                    info!(
                        partition = name,
                        sample_rate_hz = info.sample_rate_hz,
                        samples = info.sample_count,
                        "partition loaded from flash"
                    );
                }
                Err(err) => {
                    info!(partition = name, %err, "partition not ready");
                }
            }
        }

        let bank = Arc::new(WaveBank::new(infos, &self.cfg.flash));
        let ready_mask = bank.ready_mask();
        info!(
            ready_mask = format_args!("{ready_mask:#04x}"),
            synced_mask = format_args!("{synced_mask:#04x}"),
            "partition table boot done"
        );
        self.hooks.on_boot_complete(ready_mask);

        self.start_baseline(&bank, mode, synced_mask);

        self.fault = Some(FaultController::new(
            bank.clone(),
            self.clock.clone(),
            self.cfg.fault.clone(),
        ));
        self.bank = Some(bank);
        self.last_stats_tick = self.clock.ticks_ms();
        ready_mask
    }

    fn start_baseline(&mut self, bank: &Arc<WaveBank>, mode: BootMode, synced_mask: u32) {
        if !bank.partition_ready(0) {
            warn!("baseline not ready, no waveform output");
        } else if mode == BootMode::FullSync
            && self.cfg.sync.require_sync
            && synced_mask & 1 == 0
        {
            warn!("baseline requires a fresh sync but only stale flash validated, no output");
        } else if let Some(baseline) = bank.info(0) {
            match self.engine.use_flash_wave(baseline) {
                Ok(()) => {
                    self.engine.start();
                    if self.engine.is_running() {
                        bank.mark_stream_started(true);
                        self.hooks.on_stream_started();
                        info!(
                            sample_rate_hz = baseline.sample_rate_hz,
                            "baseline output started"
                        );
                        return;
                    }
                    warn!("baseline stream failed to start");
                }
                Err(err) => warn!(%err, "baseline source switch failed"),
            }
        }

        // No continuous output: park the channels at 0 V.
        if let Err(err) = self.engine.output_fixed_voltage(0.0) {
            warn!(%err, "fixed-voltage fallback failed");
        }
    }

    /// One service-loop iteration: pump transfer events, drain fault
    /// commands, run the health monitor, and emit the 1 Hz stats line.
    pub fn tick(&mut self) {
        self.engine.pump_events();
        if let Some(fault) = &self.fault {
            fault.service(&mut self.engine);
        }
        self.engine.service();

        let now = self.clock.ticks_ms();
        if now.wrapping_sub(self.last_stats_tick) >= 1000 {
            let stats = self.engine.get_stats();
            let health = self.engine.get_health();
            info!(
                ok = stats.ok,
                fail = stats.fail,
                skip = stats.skip,
                recover = health.recover_count,
                reason = health.recover_reason,
                ref_rearm = health.ref_rearm_count,
                ref_refresh = health.ref_refresh_count,
                stagnant = health.stagnant_count,
                "stream stats"
            );
            self.last_stats_tick = now;
        }
    }

    /// The stream engine.
    pub fn engine(&self) -> &StreamEngine<B> {
        &self.engine
    }

    /// The stream engine, mutably.
    pub fn engine_mut(&mut self) -> &mut StreamEngine<B> {
        &mut self.engine
    }

    /// The fault controller, once booted.
    pub fn fault(&self) -> Option<&FaultController> {
        self.fault.as_ref()
    }

    /// The partition table, once booted.
    pub fn bank(&self) -> Option<&Arc<WaveBank>> {
        self.bank.as_ref()
    }
}
