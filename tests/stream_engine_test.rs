//! Integration tests for the sample-stream engine: double-buffer
//! discipline, source switching, reference refresh, and the health
//! monitor's recovery paths — driven through a scripted mock transfer
//! engine and a manual clock.

use edgewave::config::{EngineConfig, FlashLayout, SynthConfig};
use edgewave::engine::frame::{INTERNAL_REF_ENABLE_FRAME, SOFT_RESET_FRAME};
use edgewave::engine::{
    SourceMode, StreamEngine, RECOVER_REASON_PERIPHERAL, RECOVER_REASON_STAGNANT,
};
use edgewave::error::StreamError;
use edgewave::hardware::mock::{ManualClock, MockDacBus, SimFlash};
use edgewave::hardware::{BufferHalf, SharedFlash};
use edgewave::store::WaveInfo;
use parking_lot::RwLock;
use std::sync::Arc;
use tempfile::TempDir;

const HALF_SAMPLES: u32 = 16;

fn small_layout() -> FlashLayout {
    FlashLayout {
        capacity_bytes: 0x0004_0000,
        base_offset: 0x0001_0000,
        partition_size: 0x0001_0000,
        partition_count: 3,
        erase_unit: 0x1000,
        io_chunk: 512,
        mmap_base: 0x9000_0000,
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        sample_rate_hz: 48_000,
        half_buffer_samples: HALF_SAMPLES,
        timer_clock_hz: 240_000_000,
        ref_refresh_interval_ms: 250,
        stagnant_window_ms: 40,
        stagnant_limit: 3,
        reset_settle_ms: 0,
        rearm_settle_ms: 0,
        synth: SynthConfig::default(),
    }
}

struct Rig {
    bus: MockDacBus,
    clock: Arc<ManualClock>,
    flash: SharedFlash,
    engine: StreamEngine<MockDacBus>,
}

fn rig(dir: &TempDir) -> Rig {
    let layout = small_layout();
    let clock = Arc::new(ManualClock::new());
    let bus = MockDacBus::new();
    let flash: SharedFlash = Arc::new(RwLock::new(
        SimFlash::open(
            &dir.path().join("flash.bin"),
            layout.capacity_bytes,
            layout.erase_unit,
        )
        .unwrap(),
    ));
    let mut engine = StreamEngine::new(
        bus.clone(),
        flash.clone(),
        clock.clone(),
        layout,
        test_config(),
    );
    engine.init(0);
    Rig {
        bus,
        clock,
        flash,
        engine,
    }
}

/// Program a small wave's raw codes into flash and return its record.
/// Sample `i`, channel `ch` carries code `i * 16 + ch`.
fn plant_flash_wave(rig: &Rig, sample_count: u32) -> WaveInfo {
    let layout = small_layout();
    let offset = layout.base_offset + 0x20;
    let mut bytes = Vec::new();
    for i in 0..sample_count {
        for ch in 0..4u32 {
            bytes.extend_from_slice(&((i * 16 + ch) as u16).to_le_bytes());
        }
    }
    {
        let mut flash = rig.flash.write();
        flash.exit_memory_mapped().unwrap();
        flash.erase_block(layout.base_offset).unwrap();
        flash.program(offset, &bytes).unwrap();
        flash.enter_memory_mapped().unwrap();
    }
    WaveInfo {
        sample_rate_hz: 48_000,
        sample_count,
        source_address: layout.mmap_base + offset,
        partition_id: 1,
    }
}

fn expected_code_frame(channel: usize, code: u16) -> u32 {
    // [cmd|addr|data<<4]: channels A..C write-input (cmd 0), channel D
    // write-update-all (cmd 2).
    let prefix = match channel {
        3 => 0x0230_0000,
        ch => (ch as u32) << 20,
    };
    prefix | (u32::from(code) << 4)
}

#[test]
fn init_rearms_the_reference() {
    let dir = TempDir::new().unwrap();
    let rig = rig(&dir);
    let frames = rig.bus.frames_sent();
    assert!(frames.contains(&SOFT_RESET_FRAME));
    assert!(frames.contains(&INTERNAL_REF_ENABLE_FRAME));
    assert_eq!(rig.engine.get_health().ref_rearm_count, 1);
    assert!(!rig.engine.is_running());
}

#[test]
fn init_retries_through_transmit_failures() {
    let dir = TempDir::new().unwrap();
    let layout = small_layout();
    let clock = Arc::new(ManualClock::new());
    let bus = MockDacBus::new();
    let flash: SharedFlash = Arc::new(RwLock::new(
        SimFlash::open(&dir.path().join("flash.bin"), layout.capacity_bytes, layout.erase_unit)
            .unwrap(),
    ));
    let mut engine =
        StreamEngine::new(bus.clone(), flash, clock, layout, test_config());

    // First attempt of each frame fails; the retry lands it.
    bus.fail_next_frames(1);
    engine.init(0);
    let frames = bus.frames_sent();
    assert!(frames.contains(&SOFT_RESET_FRAME));
    assert!(frames.contains(&INTERNAL_REF_ENABLE_FRAME));
    assert!(bus.resets() >= 1);
}

#[test]
fn start_prefills_both_halves_and_derives_the_timer() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    rig.engine.start();

    assert!(rig.engine.is_running());
    assert!(rig.bus.is_streaming());

    let division = rig.bus.division().unwrap();
    assert_eq!(division.prescaler, 0);
    assert_eq!(division.reload, 4999); // 240 MHz / 48 kHz

    let flushes = rig.bus.flushes();
    let half_words = (HALF_SAMPLES * 4) as usize;
    assert_eq!(
        &flushes[..2],
        &[(BufferHalf::First, half_words), (BufferHalf::Second, half_words)]
    );
    assert_eq!(rig.bus.flush_violations(), 0);
}

#[test]
fn start_fails_closed_when_configuration_fails() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    rig.bus.set_fail_begin_stream(true);
    rig.engine.start();

    assert!(!rig.engine.is_running());
    assert!(rig.engine.get_stats().fail >= 1);

    rig.bus.set_fail_begin_stream(false);
    rig.engine.start();
    assert!(rig.engine.is_running());
}

#[test]
fn buffer_halves_are_never_written_while_in_flight() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    rig.engine.start();

    for _ in 0..8 {
        rig.bus.complete_half();
        rig.engine.pump_events();
        rig.bus.complete_full();
        rig.engine.pump_events();
    }

    assert_eq!(rig.bus.flush_violations(), 0);
    // Two prefills plus one refill per completion event.
    assert_eq!(rig.bus.flushes().len(), 2 + 16);
}

#[test]
fn reference_refresh_rides_the_first_word() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    rig.engine.start();

    // start() leaves a refresh pending; the first refill consumes it.
    rig.bus.complete_half();
    rig.engine.pump_events();
    assert_eq!(
        rig.bus.first_word(BufferHalf::First),
        Some(INTERNAL_REF_ENABLE_FRAME)
    );
    assert_eq!(rig.engine.get_health().ref_refresh_count, 1);

    // No refresh pending: the next refill carries a plain frame.
    rig.bus.complete_full();
    rig.engine.pump_events();
    assert_ne!(
        rig.bus.first_word(BufferHalf::Second),
        Some(INTERNAL_REF_ENABLE_FRAME)
    );

    // The periodic request re-arms it from service().
    rig.clock.advance(250);
    rig.engine.service();
    rig.bus.complete_half();
    rig.engine.pump_events();
    assert_eq!(
        rig.bus.first_word(BufferHalf::First),
        Some(INTERNAL_REF_ENABLE_FRAME)
    );
    assert_eq!(rig.engine.get_health().ref_refresh_count, 2);
}

#[test]
fn flash_wave_fills_and_wraps() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    let wave = plant_flash_wave(&rig, 6);

    rig.engine.use_flash_wave(wave).unwrap();
    assert_eq!(rig.engine.source_mode(), SourceMode::FlashResident);
    assert_eq!(rig.engine.active_partition(), Some(1));

    rig.engine.start();
    let words = rig.bus.last_flush(BufferHalf::First).unwrap();
    // 16 frames from a 6-sample wave: the read index wraps modulo 6.
    for i in 0..HALF_SAMPLES as usize {
        let sample = (i % 6) as u32;
        for ch in 0..4 {
            assert_eq!(
                words[i * 4 + ch],
                expected_code_frame(ch, (sample * 16 + ch as u32) as u16),
                "sample {i} channel {ch}"
            );
        }
    }

    // The second half continues where the first left off: 16 % 6 == 4.
    let words = rig.bus.last_flush(BufferHalf::Second).unwrap();
    assert_eq!(words[0], expected_code_frame(0, 4 * 16));
}

#[test]
fn flash_wave_rejects_bad_records() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);

    let outside = WaveInfo {
        sample_rate_hz: 48_000,
        sample_count: 100,
        source_address: 0x2000_0000,
        partition_id: 0,
    };
    assert!(matches!(
        rig.engine.use_flash_wave(outside),
        Err(StreamError::AddressOutOfWindow { .. })
    ));

    let empty = WaveInfo {
        sample_rate_hz: 48_000,
        sample_count: 0,
        source_address: 0x9001_0000,
        partition_id: 0,
    };
    assert!(matches!(
        rig.engine.use_flash_wave(empty),
        Err(StreamError::EmptyWave)
    ));
    assert_eq!(rig.engine.source_mode(), SourceMode::Synthesized);
}

#[test]
fn switching_sources_mid_stream_restarts_cleanly() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    let wave = plant_flash_wave(&rig, 6);

    rig.engine.start();
    rig.bus.complete_half();
    rig.engine.pump_events();

    rig.engine.use_flash_wave(wave).unwrap();
    assert!(rig.engine.is_running(), "restarted on the new source");
    assert_eq!(rig.bus.division().unwrap().reload, 4999, "same rate kept");

    // A different sample rate reconfigures the timer on restart.
    let faster = WaveInfo {
        sample_rate_hz: 96_000,
        ..wave
    };
    rig.engine.use_flash_wave(faster).unwrap();
    assert_eq!(rig.bus.division().unwrap().reload, 2499);

    rig.engine.use_synthesized_wave();
    assert!(rig.engine.is_running());
    assert_eq!(rig.engine.source_mode(), SourceMode::Synthesized);
    assert_eq!(rig.engine.active_partition(), None);
    assert_eq!(rig.bus.flush_violations(), 0);
}

#[test]
fn stagnation_recovers_after_three_windows() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    rig.engine.start();

    // Freeze: never complete a half, never advance the progress counter.
    rig.clock.advance(40);
    rig.engine.service();
    assert_eq!(rig.engine.get_health().stagnant_count, 1);
    rig.clock.advance(40);
    rig.engine.service();
    assert_eq!(rig.engine.get_health().stagnant_count, 2);
    assert_eq!(rig.engine.get_health().recover_count, 0);

    rig.clock.advance(40);
    rig.engine.service();
    let health = rig.engine.get_health();
    assert_eq!(health.recover_count, 1);
    assert_ne!(health.recover_reason & RECOVER_REASON_STAGNANT, 0);
    assert!(rig.engine.is_running(), "streaming resumed");

    // Progress resumes: the stagnation counter clears and no further
    // recovery fires.
    rig.bus.complete_half();
    rig.engine.pump_events();
    rig.clock.advance(40);
    rig.engine.service();
    let health = rig.engine.get_health();
    assert_eq!(health.recover_count, 1);
    assert_eq!(health.stagnant_count, 0);
}

#[test]
fn peripheral_errors_recover_with_rearm() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);
    rig.engine.start();
    let rearms_before = rig.engine.get_health().ref_rearm_count;

    rig.bus.inject_error();
    rig.engine.pump_events();
    rig.clock.advance(5);
    rig.engine.service();

    let health = rig.engine.get_health();
    assert_eq!(health.recover_count, 1);
    assert_ne!(health.recover_reason & RECOVER_REASON_PERIPHERAL, 0);
    assert_eq!(health.recover_reason & RECOVER_REASON_STAGNANT, 0);
    assert_eq!(health.ref_rearm_count, rearms_before + 1);
    assert!(rig.engine.is_running());
    assert_eq!(rig.engine.get_stats().fail, 1);
}

#[test]
fn fixed_voltage_is_refused_while_streaming() {
    let dir = TempDir::new().unwrap();
    let mut rig = rig(&dir);

    rig.engine.output_fixed_voltage(0.0).unwrap();
    let frames = rig.bus.frames_sent();
    // Four channel frames beyond init's reset/rearm pair.
    assert_eq!(frames.len(), 2 + 4);

    rig.engine.start();
    assert!(matches!(
        rig.engine.output_fixed_voltage(1.0),
        Err(StreamError::StreamActive)
    ));
}
