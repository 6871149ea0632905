//! Integration test for the application boot sequence: full sync from
//! source files, per-partition fallback, baseline startup, hook
//! notifications and the load-only fast path across a simulated reboot.

use edgewave::app::{BootHooks, BootMode, WaveApp};
use edgewave::config::{EngineConfig, FlashLayout, SyncConfig, WaveConfig};
use edgewave::hardware::mock::{ManualClock, MockDacBus, SimFlash};
use edgewave::hardware::SharedFlash;
use edgewave::store::header::{
    checksum_update, WaveHeader, CHECKSUM_SEED, HEADER_BYTES, WAVE_MAGIC, WAVE_VERSION,
};
use parking_lot::RwLock;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn test_config(wave_dir: &Path) -> WaveConfig {
    WaveConfig {
        flash: FlashLayout {
            capacity_bytes: 0x0004_0000,
            base_offset: 0x0000_0000,
            partition_size: 0x0001_0000,
            partition_count: 3,
            erase_unit: 0x1000,
            io_chunk: 512,
            mmap_base: 0x9000_0000,
        },
        engine: EngineConfig {
            half_buffer_samples: 8,
            reset_settle_ms: 0,
            rearm_settle_ms: 0,
            ..EngineConfig::default()
        },
        sync: SyncConfig {
            wave_dir: wave_dir.to_path_buf(),
            ..SyncConfig::default()
        },
        ..WaveConfig::default()
    }
}

fn write_wave_file(dir: &Path, name: &str, sample_count: u32) {
    let mut payload = Vec::new();
    for i in 0..sample_count * 4 {
        payload.extend_from_slice(&(i as u16).to_le_bytes());
    }
    let header = WaveHeader {
        magic: WAVE_MAGIC,
        version: WAVE_VERSION,
        sample_rate_hz: 48_000,
        sample_count,
        channel_count: 4,
        data_offset: HEADER_BYTES as u32,
        data_bytes: payload.len() as u32,
        checksum: checksum_update(CHECKSUM_SEED, &payload),
    };
    let mut bytes = header.to_bytes().to_vec();
    bytes.extend_from_slice(&payload);
    fs::write(dir.join(format!("{name}.bin")), bytes).unwrap();
}

#[derive(Default)]
struct RecordingHooks {
    boot_mask: AtomicU32,
    streams: AtomicU32,
}

#[derive(Clone)]
struct SharedHooks(Arc<RecordingHooks>);

impl BootHooks for SharedHooks {
    fn on_boot_complete(&self, ready_mask: u32) {
        self.0.boot_mask.store(ready_mask, Ordering::SeqCst);
    }

    fn on_stream_started(&self) {
        self.0.streams.fetch_add(1, Ordering::SeqCst);
    }
}

fn open_flash(dir: &Path, config: &WaveConfig) -> SharedFlash {
    Arc::new(RwLock::new(
        SimFlash::open(
            &dir.join("flash.bin"),
            config.flash.capacity_bytes,
            config.flash.erase_unit,
        )
        .unwrap(),
    ))
}

#[test]
fn full_sync_boot_then_load_only_reboot() {
    let dir = TempDir::new().unwrap();
    let waves = dir.path().join("wave");
    fs::create_dir(&waves).unwrap();
    // Baseline and one fault wave exist; the third partition has no file.
    write_wave_file(&waves, "normal", 40);
    write_wave_file(&waves, "ac_coupling", 24);

    let config = test_config(&waves);
    let hooks = Arc::new(RecordingHooks::default());
    let clock = Arc::new(ManualClock::new());

    {
        let flash = open_flash(dir.path(), &config);
        let bus = MockDacBus::new();
        let mut app = WaveApp::new(
            config.clone(),
            bus.clone(),
            flash,
            clock.clone(),
            Box::new(SharedHooks(hooks.clone())),
        );
        let ready = app.boot(BootMode::FullSync);
        assert_eq!(ready, 0b0011);
        assert_eq!(hooks.boot_mask.load(Ordering::SeqCst), 0b0011);
        assert_eq!(hooks.streams.load(Ordering::SeqCst), 1);
        assert!(app.engine().is_running());
        assert_eq!(app.engine().active_partition(), Some(0));
        assert!(app.bank().unwrap().stream_started());

        // A few service ticks with transfer progress stay healthy.
        for _ in 0..4 {
            bus.complete_half();
            app.tick();
            bus.complete_full();
            clock.advance(5);
            app.tick();
        }
        assert_eq!(app.engine().get_health().recover_count, 0);
        assert_eq!(bus.flush_violations(), 0);

        // The fault path works end to end after a full-sync boot.
        assert!(app.fault().unwrap().trigger(0, 2));
        app.tick();
        assert_eq!(app.engine().active_partition(), Some(1));
        clock.advance(2100);
        app.tick();
        assert_eq!(app.engine().active_partition(), Some(0));
    }

    // "Reboot" over the same flash image: the load-only fast path
    // validates prior contents without any source files.
    fs::remove_dir_all(&waves).unwrap();
    let flash = open_flash(dir.path(), &config);
    let mut app = WaveApp::new(
        config.clone(),
        MockDacBus::new(),
        flash,
        clock,
        Box::new(SharedHooks(hooks.clone())),
    );
    let ready = app.boot(BootMode::LoadOnly);
    assert_eq!(ready, 0b0011);
    assert!(app.engine().is_running());
}

#[test]
fn boot_without_baseline_parks_output() {
    let dir = TempDir::new().unwrap();
    let waves = dir.path().join("wave");
    fs::create_dir(&waves).unwrap();
    // Only a fault wave: no baseline, so no continuous output.
    write_wave_file(&waves, "ac_coupling", 24);

    let config = test_config(&waves);
    let hooks = Arc::new(RecordingHooks::default());
    let flash = open_flash(dir.path(), &config);
    let bus = MockDacBus::new();
    let mut app = WaveApp::new(
        config,
        bus.clone(),
        flash,
        Arc::new(ManualClock::new()),
        Box::new(SharedHooks(hooks.clone())),
    );

    let ready = app.boot(BootMode::FullSync);
    assert_eq!(ready, 0b0010);
    assert!(!app.engine().is_running());
    assert_eq!(hooks.streams.load(Ordering::SeqCst), 0);
    // Channels parked at 0 V: four fixed frames after init's pair.
    assert_eq!(bus.frames_sent().len(), 2 + 4);
    // With no running stream every trigger is refused.
    assert!(!app.fault().unwrap().trigger(0, 5));
}
