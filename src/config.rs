//! Configuration for the waveform engine.
//!
//! Strongly-typed configuration loaded from a TOML file with environment
//! overrides (prefixed with `EDGEWAVE_`). Every empirically-chosen timing
//! constant of the streaming engine (reference-refresh interval,
//! stagnation window) is a field here rather than a hard-coded value;
//! the defaults reproduce the values validated on hardware — do not
//! tighten or loosen them without hardware validation.
//!
//! # Example
//! ```no_run
//! use edgewave::config::WaveConfig;
//!
//! let config = WaveConfig::load_from("edgewave.toml")?;
//! println!("sample rate: {} Hz", config.engine.sample_rate_hz);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of DAC channels in every sample frame.
pub const CHANNEL_COUNT: u32 = 4;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveConfig {
    /// Stream-engine settings.
    pub engine: EngineConfig,
    /// External flash layout.
    pub flash: FlashLayout,
    /// Fault-burst controller settings.
    pub fault: FaultConfig,
    /// Boot-time partition sync settings.
    pub sync: SyncConfig,
}

/// Stream-engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output sample rate in Hz.
    pub sample_rate_hz: u32,
    /// Sample frames per double-buffer half. The full transfer is
    /// `2 * half_buffer_samples * 4` 32-bit words and must fit the
    /// transfer engine's size field.
    pub half_buffer_samples: u32,
    /// Clock feeding the sample-rate timer, in Hz.
    pub timer_clock_hz: u32,
    /// Interval between periodic reference-refresh requests, in ms.
    pub ref_refresh_interval_ms: u32,
    /// Width of one stagnation-detection window, in ms.
    pub stagnant_window_ms: u32,
    /// Consecutive stagnant windows before recovery is forced.
    pub stagnant_limit: u32,
    /// Settle delay after a soft reset, in ms.
    pub reset_settle_ms: u64,
    /// Settle delay after re-enabling the internal reference, in ms.
    pub rearm_settle_ms: u64,
    /// Synthesized-source settings.
    pub synth: SynthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 240_000,
            half_buffer_samples: 8191,
            timer_clock_hz: 240_000_000,
            ref_refresh_interval_ms: 250,
            stagnant_window_ms: 40,
            stagnant_limit: 3,
            reset_settle_ms: 2,
            rearm_settle_ms: 10,
            synth: SynthConfig::default(),
        }
    }
}

/// Synthesized-source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Per-channel output frequency in Hz (channels A..D).
    pub channel_freq_hz: [f64; 4],
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            channel_freq_hz: [12_000.0, 6_000.0, 3_000.0, 1_000.0],
        }
    }
}

/// External flash layout: where waveform partitions live and how the
/// memory-mapped window addresses them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashLayout {
    /// Total flash capacity in bytes.
    pub capacity_bytes: u32,
    /// Flash offset of partition 0. The region below is reserved.
    pub base_offset: u32,
    /// Fixed size of each waveform partition in bytes.
    pub partition_size: u32,
    /// Number of partitions (baseline + fault variants).
    pub partition_count: u32,
    /// Erase granularity in bytes.
    pub erase_unit: u32,
    /// Maximum bytes per program/read transaction during sync.
    pub io_chunk: u32,
    /// CPU address at which flash offset 0 appears while memory-mapped.
    pub mmap_base: u32,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            capacity_bytes: 0x0200_0000,
            base_offset: 0x0040_0000,
            partition_size: 0x0040_0000,
            partition_count: 7,
            erase_unit: 0x0001_0000,
            io_chunk: 4096,
            mmap_base: 0x9000_0000,
        }
    }
}

impl FlashLayout {
    /// One past the highest valid memory-mapped address.
    pub fn mmap_limit(&self) -> u32 {
        self.mmap_base.wrapping_add(self.capacity_bytes)
    }

    /// Whether `addr` falls inside the memory-mapped window.
    pub fn contains_mapped(&self, addr: u32) -> bool {
        addr >= self.mmap_base && addr < self.mmap_limit()
    }

    /// Flash offset of partition `partition`'s first byte.
    ///
    /// Out-of-range ids clamp to the reserved base offset, mirroring the
    /// addressing helper's total behavior; callers validate ids first.
    pub fn partition_base(&self, partition: u32) -> u32 {
        if partition >= self.partition_count {
            return self.base_offset;
        }
        self.base_offset + partition * self.partition_size
    }

    /// Check internal consistency of the layout.
    pub fn validate(&self) -> Result<(), String> {
        if self.partition_count == 0 {
            return Err("partition_count must be nonzero".into());
        }
        if self.partition_size == 0 || self.partition_size % self.erase_unit != 0 {
            return Err("partition_size must be a nonzero multiple of erase_unit".into());
        }
        if !self.erase_unit.is_power_of_two() {
            return Err("erase_unit must be a power of two".into());
        }
        if self.io_chunk == 0 {
            return Err("io_chunk must be nonzero".into());
        }
        let end = u64::from(self.base_offset)
            + u64::from(self.partition_count) * u64::from(self.partition_size);
        if end > u64::from(self.capacity_bytes) {
            return Err("partition table exceeds flash capacity".into());
        }
        Ok(())
    }
}

/// Fault-burst controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Number of selectable fault variants (fault ids `0..fault_count`,
    /// mapped to partitions `1..=fault_count`).
    pub fault_count: u32,
    /// Shortest allowed burst duration in seconds.
    pub min_duration_s: u32,
    /// Longest allowed burst duration in seconds.
    pub max_duration_s: u32,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            fault_count: 6,
            min_duration_s: 1,
            max_duration_s: 3600,
        }
    }
}

impl FaultConfig {
    /// Clamp a requested burst duration into the allowed range.
    pub fn clamp_duration_s(&self, duration_s: u32) -> u32 {
        duration_s.clamp(self.min_duration_s, self.max_duration_s)
    }
}

/// Boot-time partition sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory on the removable storage holding one source file per
    /// partition, named `<partition_name>.bin`.
    pub wave_dir: PathBuf,
    /// Stream every partition from removable storage at boot; when
    /// false, only prior flash contents are validated.
    pub full_sync: bool,
    /// During a full sync, refuse to start output from a baseline that
    /// only validated from stale flash contents.
    pub require_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wave_dir: PathBuf::from("wave"),
            full_sync: true,
            require_sync: true,
        }
    }
}

impl WaveConfig {
    /// Load configuration from a TOML file, with `EDGEWAVE_`-prefixed
    /// environment variables overriding nested fields (dot-separated,
    /// e.g. `EDGEWAVE_ENGINE.SAMPLE_RATE_HZ=48000`). A missing file
    /// yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EDGEWAVE_").split("."))
            .extract()?;
        config.flash.validate().map_err(figment::Error::from)?;
        Ok(config)
    }
}
