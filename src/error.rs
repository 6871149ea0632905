//! Custom error types for the waveform engine.
//!
//! Errors are grouped by the boundary that raises them:
//!
//! - [`BusError`] / [`FlashError`]: raised by the trusted device drivers
//!   behind the [`crate::hardware`] traits.
//! - [`StoreError`]: raised by the partition store while syncing or
//!   validating waveform partitions. Header-validation failures carry a
//!   [`HeaderIssue`] so callers can log the exact reason while still
//!   treating the partition as merely "not ready".
//! - [`StreamError`]: raised by the stream engine's source-switch
//!   operations.
//!
//! Peripheral transfer errors and stagnation are deliberately *not*
//! represented here: they are counted and consumed by the engine's
//! health monitor rather than propagated as `Result`s.

use thiserror::Error;

/// Errors from the serial DAC transfer engine.
#[derive(Debug, Error)]
pub enum BusError {
    /// A blocking single-frame transmit did not complete.
    #[error("frame transmit failed")]
    TransmitFailed,

    /// The circular transfer could not be configured or started.
    #[error("transfer configuration rejected: {0}")]
    ConfigRejected(&'static str),
}

/// Errors from the external waveform flash driver.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Block erase failed.
    #[error("flash erase failed at offset {offset:#010x}")]
    Erase {
        /// Flash offset of the failed erase.
        offset: u32,
    },

    /// Page/buffer program failed.
    #[error("flash program failed at offset {offset:#010x}")]
    Program {
        /// Flash offset of the failed program.
        offset: u32,
    },

    /// Transactional read failed.
    #[error("flash read failed at offset {offset:#010x}")]
    Read {
        /// Flash offset of the failed read.
        offset: u32,
    },

    /// An access fell outside the device capacity.
    #[error("flash access at {offset:#010x}+{len} outside device capacity")]
    OutOfBounds {
        /// Requested flash offset.
        offset: u32,
        /// Requested length in bytes.
        len: usize,
    },

    /// Entering or leaving memory-mapped mode failed.
    #[error("memory-mapped mode transition failed")]
    MemoryMap,
}

/// Reasons a partition header fails validation.
///
/// Any of these marks the partition "not ready"; none of them is fatal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderIssue {
    /// The magic tag does not match the waveform partition format.
    #[error("bad magic tag")]
    Magic,

    /// The format version is not the supported one.
    #[error("unsupported format version")]
    Version,

    /// The channel count field is not the fixed channel count.
    #[error("channel count is not 4")]
    ChannelCount,

    /// Sample rate or sample count is zero.
    #[error("zero sample rate or sample count")]
    EmptyWave,

    /// The payload offset overlaps the header.
    #[error("data offset below header size")]
    DataOffset,

    /// `data_bytes` disagrees with `sample_count * channels * 2`.
    #[error("data byte count disagrees with sample count")]
    DataBytes,

    /// Header plus payload would run past the end of the partition.
    #[error("header plus payload exceeds partition size")]
    RegionOverflow,
}

/// Errors from partition-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The partition id is outside the configured partition table.
    #[error("partition id {0} out of range")]
    InvalidPartition(u32),

    /// Reading the source file failed.
    #[error("source file: {0}")]
    Source(#[from] std::io::Error),

    /// The source file ended before the declared payload was read.
    #[error("source truncated: expected {expected} payload bytes, read {read}")]
    SourceTruncated {
        /// Payload bytes the header declared.
        expected: u32,
        /// Payload bytes actually read.
        read: u32,
    },

    /// The partition header failed validation.
    #[error("waveform header invalid: {0}")]
    Header(#[from] HeaderIssue),

    /// The checksum streamed from the source disagrees with the header.
    #[error("payload checksum mismatch: header {declared:#010x}, streamed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum declared in the header.
        declared: u32,
        /// Checksum accumulated over the streamed payload.
        computed: u32,
    },

    /// The header read back from flash differs from what was programmed.
    #[error("flash header read-back mismatch after program")]
    HeaderReadback,

    /// A flash transaction failed.
    #[error(transparent)]
    Flash(#[from] FlashError),
}

/// Errors from stream-engine source switches and idle output.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The wave's base address is outside the memory-mapped window.
    #[error("wave address {addr:#010x} outside the memory-mapped window")]
    AddressOutOfWindow {
        /// The rejected address.
        addr: u32,
    },

    /// The wave record has no samples.
    #[error("wave has no samples")]
    EmptyWave,

    /// The operation is only valid while the stream is stopped.
    #[error("stream is active")]
    StreamActive,

    /// A bus transaction failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}
