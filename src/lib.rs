//! # EdgeWave
//!
//! A real-time analog waveform output engine: four synchronized channels
//! of pre-rendered or synthesized samples streamed to a multi-channel
//! DAC over a continuously running, double-buffered, timer-gated serial
//! transfer — indefinitely, and self-healing across transient peripheral
//! faults. Large waveform datasets live in external serial flash as
//! fixed-size partitions synchronized from removable storage and played
//! back straight out of the memory-mapped window, so no CPU copy happens
//! during playback.
//!
//! ## Crate structure
//!
//! - **`hardware`**: the trusted device boundary — traits for the serial
//!   transfer engine, the waveform flash and the tick clock, plus mock
//!   implementations for tests and host-side bring-up.
//! - **`store`**: the waveform partition store — binary header format,
//!   running checksum, erase/program/verify sequencing, partition
//!   addressing, and the boot-time partition table.
//! - **`engine`**: the sample-stream engine — double-buffer filling,
//!   source switching between synthesis and flash-resident waves,
//!   sample-rate timer derivation, and the health monitor.
//! - **`fault`**: the fault-burst controller — cross-task trigger/stop
//!   mailbox, duration clamping and auto-revert.
//! - **`app`**: boot sequence and service loop tying the above together.
//! - **`config`** / **`error`**: typed configuration with TOML/env
//!   loading, and the error taxonomy.

pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod hardware;
pub mod store;
