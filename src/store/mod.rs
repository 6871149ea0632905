//! Waveform partition store.
//!
//! Durable, verifiable storage of fixed-size waveform partitions (one
//! baseline plus the fault variants) in external flash, synchronized
//! from removable storage and exposed to the stream engine as
//! memory-mapped [`WaveInfo`] records. Partitions are equal-sized and
//! independently addressable, so corruption or an interrupted write in
//! one cannot affect another.

pub mod header;

use crate::config::FlashLayout;
use crate::error::StoreError;
use crate::hardware::SharedFlash;
use header::{checksum_update, WaveHeader, CHECKSUM_SEED, HEADER_BYTES};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, info};

/// Names of the canonical partitions, in partition-id order.
const PARTITION_NAMES: [&str; 7] = [
    "normal",
    "ac_coupling",
    "bus_ground",
    "insulation",
    "cap_aging",
    "pwm_abnormal",
    "igbt_fault",
];

/// Human-readable name of a partition id.
pub fn partition_name(partition: u32) -> &'static str {
    PARTITION_NAMES
        .get(partition as usize)
        .copied()
        .unwrap_or("unknown")
}

/// A validated, directly playable waveform record.
///
/// Produced once per boot per partition; all-zero means "not ready".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveInfo {
    /// Playback sample rate in Hz.
    pub sample_rate_hz: u32,
    /// Sample frames in the wave.
    pub sample_count: u32,
    /// Memory-mapped address of the first sample code.
    pub source_address: u32,
    /// Which partition the wave came from (0 = baseline).
    pub partition_id: u32,
}

impl WaveInfo {
    fn from_header(header: &WaveHeader, partition_base: u32, partition: u32, layout: &FlashLayout) -> Self {
        Self {
            sample_rate_hz: header.sample_rate_hz,
            sample_count: header.sample_count,
            source_address: layout.mmap_base + partition_base + header.data_offset,
            partition_id: partition,
        }
    }

    /// Whether this record points at playable samples.
    pub fn is_ready(&self, layout: &FlashLayout) -> bool {
        self.sample_count > 0 && layout.contains_mapped(self.source_address)
    }
}

/// The partition store: flash layout plus the shared flash handle.
pub struct PartitionStore {
    flash: SharedFlash,
    layout: FlashLayout,
}

impl PartitionStore {
    /// Build a store over `flash` with the given layout.
    pub fn new(flash: SharedFlash, layout: FlashLayout) -> Self {
        Self { flash, layout }
    }

    /// The configured flash layout.
    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Flash offset of `partition`'s first byte.
    pub fn partition_base_offset(&self, partition: u32) -> u32 {
        self.layout.partition_base(partition)
    }

    /// Stream one partition from a source file into flash.
    ///
    /// Validates the source header, erases the covered flash range
    /// (rounded up to the erase unit), programs header then payload in
    /// bounded chunks while accumulating the running checksum, and
    /// aborts before declaring success if the accumulated checksum
    /// disagrees with the header. Programming itself is trusted; only
    /// the header is read back and compared. On success the flash is
    /// left in memory-mapped mode and the returned record points into
    /// the mapped region.
    ///
    /// Failure leaves the partition contents indeterminate; the next
    /// [`load_partition_from_flash`](Self::load_partition_from_flash)
    /// will mark it not ready if the header did not survive.
    pub fn sync_partition_from_source(
        &self,
        path: &Path,
        partition: u32,
    ) -> Result<WaveInfo, StoreError> {
        if partition >= self.layout.partition_count {
            return Err(StoreError::InvalidPartition(partition));
        }

        let mut file = File::open(path)?;
        let mut header_bytes = [0u8; HEADER_BYTES];
        file.read_exact(&mut header_bytes)?;
        let header = WaveHeader::from_bytes(&header_bytes);
        header.validate(self.layout.partition_size)?;

        let partition_base = self.layout.partition_base(partition);
        let erase_unit = self.layout.erase_unit;
        let covered = header.data_offset + header.data_bytes;
        let erase_len = (covered + (erase_unit - 1)) & !(erase_unit - 1);

        let mut flash = self.flash.write();
        flash.exit_memory_mapped()?;

        let mut offset = partition_base;
        while offset < partition_base + erase_len {
            flash.erase_block(offset)?;
            offset += erase_unit;
        }
        debug!(
            partition = partition_name(partition),
            base = format_args!("{partition_base:#010x}"),
            bytes = erase_len,
            "partition erased"
        );

        flash.program(partition_base, &header_bytes)?;

        file.seek(SeekFrom::Start(u64::from(header.data_offset)))?;
        let mut checksum = CHECKSUM_SEED;
        let mut written: u32 = 0;
        let mut chunk = vec![0u8; self.layout.io_chunk as usize];
        while written < header.data_bytes {
            let want = ((header.data_bytes - written) as usize).min(chunk.len());
            let got = file.read(&mut chunk[..want])?;
            if got == 0 {
                return Err(StoreError::SourceTruncated {
                    expected: header.data_bytes,
                    read: written,
                });
            }
            flash.program(partition_base + header.data_offset + written, &chunk[..got])?;
            checksum = checksum_update(checksum, &chunk[..got]);
            written += got as u32;
        }

        if checksum != header.checksum {
            return Err(StoreError::ChecksumMismatch {
                declared: header.checksum,
                computed: checksum,
            });
        }

        let mut readback = [0u8; HEADER_BYTES];
        flash.read(partition_base, &mut readback)?;
        if readback != header_bytes {
            return Err(StoreError::HeaderReadback);
        }

        flash.enter_memory_mapped()?;
        drop(flash);

        let info = WaveInfo::from_header(&header, partition_base, partition, &self.layout);
        info!(
            partition = partition_name(partition),
            sample_rate_hz = info.sample_rate_hz,
            samples = info.sample_count,
            addr = format_args!("{:#010x}", info.source_address),
            "partition synced"
        );
        Ok(info)
    }

    /// Validate a partition already resident in flash without touching
    /// its payload — the boot-time fast path when a full resync is not
    /// wanted.
    pub fn load_partition_from_flash(&self, partition: u32) -> Result<WaveInfo, StoreError> {
        if partition >= self.layout.partition_count {
            return Err(StoreError::InvalidPartition(partition));
        }
        let partition_base = self.layout.partition_base(partition);

        let mut flash = self.flash.write();
        flash.exit_memory_mapped()?;

        let mut header_bytes = [0u8; HEADER_BYTES];
        flash.read(partition_base, &mut header_bytes)?;
        let header = WaveHeader::from_bytes(&header_bytes);
        header.validate(self.layout.partition_size)?;

        flash.enter_memory_mapped()?;
        drop(flash);

        Ok(WaveInfo::from_header(&header, partition_base, partition, &self.layout))
    }
}

/// The per-boot partition table: one [`WaveInfo`] per partition plus the
/// readiness mask the UI polls. Rebuilt only by a full re-sync.
#[derive(Debug)]
pub struct WaveBank {
    infos: Vec<WaveInfo>,
    ready_mask: AtomicU32,
    stream_started: AtomicBool,
}

impl WaveBank {
    /// Build the table from per-partition records (all-zero = not
    /// ready), computing the ready mask against `layout`.
    pub fn new(infos: Vec<WaveInfo>, layout: &FlashLayout) -> Self {
        let mut mask = 0u32;
        for (i, info) in infos.iter().enumerate() {
            if info.is_ready(layout) {
                mask |= 1 << i;
            }
        }
        Self {
            infos,
            ready_mask: AtomicU32::new(mask),
            stream_started: AtomicBool::new(false),
        }
    }

    /// The record for `partition`, if the table has one.
    pub fn info(&self, partition: u32) -> Option<WaveInfo> {
        self.infos.get(partition as usize).copied()
    }

    /// Bit `i` set means partition `i` validated at boot.
    pub fn ready_mask(&self) -> u32 {
        self.ready_mask.load(Ordering::SeqCst)
    }

    /// Whether `partition` validated and still looks playable.
    pub fn partition_ready(&self, partition: u32) -> bool {
        if partition as usize >= self.infos.len() {
            return false;
        }
        if self.ready_mask() & (1 << partition) == 0 {
            return false;
        }
        let info = self.infos[partition as usize];
        info.sample_count > 0 && info.source_address != 0
    }

    /// Record whether continuous output has been started.
    pub fn mark_stream_started(&self, started: bool) {
        self.stream_started.store(started, Ordering::SeqCst);
    }

    /// Whether continuous output has been started.
    pub fn stream_started(&self) -> bool {
        self.stream_started.load(Ordering::SeqCst)
    }
}
