//! Waveform partition header.
//!
//! Every partition starts with a fixed 32-byte little-endian header
//! describing the 4-channel payload that follows it. A header that fails
//! any validation check marks the partition "not ready" — never a fatal
//! error, since stale or blank flash is an expected state.

use crate::config::CHANNEL_COUNT;
use crate::error::HeaderIssue;

/// Magic tag identifying the waveform partition format ("D8CW").
pub const WAVE_MAGIC: u32 = 0x4438_4357;

/// Current format version.
pub const WAVE_VERSION: u32 = 1;

/// Serialized header size in bytes.
pub const HEADER_BYTES: usize = 32;

/// Bytes per sample code.
const CODE_BYTES: u32 = 2;

/// Seed of the running payload checksum.
pub const CHECKSUM_SEED: u32 = 2_166_136_261;

/// Fold `data` into a running FNV-1a-style checksum.
pub fn checksum_update(checksum: u32, data: &[u8]) -> u32 {
    let mut value = checksum;
    for &byte in data {
        value = value.wrapping_mul(16_777_619) ^ u32::from(byte);
    }
    value
}

/// The 32-byte partition header, field for field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveHeader {
    /// Format tag; must equal [`WAVE_MAGIC`].
    pub magic: u32,
    /// Format version; must equal [`WAVE_VERSION`].
    pub version: u32,
    /// Payload sample rate in Hz.
    pub sample_rate_hz: u32,
    /// Sample frames in the payload.
    pub sample_count: u32,
    /// Channels per frame; must equal 4.
    pub channel_count: u32,
    /// Payload offset from the partition start, in bytes.
    pub data_offset: u32,
    /// Payload length in bytes.
    pub data_bytes: u32,
    /// Running checksum of the payload bytes.
    pub checksum: u32,
}

impl WaveHeader {
    /// Decode a header from its serialized little-endian form.
    pub fn from_bytes(bytes: &[u8; HEADER_BYTES]) -> Self {
        let field = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Self {
            magic: field(0),
            version: field(1),
            sample_rate_hz: field(2),
            sample_count: field(3),
            channel_count: field(4),
            data_offset: field(5),
            data_bytes: field(6),
            checksum: field(7),
        }
    }

    /// Encode the header into its serialized little-endian form.
    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let mut bytes = [0u8; HEADER_BYTES];
        let fields = [
            self.magic,
            self.version,
            self.sample_rate_hz,
            self.sample_count,
            self.channel_count,
            self.data_offset,
            self.data_bytes,
            self.checksum,
        ];
        for (i, value) in fields.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Check the header against the fixed partition size.
    pub fn validate(&self, max_region_bytes: u32) -> Result<(), HeaderIssue> {
        if self.magic != WAVE_MAGIC {
            return Err(HeaderIssue::Magic);
        }
        if self.version != WAVE_VERSION {
            return Err(HeaderIssue::Version);
        }
        if self.channel_count != CHANNEL_COUNT {
            return Err(HeaderIssue::ChannelCount);
        }
        if self.sample_rate_hz == 0 || self.sample_count == 0 {
            return Err(HeaderIssue::EmptyWave);
        }
        if self.data_offset < HEADER_BYTES as u32 {
            return Err(HeaderIssue::DataOffset);
        }

        let expected_bytes =
            u64::from(self.sample_count) * u64::from(CHANNEL_COUNT) * u64::from(CODE_BYTES);
        if u64::from(self.data_bytes) != expected_bytes {
            return Err(HeaderIssue::DataBytes);
        }

        let total_bytes = u64::from(self.data_offset) + u64::from(self.data_bytes);
        if total_bytes > u64::from(max_region_bytes) {
            return Err(HeaderIssue::RegionOverflow);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header(sample_count: u32) -> WaveHeader {
        WaveHeader {
            magic: WAVE_MAGIC,
            version: WAVE_VERSION,
            sample_rate_hz: 240_000,
            sample_count,
            channel_count: 4,
            data_offset: HEADER_BYTES as u32,
            data_bytes: sample_count * 8,
            checksum: 0,
        }
    }

    #[test]
    fn encode_decode_is_lossless() {
        let header = valid_header(1000);
        assert_eq!(WaveHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn valid_header_passes() {
        assert!(valid_header(1000).validate(0x0040_0000).is_ok());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let size = 0x0040_0000;

        let mut header = valid_header(1000);
        header.magic = 0xDEAD_BEEF;
        assert_eq!(header.validate(size), Err(HeaderIssue::Magic));

        let mut header = valid_header(1000);
        header.version = 2;
        assert_eq!(header.validate(size), Err(HeaderIssue::Version));

        let mut header = valid_header(1000);
        header.channel_count = 2;
        assert_eq!(header.validate(size), Err(HeaderIssue::ChannelCount));

        let mut header = valid_header(0);
        header.data_bytes = 0;
        assert_eq!(header.validate(size), Err(HeaderIssue::EmptyWave));

        let mut header = valid_header(1000);
        header.sample_rate_hz = 0;
        assert_eq!(header.validate(size), Err(HeaderIssue::EmptyWave));

        let mut header = valid_header(1000);
        header.data_offset = 16;
        assert_eq!(header.validate(size), Err(HeaderIssue::DataOffset));

        let mut header = valid_header(1000);
        header.data_bytes += 8;
        assert_eq!(header.validate(size), Err(HeaderIssue::DataBytes));

        // Payload exactly fills the partition: fine. One frame more: rejected.
        let frames = (size - HEADER_BYTES as u32) / 8;
        assert!(valid_header(frames).validate(size).is_ok());
        assert_eq!(
            valid_header(frames + 1).validate(size),
            Err(HeaderIssue::RegionOverflow)
        );
    }

    #[test]
    fn checksum_is_order_sensitive_and_corruption_sensitive() {
        let payload: Vec<u8> = (0u32..4096).map(|i| (i % 251) as u8).collect();

        let whole = checksum_update(CHECKSUM_SEED, &payload);
        let chunked = payload
            .chunks(100)
            .fold(CHECKSUM_SEED, checksum_update);
        assert_eq!(whole, chunked, "chunked accumulation must match");

        let mut corrupted = payload.clone();
        corrupted[1234] ^= 0x01;
        assert_ne!(whole, checksum_update(CHECKSUM_SEED, &corrupted));

        let mut swapped = payload;
        swapped.swap(0, 1);
        assert_ne!(whole, checksum_update(CHECKSUM_SEED, &swapped));
    }
}
