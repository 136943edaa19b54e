// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Raw block packet decoding and encoding.
//!
//! # Packet Structure
//!
//! Every hardware packet carries one block of a sweep:
//! - Header: 40 bytes, network byte order
//! - Payload: `payload_len` bytes, format-specific (see [`crate::formats`])
//! - Tail: 4 bytes of magic
//!
//! ```text
//!  0      6     8      10   11   12     14      18         26   27  28    30    32    34   36   40
//! ┌──────┬─────┬──────┬────┬────┬──────┬───────┬──────────┬────┬───┬─────┬─────┬─────┬────┬────┐
//! │magic │ len │model │rate│fmt │block │ sweep │ wire ts  │sync│rsv│warn │speed│vrate│temp│rsv │
//! └──────┴─────┴──────┴────┴────┴──────┴───────┴──────────┴────┴───┴─────┴─────┴─────┴────┴────┘
//! ```
//!
//! Fields are read one at a time from bounds-checked offsets; packets are
//! never overlaid onto structs.

use crate::{
    formats,
    geometry::Geometry,
    lidar::{DataFormat, Error, Result, ScanRate},
};

/// Header magic: "LDSTRM"
pub const HEADER_MAGIC: [u8; 6] = [0x4c, 0x44, 0x53, 0x54, 0x52, 0x4d];

/// Tail magic following the payload
pub const TAIL_MAGIC: [u8; 4] = [0xa5, 0x5a, 0x0f, 0xf0];

/// Header size in bytes
pub const HEADER_LEN: usize = 40;

/// Tail size in bytes
pub const TAIL_LEN: usize = 4;

/// Decoded block header, in host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 6],
    /// Declared payload length in bytes
    pub payload_len: u16,
    /// Model/variant code
    pub model_code: u16,
    pub scan_rate_code: u8,
    pub format_code: u8,
    /// 1-based block index within the sweep
    pub block_index: u16,
    /// Sweep counter, increments once per sweep
    pub sweep_index: u32,
    /// Device timestamp in microseconds.
    ///
    /// Not used for frame timing: the firmware clock is not trustworthy
    /// across the supported device family.
    pub wire_timestamp_us: u64,
    pub sync_mode: u8,
    pub warning_flags: u16,
    /// Measured motor speed in rpm
    pub scan_speed: u16,
    /// Vertical scan rate in 0.01 Hz
    pub vertical_rate: u16,
    /// Temperature in 0.01 °C
    pub temperature: i16,
}

impl Header {
    pub const LEN: usize = HEADER_LEN;

    /// Decode a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::UnexpectedEnd(data.len()));
        }

        let mut magic = [0u8; 6];
        magic.copy_from_slice(&data[0..6]);

        Ok(Header {
            magic,
            payload_len: u16::from_be_bytes([data[6], data[7]]),
            model_code: u16::from_be_bytes([data[8], data[9]]),
            scan_rate_code: data[10],
            format_code: data[11],
            block_index: u16::from_be_bytes([data[12], data[13]]),
            sweep_index: u32::from_be_bytes([data[14], data[15], data[16], data[17]]),
            wire_timestamp_us: u64::from_be_bytes([
                data[18], data[19], data[20], data[21], data[22], data[23], data[24], data[25],
            ]),
            sync_mode: data[26],
            warning_flags: u16::from_be_bytes([data[28], data[29]]),
            scan_speed: u16::from_be_bytes([data[30], data[31]]),
            vertical_rate: u16::from_be_bytes([data[32], data[33]]),
            temperature: i16::from_be_bytes([data[34], data[35]]),
        })
    }

    /// Encode the header into its 40-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..6].copy_from_slice(&self.magic);
        out[6..8].copy_from_slice(&self.payload_len.to_be_bytes());
        out[8..10].copy_from_slice(&self.model_code.to_be_bytes());
        out[10] = self.scan_rate_code;
        out[11] = self.format_code;
        out[12..14].copy_from_slice(&self.block_index.to_be_bytes());
        out[14..18].copy_from_slice(&self.sweep_index.to_be_bytes());
        out[18..26].copy_from_slice(&self.wire_timestamp_us.to_be_bytes());
        out[26] = self.sync_mode;
        out[28..30].copy_from_slice(&self.warning_flags.to_be_bytes());
        out[30..32].copy_from_slice(&self.scan_speed.to_be_bytes());
        out[32..34].copy_from_slice(&self.vertical_rate.to_be_bytes());
        out[34..36].copy_from_slice(&self.temperature.to_be_bytes());
        out
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == HEADER_MAGIC
    }

    /// Data format named by the header, if known.
    pub fn format(&self) -> Option<DataFormat> {
        DataFormat::from_code(self.format_code)
    }

    /// Temperature in degrees Celsius.
    pub fn temperature_celsius(&self) -> f32 {
        self.temperature as f32 / 100.0
    }
}

/// A decoded block: header plus borrowed payload and tail.
#[derive(Clone, Copy, Debug)]
pub struct RawPacket<'a> {
    pub header: Header,
    pub payload: &'a [u8],
    pub tail: [u8; TAIL_LEN],
}

impl<'a> RawPacket<'a> {
    /// Split `data` into header, payload and tail using the declared length.
    ///
    /// Only the framing is checked here; magic and format validation is left
    /// to the caller so that each failure can be reported separately.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = Header::parse(data)?;
        let payload_end = HEADER_LEN + header.payload_len as usize;
        let packet_end = payload_end + TAIL_LEN;
        if data.len() < packet_end {
            return Err(Error::InvalidPacket(format!(
                "truncated packet: {} bytes, header declares {}",
                data.len(),
                packet_end
            )));
        }

        let mut tail = [0u8; TAIL_LEN];
        tail.copy_from_slice(&data[payload_end..packet_end]);

        Ok(RawPacket {
            header,
            payload: &data[HEADER_LEN..payload_end],
            tail,
        })
    }

    pub fn has_valid_tail(&self) -> bool {
        self.tail == TAIL_MAGIC
    }
}

/// One multi-line wire sample before quantization.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WireSample {
    pub distance_mm: f32,
    pub azimuth_deg: f32,
    pub elevation_deg: f32,
    pub intensity: u8,
}

/// Encode multi-line samples into a Point/SpherePoint payload.
pub fn encode_point_payload(samples: &[WireSample]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 8);
    for s in samples {
        let d = (s.distance_mm / formats::DISTANCE_RESOLUTION_MM).round() as u16;
        let a = (s.azimuth_deg.rem_euclid(360.0) / formats::ANGLE_RESOLUTION_DEG).round() as u16;
        let e = (s.elevation_deg / formats::ANGLE_RESOLUTION_DEG).round() as i16;
        out.extend_from_slice(&d.to_be_bytes());
        out.extend_from_slice(&a.to_be_bytes());
        out.extend_from_slice(&e.to_be_bytes());
        out.push(s.intensity);
        out.push(0);
    }
    out
}

/// Encode a single-line scan payload.
///
/// `start_centideg` is in 0.01°, `step_millideg` in 0.001°, and each sample
/// is a (distance in 0.25 mm units, intensity) pair.
pub fn encode_scan_payload(start_centideg: u16, step_millideg: u16, samples: &[(u16, u8)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + samples.len() * 4);
    out.extend_from_slice(&start_centideg.to_be_bytes());
    out.extend_from_slice(&step_millideg.to_be_bytes());
    for (distance, intensity) in samples {
        out.extend_from_slice(&distance.to_be_bytes());
        out.push(*intensity);
        out.push(0);
    }
    out
}

/// Builds complete block packets for a fixed stream configuration.
///
/// Used by the synthetic source, the benchmarks and the tests.
#[derive(Clone, Debug)]
pub struct BlockBuilder {
    template: Header,
}

impl BlockBuilder {
    pub fn new(model_code: u16, rate: ScanRate, format: DataFormat) -> Self {
        Self {
            template: Header {
                magic: HEADER_MAGIC,
                payload_len: 0,
                model_code,
                scan_rate_code: rate.code(),
                format_code: format.code(),
                block_index: 1,
                sweep_index: 0,
                wire_timestamp_us: 0,
                sync_mode: 0,
                warning_flags: 0,
                scan_speed: rate.rpm(),
                vertical_rate: 0,
                temperature: 2500,
            },
        }
    }

    pub fn sync_mode(mut self, mode: u8) -> Self {
        self.template.sync_mode = mode;
        self
    }

    pub fn warning_flags(mut self, flags: u16) -> Self {
        self.template.warning_flags = flags;
        self
    }

    pub fn temperature(mut self, centi_celsius: i16) -> Self {
        self.template.temperature = centi_celsius;
        self
    }

    /// Override the format code, e.g. to build deliberately mis-typed blocks.
    pub fn format_code(mut self, code: u8) -> Self {
        self.template.format_code = code;
        self
    }

    /// Encode one block packet.
    pub fn encode(&self, sweep_index: u32, block_index: u16, payload: &[u8]) -> Vec<u8> {
        let header = Header {
            payload_len: payload.len() as u16,
            block_index,
            sweep_index,
            wire_timestamp_us: sweep_index as u64 * 100_000 + block_index as u64,
            ..self.template
        };

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TAIL_LEN);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(&TAIL_MAGIC);
        out
    }

    /// Encode every block of one sweep with a deterministic synthetic payload.
    pub fn sweep(&self, geometry: &Geometry, sweep_index: u32) -> Vec<Vec<u8>> {
        let format = DataFormat::from_code(self.template.format_code);
        (1..=geometry.max_blocks_per_frame)
            .map(|block| {
                let payload = synthetic_payload(format, geometry, block);
                self.encode(sweep_index, block, &payload)
            })
            .collect()
    }
}

/// Deterministic payload for one block: a 10 m circle for scans, a
/// cylinder for point formats and a byte ramp for calibration.
pub fn synthetic_payload(format: Option<DataFormat>, geometry: &Geometry, block: u16) -> Vec<u8> {
    let n = geometry.points_per_block;
    let first = (block as usize - 1) * n;
    match format {
        Some(DataFormat::Scan) => {
            let total = n * geometry.max_blocks_per_frame as usize;
            let step = (360_000 / total) as u16;
            let start = ((first as u32 * step as u32) / 10) as u16;
            let samples: Vec<_> = (0..n).map(|i| (40_000u16, (i % 256) as u8)).collect();
            encode_scan_payload(start, step, &samples)
        }
        Some(DataFormat::Point) | Some(DataFormat::SpherePoint) => {
            let total = n * geometry.max_blocks_per_frame as usize;
            let samples: Vec<_> = (0..n)
                .map(|i| WireSample {
                    distance_mm: 5_000.0,
                    azimuth_deg: (first + i) as f32 * 360.0 / total as f32,
                    elevation_deg: ((i % 16) as f32 - 8.0) * 2.0,
                    intensity: (i % 256) as u8,
                })
                .collect();
            encode_point_payload(&samples)
        }
        _ => (0..geometry.block_payload_size())
            .map(|i| (i % 251) as u8)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            magic: HEADER_MAGIC,
            payload_len: 8,
            model_code: 0x0201,
            scan_rate_code: 0x02,
            format_code: 0x20,
            block_index: 3,
            sweep_index: 0x0102_0304,
            wire_timestamp_us: 0x0a0b_0c0d_0e0f_1011,
            sync_mode: 4,
            warning_flags: 0x8001,
            scan_speed: 600,
            vertical_rate: 1000,
            temperature: -1250,
        }
    }

    #[test]
    fn test_header_big_endian_fields() {
        let bytes = sample_header().to_bytes();
        assert_eq!(&bytes[0..6], b"LDSTRM");
        assert_eq!(&bytes[12..14], &[0x00, 0x03]);
        assert_eq!(&bytes[14..18], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[34..36], &(-1250i16).to_be_bytes());
    }

    #[test]
    fn test_header_decode() {
        let header = Header::parse(&sample_header().to_bytes()).unwrap();
        assert_eq!(header.block_index, 3);
        assert_eq!(header.sweep_index, 0x0102_0304);
        assert_eq!(header.wire_timestamp_us, 0x0a0b_0c0d_0e0f_1011);
        assert_eq!(header.format(), Some(DataFormat::Point));
        assert!((header.temperature_celsius() + 12.5).abs() < 1e-6);
        assert!(header.has_valid_magic());
    }

    #[test]
    fn test_header_too_short() {
        assert!(matches!(
            Header::parse(&[0u8; 12]),
            Err(Error::UnexpectedEnd(12))
        ));
    }

    #[test]
    fn test_raw_packet_split() {
        let builder = BlockBuilder::new(0x0201, ScanRate::Hz10, DataFormat::Point);
        let packet = builder.encode(7, 2, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(packet.len(), HEADER_LEN + 8 + TAIL_LEN);

        let raw = RawPacket::parse(&packet).unwrap();
        assert_eq!(raw.payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(raw.has_valid_tail());
        assert_eq!(raw.header.sweep_index, 7);
        assert_eq!(raw.header.block_index, 2);
    }

    #[test]
    fn test_raw_packet_truncated() {
        let builder = BlockBuilder::new(0x0201, ScanRate::Hz10, DataFormat::Point);
        let packet = builder.encode(0, 1, &[0u8; 16]);
        let result = RawPacket::parse(&packet[..packet.len() - 1]);
        assert!(matches!(result, Err(Error::InvalidPacket(_))));
    }

    #[test]
    fn test_point_payload_quantization() {
        let payload = encode_point_payload(&[WireSample {
            distance_mm: 1000.0,
            azimuth_deg: -90.0,
            elevation_deg: -15.0,
            intensity: 200,
        }]);
        assert_eq!(payload.len(), 8);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 4000);
        assert_eq!(u16::from_be_bytes([payload[2], payload[3]]), 27000);
        assert_eq!(i16::from_be_bytes([payload[4], payload[5]]), -1500);
        assert_eq!(payload[6], 200);
    }
}
