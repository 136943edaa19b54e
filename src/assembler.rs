// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame assembly from raw block packets.
//!
//! A [`FrameAssembler`] consumes one raw packet at a time, validates it
//! against the stream's [`Geometry`], converts its payload and accumulates it
//! into a frame buffer. When the final block of a sweep arrives the buffer is
//! finalized into a [`Frame`].
//!
//! Every validation failure is a local, logged drop: `ingest` never returns
//! an error and never hands out a partial frame. A block numbered 1 always
//! starts a fresh sweep, whatever happened before.

use crate::{
    buffer::FrameBuffer,
    formats,
    frame::Frame,
    geometry::Geometry,
    lidar::{DataFormat, timestamp},
    packet::RawPacket,
};
use log::{debug, trace, warn};

/// Per-reason packet counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Packets offered to `ingest`
    pub packets: u64,
    /// Frames completed
    pub frames: u64,
    /// Truncated or undecodable packets
    pub dropped_malformed: u64,
    /// Declared payload length did not match the geometry
    pub dropped_length: u64,
    /// Header or tail magic mismatch
    pub dropped_magic: u64,
    /// Data-format code did not match the stream format
    pub dropped_format: u64,
    /// Block index out of sequence
    pub dropped_sequence: u64,
    /// Conversion failed or the frame buffer would overflow
    pub dropped_overflow: u64,
    /// Partial sweeps discarded because a new sweep began
    pub discarded_partials: u64,
}

impl AssemblerStats {
    /// Total packets dropped for any reason.
    pub fn dropped(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_length
            + self.dropped_magic
            + self.dropped_format
            + self.dropped_sequence
            + self.dropped_overflow
    }
}

/// Reassembles block packets into frames for one active stream.
pub struct FrameAssembler {
    geometry: Geometry,
    format: DataFormat,
    /// Next block index accepted, 1-based
    expected_block: u16,
    /// In-progress sweep, allocated when block 1 arrives
    buffer: Option<FrameBuffer>,
    /// Next frame sequence number
    sequence: u64,
    stats: AssemblerStats,
}

impl FrameAssembler {
    /// Create an assembler for a resolved geometry and output format.
    pub fn new(geometry: Geometry, format: DataFormat) -> Self {
        Self {
            geometry,
            format,
            expected_block: 1,
            buffer: None,
            sequence: 0,
            stats: AssemblerStats::default(),
        }
    }

    /// Discard any in-progress sweep and wait for the next block 1.
    pub fn reset(&mut self) {
        if let Some(buffer) = self.buffer.take()
            && !buffer.is_empty()
        {
            debug!("reset discards partial frame of {} bytes", buffer.len());
        }
        self.expected_block = 1;
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Block index the assembler is waiting for.
    pub fn expected_block(&self) -> u16 {
        self.expected_block
    }

    /// Bytes written into the in-progress sweep.
    pub fn offset(&self) -> usize {
        self.buffer.as_ref().map_or(0, FrameBuffer::len)
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Ingest one raw packet, returning a frame when a sweep completes.
    pub fn ingest(&mut self, data: &[u8]) -> Option<Frame> {
        self.stats.packets += 1;

        let packet = match RawPacket::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dropping packet: {}", err);
                self.stats.dropped_malformed += 1;
                return None;
            }
        };
        let header = packet.header;

        let expected_len = self.geometry.block_payload_size();
        if header.payload_len as usize != expected_len {
            warn!(
                "dropping block {}: payload length {} does not match expected {}",
                header.block_index, header.payload_len, expected_len
            );
            self.stats.dropped_length += 1;
            return None;
        }

        if !header.has_valid_magic() || !packet.has_valid_tail() {
            warn!(
                "dropping block {}: invalid magic (header {:02x?}, tail {:02x?})",
                header.block_index, header.magic, packet.tail
            );
            self.stats.dropped_magic += 1;
            return None;
        }

        if header.format_code != self.format.code() {
            warn!(
                "dropping block {}: format code {:#04x} does not match {} ({:#04x})",
                header.block_index,
                header.format_code,
                self.format,
                self.format.code()
            );
            self.stats.dropped_format += 1;
            return None;
        }

        let block = header.block_index;
        if block != self.expected_block && block != 1 {
            warn!(
                "dropping block {} of sweep {}: expected block {}, waiting for next sweep",
                block, header.sweep_index, self.expected_block
            );
            self.expected_block = 1;
            self.stats.dropped_sequence += 1;
            return None;
        }

        if block == 1 {
            if let Some(partial) = self.buffer.as_ref()
                && !partial.is_empty()
            {
                warn!(
                    "sweep {} restarted, discarding partial frame of {} bytes",
                    header.sweep_index,
                    partial.len()
                );
                self.stats.discarded_partials += 1;
            }
            self.buffer = Some(FrameBuffer::with_capacity(
                self.geometry.total_frame_byte_size,
            ));
        }

        let Some(buffer) = self.buffer.as_mut() else {
            warn!("dropping block {}: no sweep in progress", block);
            self.expected_block = 1;
            self.stats.dropped_sequence += 1;
            return None;
        };

        let format = self.format;
        let points = self.geometry.points_per_block;
        if let Err(err) = buffer.write_with(self.geometry.block_output_size(), |out| {
            formats::convert_block(format, packet.payload, points, out)
        }) {
            warn!("dropping block {}: {}", block, err);
            self.stats.dropped_overflow += 1;
            return None;
        }

        // The wire timestamp is not trusted; frames are stamped on receipt.
        let receipt_ns = timestamp().unwrap_or_default();

        if block >= self.geometry.max_blocks_per_frame {
            let data = self.buffer.take().map(FrameBuffer::freeze)?;
            let sequence = self.sequence;
            self.sequence += 1;
            self.expected_block = 1;
            self.stats.frames += 1;
            trace!(
                "frame {} complete: sweep {}, {} bytes",
                sequence,
                header.sweep_index,
                data.len()
            );
            return Some(Frame::new(format, data, receipt_ns, sequence, header));
        }

        self.expected_block = block + 1;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::GeometryTable,
        lidar::{ModelClass, ScanRate, WorkMode},
        packet::{BlockBuilder, HEADER_LEN},
    };

    fn scan_setup() -> (FrameAssembler, BlockBuilder, Geometry) {
        let geometry = GeometryTable::new()
            .resolve(
                ModelClass::SingleLine,
                ScanRate::Hz10,
                DataFormat::Scan,
                WorkMode::Normal,
            )
            .unwrap();
        let builder = BlockBuilder::new(0x0101, ScanRate::Hz10, DataFormat::Scan);
        (
            FrameAssembler::new(geometry, DataFormat::Scan),
            builder,
            geometry,
        )
    }

    #[test]
    fn test_in_order_sweep_completes_on_last_block() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        let n = blocks.len();
        assert_eq!(n, 18);

        for (i, block) in blocks.iter().enumerate() {
            let result = asm.ingest(block);
            if i + 1 < n {
                assert!(result.is_none(), "frame emitted early at block {}", i + 1);
                assert_eq!(asm.expected_block(), i as u16 + 2);
                assert_eq!(asm.offset(), (i + 1) * geometry.block_output_size());
            } else {
                let frame = result.expect("frame on final block");
                assert_eq!(frame.byte_size(), n * geometry.block_output_size());
                assert_eq!(frame.byte_size(), geometry.total_frame_byte_size);
                assert_eq!(frame.point_count(), 3600);
                assert_eq!(frame.sequence(), 0);
            }
        }

        assert_eq!(asm.expected_block(), 1);
        assert_eq!(asm.offset(), 0);
        assert_eq!(asm.stats().frames, 1);
        assert_eq!(asm.stats().dropped(), 0);
    }

    #[test]
    fn test_consecutive_sweeps_are_independent() {
        let (mut asm, builder, geometry) = scan_setup();
        let mut frames = Vec::new();
        for sweep in 0..3 {
            for block in builder.sweep(&geometry, sweep) {
                if let Some(frame) = asm.ingest(&block) {
                    frames.push(frame);
                }
            }
        }
        assert_eq!(frames.len(), 3);
        let seqs: Vec<_> = frames.iter().map(Frame::sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(frames[2].header().sweep_index, 2);
    }

    #[test]
    fn test_block_one_restarts_partial_sweep() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);

        for block in &blocks[..5] {
            assert!(asm.ingest(block).is_none());
        }
        assert_eq!(asm.offset(), 5 * geometry.block_output_size());

        // New sweep starts before the previous one completed
        let restart = builder.sweep(&geometry, 1);
        assert!(asm.ingest(&restart[0]).is_none());
        assert_eq!(asm.offset(), geometry.block_output_size());
        assert_eq!(asm.expected_block(), 2);
        assert_eq!(asm.stats().discarded_partials, 1);

        let mut frame = None;
        for block in &restart[1..] {
            frame = asm.ingest(block);
        }
        let frame = frame.expect("restarted sweep completes");
        assert_eq!(frame.byte_size(), geometry.total_frame_byte_size);
        assert_eq!(frame.header().sweep_index, 1);
    }

    #[test]
    fn test_repeated_restarts_do_not_grow() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        for _ in 0..100 {
            asm.ingest(&blocks[0]);
            asm.ingest(&blocks[1]);
            assert!(asm.offset() <= geometry.total_frame_byte_size);
        }
        assert_eq!(asm.offset(), 2 * geometry.block_output_size());
        assert_eq!(asm.stats().discarded_partials, 99);
    }

    #[test]
    fn test_corrupt_header_magic_dropped() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        asm.ingest(&blocks[0]);
        asm.ingest(&blocks[1]);
        let (expected, offset) = (asm.expected_block(), asm.offset());

        let mut bad = blocks[2].clone();
        bad[0] ^= 0xff;
        assert!(asm.ingest(&bad).is_none());
        assert_eq!(asm.expected_block(), expected);
        assert_eq!(asm.offset(), offset);
        assert_eq!(asm.stats().dropped_magic, 1);
    }

    #[test]
    fn test_corrupt_tail_magic_dropped() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        asm.ingest(&blocks[0]);
        let (expected, offset) = (asm.expected_block(), asm.offset());

        let mut bad = blocks[1].clone();
        let last = bad.len() - 1;
        bad[last] = 0x00;
        assert!(asm.ingest(&bad).is_none());
        assert_eq!(asm.expected_block(), expected);
        assert_eq!(asm.offset(), offset);

        // Sweep continues with the intact block
        assert!(asm.ingest(&blocks[1]).is_none());
        assert_eq!(asm.expected_block(), 3);
    }

    #[test]
    fn test_format_mismatch_dropped() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        asm.ingest(&blocks[0]);
        asm.ingest(&blocks[1]);
        let (expected, offset) = (asm.expected_block(), asm.offset());

        let wrong = builder
            .clone()
            .format_code(DataFormat::Point.code())
            .encode(0, 3, &crate::packet::synthetic_payload(
                Some(DataFormat::Scan),
                &geometry,
                3,
            ));
        assert!(asm.ingest(&wrong).is_none());
        assert_eq!(asm.expected_block(), expected);
        assert_eq!(asm.offset(), offset);
        assert_eq!(asm.stats().dropped_format, 1);
    }

    #[test]
    fn test_payload_length_mismatch_dropped() {
        let (mut asm, builder, _) = scan_setup();
        let short = builder.encode(0, 1, &[0u8; 16]);
        assert!(asm.ingest(&short).is_none());
        assert_eq!(asm.expected_block(), 1);
        assert_eq!(asm.offset(), 0);
        assert_eq!(asm.stats().dropped_length, 1);
    }

    #[test]
    fn test_truncated_packet_dropped() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        assert!(asm.ingest(&blocks[0][..HEADER_LEN + 10]).is_none());
        assert!(asm.ingest(&[0u8; 3]).is_none());
        assert_eq!(asm.stats().dropped_malformed, 2);
        assert_eq!(asm.offset(), 0);
    }

    #[test]
    fn test_out_of_sequence_resets_expected_block() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        for block in &blocks[..3] {
            asm.ingest(block);
        }
        let offset = asm.offset();

        // Block 4 lost, block 5 arrives
        assert!(asm.ingest(&blocks[4]).is_none());
        assert_eq!(asm.expected_block(), 1);
        assert_eq!(asm.offset(), offset);
        assert_eq!(asm.stats().dropped_sequence, 1);

        // Remainder of the broken sweep is dropped
        for block in &blocks[5..] {
            assert!(asm.ingest(block).is_none());
        }

        // Next sweep assembles cleanly
        let mut frame = None;
        for block in builder.sweep(&geometry, 1) {
            frame = asm.ingest(&block);
        }
        assert!(frame.is_some());
        assert_eq!(asm.stats().frames, 1);
    }

    #[test]
    fn test_stream_joined_mid_sweep() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        for block in &blocks[9..] {
            assert!(asm.ingest(block).is_none());
        }
        assert_eq!(asm.stats().frames, 0);
        assert_eq!(asm.offset(), 0);
    }

    #[test]
    fn test_reset_discards_in_progress() {
        let (mut asm, builder, geometry) = scan_setup();
        let blocks = builder.sweep(&geometry, 0);
        asm.ingest(&blocks[0]);
        asm.ingest(&blocks[1]);
        asm.reset();
        assert_eq!(asm.expected_block(), 1);
        assert_eq!(asm.offset(), 0);
        assert!(asm.ingest(&blocks[2]).is_none());
    }

    #[test]
    fn test_multi_line_point_frame() {
        let geometry = GeometryTable::new()
            .resolve(
                ModelClass::MultiLine,
                ScanRate::Hz20,
                DataFormat::Point,
                WorkMode::Normal,
            )
            .unwrap();
        let builder = BlockBuilder::new(0x0201, ScanRate::Hz20, DataFormat::Point);
        let mut asm = FrameAssembler::new(geometry, DataFormat::Point);

        let mut frame = None;
        for block in builder.sweep(&geometry, 5) {
            frame = asm.ingest(&block);
        }
        let frame = frame.unwrap();
        assert_eq!(frame.point_count(), 120 * 150);
        for p in formats::points(frame.data()).take(200) {
            let range = (p.x * p.x + p.y * p.y + p.z * p.z).sqrt();
            assert!((range - 5000.0).abs() < 1.0, "range {}", range);
        }
    }
}
