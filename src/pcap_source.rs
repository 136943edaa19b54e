// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! PCAP file packet source for offline replay.
//!
//! [`PcapSource`] extracts the UDP payloads of a PCAP/PCAPNG capture and
//! replays them through a [`ReplaySource`], so recorded device traffic runs
//! through the same stream pipeline as live traffic.
//!
//! # Example
//!
//! ```ignore
//! use edgefirst_lidarstream::pcap_source::PcapSource;
//! use std::time::Duration;
//!
//! // Load the capture, keeping only the device data port
//! let source = PcapSource::from_file("sensor_data.pcap", Some(2368))?
//!     .with_interval(Duration::from_micros(500));
//! stream.start(profile, callback)?; // stream built around `source`
//! ```

use crate::{
    lidar::{Error, Result},
    packet_source::{PacketCallback, RawPacketSource, ReplaySource},
};
use log::debug;
use pcap_parser::traits::PcapReaderIterator;
use std::{path::Path, time::Duration};

/// Packet source replaying the UDP payloads of a capture file.
///
/// The whole capture is loaded into memory. Both legacy PCAP and PCAPNG
/// are supported.
pub struct PcapSource {
    replay: ReplaySource,
}

impl PcapSource {
    /// Load a capture from disk, optionally filtering by port.
    ///
    /// The port filter matches either the source or the destination port.
    pub fn from_file<P: AsRef<Path>>(path: P, port: Option<u16>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::from_bytes(&data, port)
    }

    /// Load a capture from bytes, optionally filtering by port.
    pub fn from_bytes(data: &[u8], port: Option<u16>) -> Result<Self> {
        let packets = extract_packets(data, port)?;
        debug!("pcap source loaded {} udp payloads", packets.len());
        Ok(Self {
            replay: ReplaySource::new(packets),
        })
    }

    /// Delay between consecutive packets.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.replay = self.replay.with_interval(interval);
        self
    }

    /// Replay the capture continuously.
    pub fn looping(mut self, looping: bool) -> Self {
        self.replay = self.replay.looping(looping);
        self
    }

    /// Get the total number of packets.
    pub fn len(&self) -> usize {
        self.replay.len()
    }

    /// Check if the capture contained no matching packets.
    pub fn is_empty(&self) -> bool {
        self.replay.is_empty()
    }

    /// Packets delivered so far.
    pub fn delivered(&self) -> u64 {
        self.replay.delivered()
    }
}

impl RawPacketSource for PcapSource {
    fn start(&self, on_packet: PacketCallback) -> Result<()> {
        self.replay.start(on_packet)
    }

    fn stop(&self) -> Result<()> {
        self.replay.stop()
    }
}

/// Extract UDP payloads from PCAP or PCAPNG data.
fn extract_packets(data: &[u8], port: Option<u16>) -> Result<Vec<Vec<u8>>> {
    let mut packets = Vec::new();

    // PCAPNG starts with a Section Header Block
    if data.len() >= 4 && data[0..4] == [0x0a, 0x0d, 0x0d, 0x0a] {
        extract_pcapng(data, port, &mut packets)?;
    } else {
        extract_legacy_pcap(data, port, &mut packets)?;
    }

    Ok(packets)
}

fn extract_legacy_pcap(data: &[u8], port: Option<u16>, packets: &mut Vec<Vec<u8>>) -> Result<()> {
    use pcap_parser::*;

    // Buffer must hold the whole capture to avoid Incomplete errors
    let mut reader = LegacyPcapReader::new(data.len().max(65536), data)
        .map_err(|e| Error::Source(format!("failed to create PCAP reader: {:?}", e)))?;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                if let PcapBlockOwned::Legacy(packet) = block
                    && let Some(payload) = extract_udp_payload(packet.data, port)
                {
                    packets.push(payload);
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) | Err(PcapError::Incomplete(_)) => break,
            Err(e) => return Err(Error::Source(format!("PCAP parse error: {:?}", e))),
        }
    }

    Ok(())
}

fn extract_pcapng(data: &[u8], port: Option<u16>, packets: &mut Vec<Vec<u8>>) -> Result<()> {
    use pcap_parser::*;

    let mut reader = PcapNGReader::new(data.len().max(65536), data)
        .map_err(|e| Error::Source(format!("failed to create PCAPNG reader: {:?}", e)))?;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let payload = match block {
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        extract_udp_payload(epb.data, port)
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        extract_udp_payload(spb.data, port)
                    }
                    _ => None,
                };
                if let Some(payload) = payload {
                    packets.push(payload);
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) | Err(PcapError::Incomplete(_)) => break,
            Err(e) => return Err(Error::Source(format!("PCAPNG parse error: {:?}", e))),
        }
    }

    Ok(())
}

/// Extract the UDP payload of one Ethernet frame.
fn extract_udp_payload(data: &[u8], port: Option<u16>) -> Option<Vec<u8>> {
    use etherparse::{SlicedPacket, TransportSlice};

    let packet = SlicedPacket::from_ethernet(data).ok()?;
    let udp = match packet.transport {
        Some(TransportSlice::Udp(udp)) => udp,
        _ => return None,
    };

    if let Some(filter_port) = port
        && udp.source_port() != filter_port
        && udp.destination_port() != filter_port
    {
        return None;
    }

    let payload = udp.payload();
    if payload.is_empty() {
        return None;
    }
    Some(payload.to_vec())
}
