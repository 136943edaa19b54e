// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::{Parser, ValueEnum};
use edgefirst_lidarstream::{DataFormat, ScanRate, StreamType, SyncMode};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

/// Where packets come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Generated sweeps replayed at the configured scan rate
    Synthetic,
    /// Live packets received on a UDP socket
    Udp,
    /// Packets extracted from a pcap or pcapng capture
    Pcap,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Packet source.
    #[arg(long, env, default_value = "synthetic")]
    pub source: SourceKind,

    /// UDP bind address for the udp source or capture file for the pcap
    /// source.  Unused by the synthetic source.
    #[arg(env)]
    pub target: Option<String>,

    /// UDP destination port to keep when reading a capture.
    #[arg(long, env, default_value = "6699")]
    pub port: u16,

    /// Raw model/variant code reported by the device, for example 0x0201.
    #[arg(long, env, default_value = "0x0101", value_parser = parse_model_code)]
    pub model_code: u16,

    /// Stream type to open.
    #[arg(long, env, default_value = "lidar")]
    pub stream_type: StreamType,

    /// Sweep rate in Hz.
    #[arg(long, env, default_value = "10")]
    pub rate: ScanRate,

    /// Output data format.
    #[arg(long, env, default_value = "scan")]
    pub format: DataFormat,

    /// Multi-device sync mode.  Triggered modes suppress stall recovery.
    #[arg(long, env, default_value = "free-run")]
    pub sync_mode: SyncMode,

    /// JSON stream configuration file.
    #[arg(long, env)]
    pub config: Option<PathBuf>,

    /// Record delivered frames to this file.
    #[arg(long, env)]
    pub record: Option<PathBuf>,

    /// Zero points closer than this range, in millimeters.
    #[arg(long, env)]
    pub min_range: Option<f32>,

    /// Zero points further than this range, in millimeters.
    #[arg(long, env)]
    pub max_range: Option<f32>,

    /// Stop after this many frames.
    #[arg(long, env)]
    pub frames: Option<u64>,

    /// Stop after this many seconds.
    #[arg(long, env)]
    pub duration: Option<u64>,

    /// Application log level
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,
}

fn parse_model_code(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|err| format!("invalid model code {}: {}", s, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_code() {
        assert_eq!(parse_model_code("0x0201"), Ok(0x0201));
        assert_eq!(parse_model_code("257"), Ok(0x0101));
        assert!(parse_model_code("0xzz").is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["lidarstream"]);
        assert_eq!(args.source, SourceKind::Synthetic);
        assert_eq!(args.model_code, 0x0101);
        assert_eq!(args.rate, ScanRate::Hz10);
        assert_eq!(args.format, DataFormat::Scan);
        assert_eq!(args.sync_mode, SyncMode::FreeRun);
    }

    #[test]
    fn test_pcap_args() {
        let args = Args::parse_from([
            "lidarstream",
            "--source",
            "pcap",
            "capture.pcap",
            "--format",
            "sphere-point",
            "--rate",
            "20",
            "--model-code",
            "0x0202",
        ]);
        assert_eq!(args.source, SourceKind::Pcap);
        assert_eq!(args.target.as_deref(), Some("capture.pcap"));
        assert_eq!(args.format, DataFormat::SpherePoint);
        assert_eq!(args.rate, ScanRate::Hz20);
        assert_eq!(args.model_code, 0x0202);
    }
}
