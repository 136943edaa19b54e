// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::{Args, SourceKind};
use clap::Parser as _;
use edgefirst_lidarstream::{
    DeviceContext, Error, GeometryTable, RawPacketSource, ReplaySource, SensorStream,
    StaticSyncConfig, StreamConfig, StreamProfile, StreamState, UdpSource,
    packet::BlockBuilder,
    processor::RangeGate,
    recorder::FileRecorder,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sweeps generated for the synthetic source before it loops.
const SYNTHETIC_SWEEPS: u32 = 8;

/// Default bind address for the udp source.
const DEFAULT_UDP_BIND: &str = "0.0.0.0:6699";

/// Summary of a delivered frame, handed from the delivery thread to main.
struct FrameSummary {
    sequence: u64,
    points: usize,
    device_timestamp_us: u64,
    global_timestamp_us: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(args.rust_log.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &args.config {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };
    debug!("{:?}", config);

    let sync = Arc::new(StaticSyncConfig::new(args.sync_mode));
    let device = Arc::new(DeviceContext::new(args.model_code, sync)?);
    let table = Arc::new(GeometryTable::new());
    let source = open_source(&args, &device, &table)?;

    let stream = SensorStream::new(args.stream_type, device, table, source, &config)?;
    stream.add_state_listener(|state, profile| match profile {
        Some(profile) => info!("stream {} ({:?})", state, profile),
        None => info!("stream {}", state),
    });

    let recorder = match &args.record {
        Some(path) => {
            let recorder = Arc::new(FileRecorder::create(path, config.recorder.queue_depth)?);
            stream.set_recorder(Some(recorder.clone()));
            Some(recorder)
        }
        None => None,
    };

    if args.min_range.is_some() || args.max_range.is_some() {
        let gate = RangeGate::new(
            args.min_range.unwrap_or(0.0),
            args.max_range.unwrap_or(f32::MAX),
        )?;
        stream.set_frame_processor(Some(Box::new(gate)));
    }

    let (tx, rx) = kanal::bounded(64);
    let profile = StreamProfile::new(args.stream_type, args.format, args.rate);
    stream.start(profile, move |frame| {
        let summary = FrameSummary {
            sequence: frame.sequence(),
            points: frame.point_count(),
            device_timestamp_us: frame.device_timestamp_us(),
            global_timestamp_us: frame.global_timestamp_us(),
        };
        // Never block delivery on a slow console.
        let _ = tx.try_send(summary);
    })?;

    let deadline = args.duration.map(|s| Instant::now() + Duration::from_secs(s));
    let mut received = 0u64;
    loop {
        if args.frames.is_some_and(|n| received >= n) {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if stream.state() == StreamState::Error {
            error!("stream failed and could not be recovered");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(summary) => {
                received += 1;
                info!(
                    "frame {} points={} device_ts={}us global_ts={}us",
                    summary.sequence,
                    summary.points,
                    summary.device_timestamp_us,
                    summary.global_timestamp_us
                );
            }
            Err(kanal::ReceiveErrorTimeout::Timeout) => {}
            Err(err) => {
                warn!("frame channel closed: {}", err);
                break;
            }
        }
    }

    stream.stop()?;
    info!("stream stats: {:?}", stream.stats());
    info!("assembler stats: {:?}", stream.assembler_stats());
    drop(stream);

    if let Some(recorder) = recorder {
        match Arc::try_unwrap(recorder) {
            Ok(recorder) => {
                let dropped = recorder.dropped();
                let written = recorder.finish()?;
                info!("recorded {} frames ({} dropped)", written, dropped);
            }
            Err(_) => warn!("recorder still in use, closing on exit"),
        }
    }

    Ok(())
}

fn open_source(
    args: &Args,
    device: &DeviceContext,
    table: &GeometryTable,
) -> Result<Arc<dyn RawPacketSource>, Error> {
    let geometry = table.resolve(device.model(), args.rate, args.format, device.work_mode())?;
    // One sweep's worth of blocks per scan period.
    let interval =
        Duration::from_nanos(args.rate.period_ns() / geometry.max_blocks_per_frame as u64);

    match args.source {
        SourceKind::Synthetic => {
            let builder = BlockBuilder::new(args.model_code, args.rate, args.format)
                .sync_mode(args.sync_mode.code());
            let packets: Vec<Vec<u8>> = (0..SYNTHETIC_SWEEPS)
                .flat_map(|sweep| builder.sweep(&geometry, sweep))
                .collect();
            info!(
                "synthetic source: {} packets per sweep every {:?}",
                geometry.max_blocks_per_frame, interval
            );
            Ok(Arc::new(
                ReplaySource::new(packets)
                    .with_interval(interval)
                    .looping(true),
            ))
        }
        SourceKind::Udp => {
            let addr = args.target.as_deref().unwrap_or(DEFAULT_UDP_BIND);
            let source = UdpSource::bind(addr)?;
            info!("listening on {}", source.local_addr()?);
            Ok(Arc::new(source))
        }
        SourceKind::Pcap => open_pcap(args, interval),
    }
}

#[cfg(feature = "pcap")]
fn open_pcap(args: &Args, interval: Duration) -> Result<Arc<dyn RawPacketSource>, Error> {
    let path = args
        .target
        .as_deref()
        .ok_or_else(|| Error::Configuration("pcap source needs a capture file".to_string()))?;
    let source = edgefirst_lidarstream::PcapSource::from_file(path, Some(args.port))?;
    if source.is_empty() {
        return Err(Error::Configuration(format!(
            "no packets for port {} in {}",
            args.port, path
        )));
    }
    info!("replaying {} packets from {}", source.len(), path);
    Ok(Arc::new(source.with_interval(interval)))
}

#[cfg(not(feature = "pcap"))]
fn open_pcap(_args: &Args, _interval: Duration) -> Result<Arc<dyn RawPacketSource>, Error> {
    Err(Error::Configuration(
        "built without pcap support, rebuild with --features pcap".to_string(),
    ))
}
