// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! EdgeFirst LiDAR Stream Library
//!
//! Turns the UDP packet stream of a LiDAR/depth sensor into whole frames
//! and supervises the stream so a stalled device is restarted without help
//! from the consumer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌────────────────┐     ┌─────────────────┐
//! │ RawPacketSource │ ──► │ FrameAssembler │ ──► │    Pipeline     │
//! │ (UDP/pcap/test) │     │ (GeometryTable)│     │ metadata, time, │
//! └─────────────────┘     └────────────────┘     │ anomaly, record │
//!                                                └─────────────────┘
//!                                                        │
//!         ┌──────────────────┐                           ▼
//!         │ Recovery watcher │ ─── restart ──►  ┌─────────────────┐
//!         └──────────────────┘                  │  SensorStream   │ ──► callback
//!                                               └─────────────────┘
//! ```
//!
//! 1. A [`packet_source::RawPacketSource`] pushes raw datagrams into the
//!    stream.
//! 2. The [`assembler::FrameAssembler`] validates each block and copies its
//!    decoded points into the frame buffer, sized from the
//!    [`geometry::GeometryTable`].
//! 3. Completed frames are stamped, checked and recorded, then handed to the
//!    consumer callback.
//! 4. The [`recovery`] watcher restarts the stream when frames stop.
//!
//! # Modules
//!
//! - [`lidar`]: Common types, error handling and clocks
//! - [`geometry`]: Frame geometry per model, rate, format and mode
//! - [`packet`]: Wire packet layout and synthetic packet builders
//! - [`formats`]: Wire point decoding
//! - [`assembler`]: Block to frame reassembly
//! - [`stream`]: Stream state machine and frame pipeline
//! - [`recovery`]: Stall detection and automatic restart
//! - [`packet_source`]: Packet sources (UDP, replay, test)
//!
//! # Example
//!
//! ```no_run
//! use edgefirst_lidarstream::{
//!     DataFormat, DeviceContext, GeometryTable, ScanRate, SensorStream, StaticSyncConfig,
//!     StreamConfig, StreamProfile, StreamType, SyncMode, UdpSource,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> edgefirst_lidarstream::Result<()> {
//! let sync = Arc::new(StaticSyncConfig::new(SyncMode::FreeRun));
//! let device = Arc::new(DeviceContext::new(0x0201, sync)?);
//! let source = Arc::new(UdpSource::bind("0.0.0.0:6699")?);
//!
//! let stream = SensorStream::new(
//!     StreamType::Depth,
//!     device,
//!     Arc::new(GeometryTable::new()),
//!     source,
//!     &StreamConfig::default(),
//! )?;
//!
//! let profile = StreamProfile::new(StreamType::Depth, DataFormat::Point, ScanRate::Hz10);
//! stream.start(profile, |frame| {
//!     println!("frame {} with {} points", frame.sequence(), frame.point_count());
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod buffer;
pub mod config;
pub mod device;
pub mod formats;
pub mod frame;
pub mod geometry;
pub mod lidar;
pub mod metadata;
pub mod packet;
pub mod packet_source;
#[cfg(feature = "pcap")]
pub mod pcap_source;
pub mod processor;
pub mod recorder;
pub mod recovery;
pub mod stream;
pub mod timestamp;

// Re-exports for convenience
pub use assembler::{AssemblerStats, FrameAssembler};
pub use config::{RecorderConfig, RecoveryConfig, StreamConfig};
pub use device::{DeviceContext, StaticSyncConfig, SyncConfig, SyncMode};
pub use frame::Frame;
pub use geometry::{Geometry, GeometryTable};
pub use lidar::{
    DataFormat, Error, FrameType, ModelClass, Result, ScanRate, StreamProfile, StreamState,
    StreamType, WorkMode,
};
pub use metadata::{FrameMetadata, MetadataKey, MetadataParsers};
pub use packet_source::{RawPacketSource, ReplaySource, TestSource, UdpSource};
#[cfg(feature = "pcap")]
pub use pcap_source::PcapSource;
pub use stream::{SensorStream, StreamStats};
