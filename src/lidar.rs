// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Common LiDAR stream types, codes and error handling.
//!
//! This module provides the sensor-agnostic vocabulary shared by the geometry
//! table, the frame assembler and the sensor stream: device model classes,
//! scan rates, data formats, stream types and the crate-wide [`Error`].

use clap::ValueEnum;
use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for streaming operations
///
/// Configuration and device errors are surfaced synchronously from
/// [`crate::stream::SensorStream::start`]. Packet and timestamp errors are
/// recovered locally and only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (socket, file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parse error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// System time error
    #[error("system time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),

    /// Unsupported model, rate, format or work-mode combination
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device cannot stream right now (firmware update in progress)
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Device reported an error that blocks this stream type
    #[error("device fault on {stream_type} stream: error mask {mask:#010x}")]
    DeviceFault {
        /// Stream that was refused
        stream_type: StreamType,
        /// Device error bitmask at the time of the request
        mask: u32,
    },

    /// Operation not permitted in the current stream state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed, mis-sequenced or mis-typed packet
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Unexpected end of data at given byte position
    #[error("unexpected end of data at {0} bytes")]
    UnexpectedEnd(usize),

    /// Implausible frame timing
    #[error("timestamp anomaly: {0}")]
    TimestampAnomaly(String),

    /// No data for too long while starting or streaming
    #[error("stream stalled: {0}")]
    Stall(String),

    /// Raw packet source failure
    #[error("packet source error: {0}")]
    Source(String),

    /// A per-frame pipeline stage failed
    #[error("pipeline stage {stage} failed: {reason}")]
    Stage {
        /// Stage name
        stage: &'static str,
        /// Failure description
        reason: String,
    },
}

/// Hardware model class.
///
/// Model classes group SKUs that share a packet protocol and geometry. New
/// SKUs are added to [`MODEL_CODES`], never by branching on the raw code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelClass {
    /// Single-line (2D) rotating scanner
    SingleLine,
    /// Multi-line (3D) scanner
    MultiLine,
}

/// Raw model/variant codes and the class they belong to.
pub const MODEL_CODES: &[(u16, ModelClass)] = &[
    (0x0101, ModelClass::SingleLine),
    (0x0102, ModelClass::SingleLine),
    (0x0201, ModelClass::MultiLine),
    (0x0202, ModelClass::MultiLine),
    (0x0203, ModelClass::MultiLine),
];

impl ModelClass {
    /// Look up the model class for a raw model/variant code.
    pub fn from_code(code: u16) -> Option<Self> {
        MODEL_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, class)| *class)
    }
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelClass::SingleLine => write!(f, "single-line"),
            ModelClass::MultiLine => write!(f, "multi-line"),
        }
    }
}

/// Configured sweep rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum ScanRate {
    #[value(name = "5")]
    Hz5,
    #[default]
    #[value(name = "10")]
    Hz10,
    #[value(name = "15")]
    Hz15,
    #[value(name = "20")]
    Hz20,
}

impl ScanRate {
    /// Wire code carried in the packet header.
    pub const fn code(self) -> u8 {
        match self {
            ScanRate::Hz5 => 0x01,
            ScanRate::Hz10 => 0x02,
            ScanRate::Hz15 => 0x03,
            ScanRate::Hz20 => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ScanRate::Hz5),
            0x02 => Some(ScanRate::Hz10),
            0x03 => Some(ScanRate::Hz15),
            0x04 => Some(ScanRate::Hz20),
            _ => None,
        }
    }

    /// Sweeps per second.
    pub const fn hz(self) -> u32 {
        match self {
            ScanRate::Hz5 => 5,
            ScanRate::Hz10 => 10,
            ScanRate::Hz15 => 15,
            ScanRate::Hz20 => 20,
        }
    }

    /// Motor speed in revolutions per minute.
    pub const fn rpm(self) -> u16 {
        (self.hz() * 60) as u16
    }

    /// Nominal time between frames in nanoseconds.
    pub const fn period_ns(self) -> u64 {
        1_000_000_000 / self.hz() as u64
    }
}

impl fmt::Display for ScanRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}Hz", self.hz())
    }
}

/// Output data format of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum DataFormat {
    /// Raw samples, only while the device is in calibration work mode
    Calibration,
    /// Cartesian points converted from multi-line spherical samples
    Point,
    /// Spherical points (distance, azimuth, elevation), scaled
    #[value(name = "sphere-point")]
    SpherePoint,
    /// Single-line scan with interpolated angles
    Scan,
}

impl DataFormat {
    /// Wire code carried in the packet header.
    pub const fn code(self) -> u8 {
        match self {
            DataFormat::Calibration => 0x10,
            DataFormat::Point => 0x20,
            DataFormat::SpherePoint => 0x21,
            DataFormat::Scan => 0x30,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x10 => Some(DataFormat::Calibration),
            0x20 => Some(DataFormat::Point),
            0x21 => Some(DataFormat::SpherePoint),
            0x30 => Some(DataFormat::Scan),
            _ => None,
        }
    }

    /// Frame type produced when a sweep in this format completes.
    pub const fn frame_type(self) -> FrameType {
        match self {
            DataFormat::Calibration => FrameType::Calibration,
            DataFormat::Point => FrameType::Points,
            DataFormat::SpherePoint => FrameType::SpherePoints,
            DataFormat::Scan => FrameType::Scan,
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataFormat::Calibration => write!(f, "calibration"),
            DataFormat::Point => write!(f, "point"),
            DataFormat::SpherePoint => write!(f, "sphere-point"),
            DataFormat::Scan => write!(f, "scan"),
        }
    }
}

/// Kind of assembled frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    Scan,
    Points,
    SpherePoints,
    Calibration,
}

/// Device work mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WorkMode {
    #[default]
    Normal,
    /// Vendor calibration mode; only calibration payloads are valid
    Calibration,
}

/// Stream types exposed by a device, each with its own error bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum)]
pub enum StreamType {
    #[default]
    Lidar,
    Depth,
    Ir,
}

impl StreamType {
    /// Bit in the device error mask that blocks this stream type.
    pub const fn error_bit(self) -> u32 {
        match self {
            StreamType::Lidar => 1 << 0,
            StreamType::Depth => 1 << 1,
            StreamType::Ir => 1 << 2,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamType::Lidar => write!(f, "lidar"),
            StreamType::Depth => write!(f, "depth"),
            StreamType::Ir => write!(f, "ir"),
        }
    }
}

/// Stream lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StreamState {
    #[default]
    Stopped,
    Starting,
    Streaming,
    Stopping,
    Error,
}

impl StreamState {
    /// States in which the source is delivering packets.
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Starting | StreamState::Streaming)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamState::Stopped => write!(f, "stopped"),
            StreamState::Starting => write!(f, "starting"),
            StreamState::Streaming => write!(f, "streaming"),
            StreamState::Stopping => write!(f, "stopping"),
            StreamState::Error => write!(f, "error"),
        }
    }
}

/// Requested stream configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamProfile {
    pub stream_type: StreamType,
    pub format: DataFormat,
    pub scan_rate: ScanRate,
}

impl StreamProfile {
    pub fn new(stream_type: StreamType, format: DataFormat, scan_rate: ScanRate) -> Self {
        Self {
            stream_type,
            format,
            scan_rate,
        }
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}@{}", self.stream_type, self.format, self.scan_rate)
    }
}

/// Get current timestamp in nanoseconds.
///
/// On Linux, uses `CLOCK_MONOTONIC_RAW` for best accuracy.
/// On other platforms, falls back to `SystemTime`.
#[cfg(target_os = "linux")]
pub fn timestamp() -> Result<u64> {
    let mut tp = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let err = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut tp) };
    if err != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(tp.tv_sec as u64 * 1_000_000_000 + tp.tv_nsec as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn timestamp() -> Result<u64> {
    let now = std::time::SystemTime::now();
    let duration = now.duration_since(std::time::UNIX_EPOCH)?;
    Ok(duration.as_nanos() as u64)
}

/// Wall-clock time in microseconds since the Unix epoch.
pub fn wall_clock_us() -> Result<u64> {
    let duration = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?;
    Ok(duration.as_micros() as u64)
}
