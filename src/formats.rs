// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-format payload conversion.
//!
//! Every block payload is converted from its big-endian wire encoding into
//! the little-endian output layout stored in assembled frames.
//!
//! # Wire encodings
//!
//! ## Scan (single-line), 4-byte preamble + 4 bytes per point
//! ```text
//! ┌──────────────┬──────────────┐ ┌────────────┬───────────┬──────────┐
//! │ start:u16    │ step:u16     │ │ dist:u16   │ intensity │ reserved │
//! │ 0.01°        │ 0.001°       │ │ 0.25 mm    │ u8        │ u8       │
//! └──────────────┴──────────────┘ └────────────┴───────────┴──────────┘
//! ```
//!
//! ## Point / SpherePoint (multi-line), 8 bytes per point
//! ```text
//! ┌────────────┬─────────────┬───────────────┬───────────┬──────────┐
//! │ dist:u16   │ azimuth:u16 │ elevation:i16 │ intensity │ reserved │
//! │ 0.25 mm    │ 0.01°       │ 0.01°         │ u8        │ u8       │
//! └────────────┴─────────────┴───────────────┴───────────┴──────────┘
//! ```
//!
//! ## Calibration, 4 raw bytes per sample (copied verbatim)
//!
//! # Output layouts
//!
//! - Scan: `angle_rad:f32 | distance_mm:f32 | intensity:u8 | pad[3]` (12 B)
//! - Point: `x:f32 | y:f32 | z:f32 | intensity:u8 | pad[3]` (16 B, mm)
//! - SpherePoint: `distance_mm:f32 | azimuth_rad:f32 | elevation_rad:f32 |
//!   intensity:u8 | pad[3]` (16 B)
//! - Calibration: raw 4 B samples

use crate::lidar::{DataFormat, Error, Result};

/// Distance resolution of wire samples in millimeters.
pub const DISTANCE_RESOLUTION_MM: f32 = 0.25;

/// Angle resolution of multi-line azimuth/elevation and scan start angle.
pub const ANGLE_RESOLUTION_DEG: f32 = 0.01;

/// Resolution of the single-line per-point angular step.
pub const STEP_RESOLUTION_DEG: f32 = 0.001;

/// Byte sizes describing one format's wire and output encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatLayout {
    /// Converted bytes per point
    pub output_point_size: usize,
    /// Wire bytes per point
    pub wire_point_size: usize,
    /// Wire bytes preceding the points in every block
    pub preamble_size: usize,
}

/// Look up the wire/output layout for a data format.
pub const fn layout(format: DataFormat) -> FormatLayout {
    match format {
        DataFormat::Scan => FormatLayout {
            output_point_size: 12,
            wire_point_size: 4,
            preamble_size: 4,
        },
        DataFormat::Point | DataFormat::SpherePoint => FormatLayout {
            output_point_size: 16,
            wire_point_size: 8,
            preamble_size: 0,
        },
        DataFormat::Calibration => FormatLayout {
            output_point_size: 4,
            wire_point_size: 4,
            preamble_size: 0,
        },
    }
}

/// Convert one block payload into `out`, returning the bytes written.
///
/// `points` is the number of points the payload declares. The caller must
/// have validated that `payload` holds exactly `preamble + points * wire`
/// bytes; `out` must hold at least `points * output_point_size` bytes.
pub fn convert_block(
    format: DataFormat,
    payload: &[u8],
    points: usize,
    out: &mut [u8],
) -> Result<usize> {
    let lay = layout(format);
    let needed_in = lay.preamble_size + points * lay.wire_point_size;
    let needed_out = points * lay.output_point_size;
    if payload.len() < needed_in {
        return Err(Error::UnexpectedEnd(payload.len()));
    }
    if out.len() < needed_out {
        return Err(Error::InvalidPacket(format!(
            "output slice too small: {} < {}",
            out.len(),
            needed_out
        )));
    }

    match format {
        DataFormat::Scan => convert_scan(payload, points, out),
        DataFormat::Point => convert_points(payload, points, out),
        DataFormat::SpherePoint => convert_sphere_points(payload, points, out),
        DataFormat::Calibration => out[..needed_out].copy_from_slice(&payload[..needed_in]),
    }

    Ok(needed_out)
}

#[inline]
fn read_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

#[inline]
fn read_i16(b: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([b[at], b[at + 1]])
}

#[inline]
fn write_point(out: &mut [u8], a: f32, b: f32, c: f32, intensity: u8) {
    out[0..4].copy_from_slice(&a.to_le_bytes());
    out[4..8].copy_from_slice(&b.to_le_bytes());
    out[8..12].copy_from_slice(&c.to_le_bytes());
    out[12] = intensity;
    out[13..16].fill(0);
}

fn convert_scan(payload: &[u8], points: usize, out: &mut [u8]) {
    // Interpolate in integer millidegrees so the wrap at 360° is exact.
    let start_mdeg = read_u16(payload, 0) as u64 * 10;
    let step_mdeg = read_u16(payload, 2) as u64;

    for i in 0..points {
        let src = &payload[4 + i * 4..4 + (i + 1) * 4];
        let dst = &mut out[i * 12..(i + 1) * 12];

        let mdeg = (start_mdeg + i as u64 * step_mdeg) % 360_000;
        let angle = (mdeg as f32 * STEP_RESOLUTION_DEG).to_radians();
        let distance = read_u16(src, 0) as f32 * DISTANCE_RESOLUTION_MM;

        dst[0..4].copy_from_slice(&angle.to_le_bytes());
        dst[4..8].copy_from_slice(&distance.to_le_bytes());
        dst[8] = src[2];
        dst[9..12].fill(0);
    }
}

fn convert_points(payload: &[u8], points: usize, out: &mut [u8]) {
    for i in 0..points {
        let src = &payload[i * 8..(i + 1) * 8];
        let dst = &mut out[i * 16..(i + 1) * 16];

        let distance = read_u16(src, 0) as f32 * DISTANCE_RESOLUTION_MM;
        let azimuth = (read_u16(src, 2) as f32 * ANGLE_RESOLUTION_DEG).to_radians();
        let elevation = (read_i16(src, 4) as f32 * ANGLE_RESOLUTION_DEG).to_radians();

        let (sin_az, cos_az) = azimuth.sin_cos();
        let (sin_el, cos_el) = elevation.sin_cos();
        let horizontal = distance * cos_el;

        write_point(
            dst,
            horizontal * cos_az,
            horizontal * sin_az,
            distance * sin_el,
            src[6],
        );
    }
}

fn convert_sphere_points(payload: &[u8], points: usize, out: &mut [u8]) {
    for i in 0..points {
        let src = &payload[i * 8..(i + 1) * 8];
        let dst = &mut out[i * 16..(i + 1) * 16];

        write_point(
            dst,
            read_u16(src, 0) as f32 * DISTANCE_RESOLUTION_MM,
            (read_u16(src, 2) as f32 * ANGLE_RESOLUTION_DEG).to_radians(),
            (read_i16(src, 4) as f32 * ANGLE_RESOLUTION_DEG).to_radians(),
            src[6],
        );
    }
}

/// A converted single-line scan point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanPoint {
    pub angle: f32,
    pub distance: f32,
    pub intensity: u8,
}

/// A converted Cartesian point, in millimeters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub intensity: u8,
}

/// A converted spherical point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpherePoint {
    pub distance: f32,
    pub azimuth: f32,
    pub elevation: f32,
    pub intensity: u8,
}

#[inline]
fn read_f32(b: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Iterate the scan points of converted `Scan` frame data.
pub fn scan_points(data: &[u8]) -> impl Iterator<Item = ScanPoint> + '_ {
    data.chunks_exact(12).map(|p| ScanPoint {
        angle: read_f32(p, 0),
        distance: read_f32(p, 4),
        intensity: p[8],
    })
}

/// Iterate the points of converted `Point` frame data.
pub fn points(data: &[u8]) -> impl Iterator<Item = Point> + '_ {
    data.chunks_exact(16).map(|p| Point {
        x: read_f32(p, 0),
        y: read_f32(p, 4),
        z: read_f32(p, 8),
        intensity: p[12],
    })
}

/// Iterate the points of converted `SpherePoint` frame data.
pub fn sphere_points(data: &[u8]) -> impl Iterator<Item = SpherePoint> + '_ {
    data.chunks_exact(16).map(|p| SpherePoint {
        distance: read_f32(p, 0),
        azimuth: read_f32(p, 4),
        elevation: read_f32(p, 8),
        intensity: p[12],
    })
}
