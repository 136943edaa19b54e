// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Data-driven frame geometry table.
//!
//! A [`Geometry`] holds the per-configuration constants the frame assembler
//! needs: point sizes, points per block, blocks per sweep and the resulting
//! frame size. Geometries are looked up from [`GEOMETRY_ROWS`] keyed by
//! (model class, scan rate, data format); supporting new hardware means
//! adding rows, not code.

use crate::{
    formats,
    lidar::{DataFormat, Error, ModelClass, Result, ScanRate, WorkMode},
};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Resolved per-configuration constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Converted (output) bytes per point
    pub point_byte_size: usize,
    /// Points carried by every block
    pub points_per_block: usize,
    /// Blocks in one complete sweep
    pub max_blocks_per_frame: u16,
    /// Output bytes in one complete frame
    pub total_frame_byte_size: usize,
    /// Nominal motor speed
    pub scan_speed_rpm: u16,
    /// Wire bytes per point
    pub wire_point_size: usize,
    /// Wire bytes preceding the points in every block
    pub block_preamble_size: usize,
}

impl Geometry {
    /// Expected payload length declared by every block header.
    pub fn block_payload_size(&self) -> usize {
        self.block_preamble_size + self.wire_point_size * self.points_per_block
    }

    /// Output bytes produced by converting one block.
    pub fn block_output_size(&self) -> usize {
        self.point_byte_size * self.points_per_block
    }
}

/// One supported hardware configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryRow {
    pub model: ModelClass,
    pub rate: ScanRate,
    pub format: DataFormat,
    pub points_per_block: usize,
    pub blocks_per_frame: u16,
}

const fn row(
    model: ModelClass,
    rate: ScanRate,
    format: DataFormat,
    points_per_block: usize,
    blocks_per_frame: u16,
) -> GeometryRow {
    GeometryRow {
        model,
        rate,
        format,
        points_per_block,
        blocks_per_frame,
    }
}

use DataFormat::{Calibration, Point, Scan, SpherePoint};
use ModelClass::{MultiLine, SingleLine};
use ScanRate::{Hz5, Hz10, Hz15, Hz20};

/// Built-in hardware configurations.
pub const GEOMETRY_ROWS: &[GeometryRow] = &[
    row(SingleLine, Hz5, Scan, 200, 36),
    row(SingleLine, Hz10, Scan, 200, 18),
    row(SingleLine, Hz15, Scan, 200, 12),
    row(SingleLine, Hz20, Scan, 200, 9),
    row(SingleLine, Hz10, Calibration, 256, 8),
    row(MultiLine, Hz10, Point, 120, 300),
    row(MultiLine, Hz20, Point, 120, 150),
    row(MultiLine, Hz10, SpherePoint, 120, 300),
    row(MultiLine, Hz20, SpherePoint, 120, 150),
    row(MultiLine, Hz10, Calibration, 256, 32),
];

type GeometryKey = (ModelClass, ScanRate, DataFormat);

/// Geometry lookup with a per-key cache.
///
/// One table is shared (via `Arc`) by every stream of a device.
#[derive(Debug)]
pub struct GeometryTable {
    rows: Vec<GeometryRow>,
    cache: Mutex<HashMap<GeometryKey, Geometry>>,
}

impl GeometryTable {
    /// Create a table holding the built-in rows.
    pub fn new() -> Self {
        Self::with_rows(GEOMETRY_ROWS.to_vec())
    }

    /// Create a table from custom rows.
    pub fn with_rows(rows: Vec<GeometryRow>) -> Self {
        Self {
            rows,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Supported configurations, in table order.
    pub fn rows(&self) -> &[GeometryRow] {
        &self.rows
    }

    /// Resolve the geometry for a configuration in the given work mode.
    ///
    /// Returns [`Error::Configuration`] when the combination is not in the
    /// table or is invalid for the device's current work mode.
    pub fn resolve(
        &self,
        model: ModelClass,
        rate: ScanRate,
        format: DataFormat,
        mode: WorkMode,
    ) -> Result<Geometry> {
        check_work_mode(format, mode)?;

        let key = (model, rate, format);
        if let Some(geometry) = self.cache.lock().get(&key) {
            return Ok(*geometry);
        }

        let entry = self
            .rows
            .iter()
            .find(|r| r.model == model && r.rate == rate && r.format == format)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unsupported combination: {} model, {}, {} format",
                    model, rate, format
                ))
            })?;

        let geometry = compute(entry);
        debug!(
            "resolved geometry for {} {} {}: {:?}",
            model, rate, format, geometry
        );
        self.cache.lock().insert(key, geometry);
        Ok(geometry)
    }
}

impl Default for GeometryTable {
    fn default() -> Self {
        Self::new()
    }
}

fn compute(entry: &GeometryRow) -> Geometry {
    let lay = formats::layout(entry.format);
    Geometry {
        point_byte_size: lay.output_point_size,
        points_per_block: entry.points_per_block,
        max_blocks_per_frame: entry.blocks_per_frame,
        total_frame_byte_size: lay.output_point_size
            * entry.points_per_block
            * entry.blocks_per_frame as usize,
        scan_speed_rpm: entry.rate.rpm(),
        wire_point_size: lay.wire_point_size,
        block_preamble_size: lay.preamble_size,
    }
}

/// Calibration payloads exist only in calibration mode, and calibration
/// mode produces nothing else.
fn check_work_mode(format: DataFormat, mode: WorkMode) -> Result<()> {
    match (format, mode) {
        (DataFormat::Calibration, WorkMode::Calibration) => Ok(()),
        (DataFormat::Calibration, WorkMode::Normal) => Err(Error::Configuration(
            "calibration format requires calibration work mode".to_string(),
        )),
        (format, WorkMode::Calibration) => Err(Error::Configuration(format!(
            "{} format is unavailable in calibration work mode",
            format
        ))),
        (_, WorkMode::Normal) => Ok(()),
    }
}
