// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Downstream frame processing.
//!
//! A [`FrameProcessor`] sits between the stream pipeline and the consumer
//! callback. It may transform the frame or swallow it entirely.

use crate::{
    formats,
    frame::Frame,
    lidar::{DataFormat, Error, Result},
};
use std::sync::Arc;

/// Transforms frames before they reach the consumer.
pub trait FrameProcessor: Send {
    /// Returns the frame to deliver, or `None` to deliver nothing.
    fn process(&mut self, frame: Frame) -> Result<Option<Frame>>;
}

/// Zeroes points whose range falls outside `[min_mm, max_mm]`.
///
/// Angles are preserved for scan points so the sweep keeps its shape.
/// Calibration frames pass through untouched.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeGate {
    pub min_mm: f32,
    pub max_mm: f32,
}

impl RangeGate {
    pub fn new(min_mm: f32, max_mm: f32) -> Result<Self> {
        if !(min_mm >= 0.0 && min_mm <= max_mm) {
            return Err(Error::Configuration(format!(
                "invalid range gate [{}, {}]",
                min_mm, max_mm
            )));
        }
        Ok(Self { min_mm, max_mm })
    }

    fn rejects(&self, range: f32) -> bool {
        range < self.min_mm || range > self.max_mm
    }
}

fn f32_at(p: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

impl FrameProcessor for RangeGate {
    fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
        let format = frame.format();
        if format == DataFormat::Calibration {
            return Ok(Some(frame));
        }

        let size = formats::layout(format).output_point_size;
        let mut data = frame.data().to_vec();
        for p in data.chunks_exact_mut(size) {
            match format {
                DataFormat::Scan => {
                    if self.rejects(f32_at(p, 4)) {
                        p[4..9].fill(0);
                    }
                }
                DataFormat::Point => {
                    let (x, y, z) = (f32_at(p, 0), f32_at(p, 4), f32_at(p, 8));
                    if self.rejects((x * x + y * y + z * z).sqrt()) {
                        p.fill(0);
                    }
                }
                DataFormat::SpherePoint => {
                    if self.rejects(f32_at(p, 0)) {
                        p[0..4].fill(0);
                        p[12] = 0;
                    }
                }
                DataFormat::Calibration => {}
            }
        }

        Ok(Some(frame.with_data(Arc::from(data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Header;

    fn frame(format: DataFormat, data: Vec<u8>) -> Frame {
        let header = Header::parse(&[0u8; 40]).unwrap();
        Frame::new(format, Arc::from(data), 0, 0, header)
    }

    fn scan_point(angle: f32, distance: f32) -> Vec<u8> {
        let mut p = Vec::with_capacity(12);
        p.extend_from_slice(&angle.to_le_bytes());
        p.extend_from_slice(&distance.to_le_bytes());
        p.extend_from_slice(&[200, 0, 0, 0]);
        p
    }

    #[test]
    fn test_invalid_gate() {
        assert!(RangeGate::new(100.0, 10.0).is_err());
        assert!(RangeGate::new(-1.0, 10.0).is_err());
        assert!(RangeGate::new(0.0, 0.0).is_ok());
    }

    #[test]
    fn test_scan_gate_keeps_angle() {
        let mut data = scan_point(0.5, 50.0);
        data.extend(scan_point(1.0, 5000.0));
        data.extend(scan_point(1.5, 90_000.0));

        let mut gate = RangeGate::new(100.0, 60_000.0).unwrap();
        let out = gate.process(frame(DataFormat::Scan, data)).unwrap().unwrap();
        let pts: Vec<_> = formats::scan_points(out.data()).collect();
        assert_eq!(pts[0].distance, 0.0);
        assert_eq!(pts[0].intensity, 0);
        assert_eq!(pts[0].angle, 0.5);
        assert_eq!(pts[1].distance, 5000.0);
        assert_eq!(pts[1].intensity, 200);
        assert_eq!(pts[2].distance, 0.0);
        assert_eq!(pts[2].angle, 1.5);
    }

    #[test]
    fn test_point_gate_uses_range() {
        let mut data = Vec::new();
        for (x, y, z) in [(3000.0f32, 4000.0f32, 0.0f32), (30.0, 40.0, 0.0)] {
            data.extend_from_slice(&x.to_le_bytes());
            data.extend_from_slice(&y.to_le_bytes());
            data.extend_from_slice(&z.to_le_bytes());
            data.extend_from_slice(&[9, 0, 0, 0]);
        }
        let mut gate = RangeGate::new(1000.0, 10_000.0).unwrap();
        let out = gate.process(frame(DataFormat::Point, data)).unwrap().unwrap();
        let pts: Vec<_> = formats::points(out.data()).collect();
        assert_eq!(pts[0].x, 3000.0);
        assert_eq!(pts[1].x, 0.0);
        assert_eq!(pts[1].intensity, 0);
    }

    #[test]
    fn test_calibration_passthrough() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let mut gate = RangeGate::new(1000.0, 2000.0).unwrap();
        let out = gate
            .process(frame(DataFormat::Calibration, data.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(out.data(), &data[..]);
    }
}
