// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame timestamping and timing anomaly detection.
//!
//! Device timestamps are derived from the local receipt time of a sweep's
//! final block. The on-wire timestamp is never used for timing; it is only
//! kept as frame metadata.

use crate::{
    device::SyncMode,
    frame::Frame,
    lidar::{Error, Result, ScanRate, timestamp, wall_clock_us},
};
use log::debug;
use serde::{Deserialize, Serialize};

/// Computes the per-frame device timestamp.
pub trait TimestampCalculator: Send {
    /// Called on every stream start.
    fn reset(&mut self);

    /// Device timestamp in microseconds.
    fn calculate(&mut self, frame: &Frame) -> Result<u64>;
}

/// Device time as microseconds since the stream started, from receipt time.
#[derive(Debug, Default)]
pub struct ReceiptTimestampCalculator {
    origin_ns: Option<u64>,
}

impl ReceiptTimestampCalculator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampCalculator for ReceiptTimestampCalculator {
    fn reset(&mut self) {
        self.origin_ns = timestamp().ok();
    }

    fn calculate(&mut self, frame: &Frame) -> Result<u64> {
        let receipt = frame.receipt_timestamp_ns();
        let origin = *self.origin_ns.get_or_insert(receipt);
        if receipt < origin {
            return Err(Error::TimestampAnomaly(format!(
                "receipt time {} precedes stream start {}",
                receipt, origin
            )));
        }
        Ok((receipt - origin) / 1000)
    }
}

/// Computes the cross-device timestamp from the device timestamp.
pub trait GlobalTimestampCalculator: Send {
    fn reset(&mut self);

    /// Global timestamp in microseconds.
    fn calculate(&mut self, frame: &Frame, device_timestamp_us: u64) -> Result<u64>;
}

/// Maps device time onto the host wall clock.
///
/// The offset is captured on the first frame after a reset and held for the
/// rest of the activation, so global time advances exactly with device time.
#[derive(Debug, Default)]
pub struct HostClockGlobalTimestamp {
    offset_us: Option<u64>,
}

impl HostClockGlobalTimestamp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlobalTimestampCalculator for HostClockGlobalTimestamp {
    fn reset(&mut self) {
        self.offset_us = None;
    }

    fn calculate(&mut self, _frame: &Frame, device_timestamp_us: u64) -> Result<u64> {
        let offset = match self.offset_us {
            Some(offset) => offset,
            None => {
                let offset = wall_clock_us()?.saturating_sub(device_timestamp_us);
                self.offset_us = Some(offset);
                offset
            }
        };
        Ok(device_timestamp_us + offset)
    }
}

/// Rejects frames whose timing is implausible.
pub trait AnomalyDetector: Send {
    /// Called on every stream start with the configured scan rate.
    fn reset(&mut self, rate: ScanRate);

    /// Returns [`Error::TimestampAnomaly`] when the frame must be dropped.
    /// `sync_mode` is the device's mode when the frame was delivered.
    fn check(&mut self, device_timestamp_us: u64, sync_mode: SyncMode) -> Result<()>;
}

/// Anomaly detection settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Disable anomaly detection entirely
    pub enabled: bool,
    /// Forward jumps longer than this many frame periods are anomalies; 0
    /// disables the check
    pub max_gap_periods: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_gap_periods: 50,
        }
    }
}

/// Flags duplicate, backwards and overly large forward timestamp steps
/// relative to the configured frame period. Large steps are accepted while
/// the device waits on external triggers.
#[derive(Debug)]
pub struct RateAnomalyDetector {
    max_gap_periods: u32,
    period_us: u64,
    last_us: Option<u64>,
}

impl RateAnomalyDetector {
    pub fn new(max_gap_periods: u32) -> Self {
        Self {
            max_gap_periods,
            period_us: ScanRate::default().period_ns() / 1000,
            last_us: None,
        }
    }

    pub fn from_config(config: &AnomalyConfig) -> Self {
        Self::new(config.max_gap_periods)
    }
}

impl AnomalyDetector for RateAnomalyDetector {
    fn reset(&mut self, rate: ScanRate) {
        self.period_us = rate.period_ns() / 1000;
        self.last_us = None;
    }

    fn check(&mut self, ts: u64, sync_mode: SyncMode) -> Result<()> {
        let Some(last) = self.last_us else {
            self.last_us = Some(ts);
            return Ok(());
        };

        if ts == last {
            return Err(Error::TimestampAnomaly(format!("duplicate timestamp {}us", ts)));
        }
        if ts < last {
            return Err(Error::TimestampAnomaly(format!(
                "timestamp moved backwards from {}us to {}us",
                last, ts
            )));
        }

        self.last_us = Some(ts);
        let gap = ts - last;
        let limit = self.period_us * self.max_gap_periods as u64;
        // Triggered devices sit idle between triggers.
        if sync_mode.is_externally_triggered() {
            return Ok(());
        }
        if self.max_gap_periods > 0 && gap > limit {
            // New baseline already recorded; the stream resynchronizes on it.
            debug!("timestamp gap {}us exceeds {}us", gap, limit);
            return Err(Error::TimestampAnomaly(format!(
                "gap of {}us exceeds {} frame periods",
                gap, self.max_gap_periods
            )));
        }
        Ok(())
    }
}
