// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stream configuration.
//!
//! Every section has defaults, so a configuration file only needs the
//! values it changes:
//!
//! ```json
//! {
//!     "recovery": { "max_recovery_count": 5, "no_stream_timeout_ms": 3000 },
//!     "anomaly": { "max_gap_periods": 20 }
//! }
//! ```

use crate::{lidar::Result, timestamp::AnomalyConfig};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

/// Recovery watcher parameters. A zero value disables that check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Restarts attempted before the stream is forced into Error
    pub max_recovery_count: u32,
    /// Longest wait for the first frame after a start
    pub no_stream_timeout_ms: u64,
    /// Longest gap between frames while streaming
    pub stream_interrupt_timeout_ms: u64,
}

impl RecoveryConfig {
    /// Recovery with every check disabled.
    pub const fn disabled() -> Self {
        Self {
            max_recovery_count: 0,
            no_stream_timeout_ms: 0,
            stream_interrupt_timeout_ms: 0,
        }
    }

    /// True when at least one check can trigger a restart.
    pub fn is_enabled(&self) -> bool {
        self.max_recovery_count > 0
            && (self.no_stream_timeout_ms > 0 || self.stream_interrupt_timeout_ms > 0)
    }

    pub fn no_stream_timeout(&self) -> Option<Duration> {
        (self.no_stream_timeout_ms > 0).then(|| Duration::from_millis(self.no_stream_timeout_ms))
    }

    pub fn stream_interrupt_timeout(&self) -> Option<Duration> {
        (self.stream_interrupt_timeout_ms > 0)
            .then(|| Duration::from_millis(self.stream_interrupt_timeout_ms))
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_count: 3,
            no_stream_timeout_ms: 5000,
            stream_interrupt_timeout_ms: 3000,
        }
    }
}

/// Recording sink parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Frames buffered before the recorder starts dropping
    pub queue_depth: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { queue_depth: 8 }
    }
}

/// Top-level stream configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    pub recovery: RecoveryConfig,
    pub anomaly: AnomalyConfig,
    pub recorder: RecorderConfig,
}

impl StreamConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
