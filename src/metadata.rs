// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-frame metadata extracted from the final block header of a sweep.

use crate::{
    device::SyncMode,
    lidar::{Error, Result},
    packet::Header,
};
use std::collections::BTreeMap;

/// Metadata entries a frame may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataKey {
    SweepIndex,
    ModelCode,
    SyncMode,
    WarningFlags,
    /// Measured motor speed in rpm
    ScanSpeed,
    /// Vertical scan rate in 0.01 Hz
    VerticalRate,
    /// Temperature in 0.01 °C
    Temperature,
    /// Device timestamp in microseconds, recorded but never used for timing
    WireTimestamp,
}

/// Parsed metadata values keyed by entry.
pub type FrameMetadata = BTreeMap<MetadataKey, i64>;

/// Extract one entry from a header.
pub fn parse_entry(key: MetadataKey, h: &Header) -> Result<i64> {
    match key {
        MetadataKey::SweepIndex => Ok(h.sweep_index as i64),
        MetadataKey::ModelCode => Ok(h.model_code as i64),
        MetadataKey::SyncMode => SyncMode::from_code(h.sync_mode)
            .map(|m| m.code() as i64)
            .ok_or_else(|| Error::InvalidPacket(format!("unknown sync mode {}", h.sync_mode))),
        MetadataKey::WarningFlags => Ok(h.warning_flags as i64),
        MetadataKey::ScanSpeed => Ok(h.scan_speed as i64),
        MetadataKey::VerticalRate => Ok(h.vertical_rate as i64),
        MetadataKey::Temperature => Ok(h.temperature as i64),
        MetadataKey::WireTimestamp => i64::try_from(h.wire_timestamp_us).map_err(|_| {
            Error::InvalidPacket(format!("wire timestamp {} out of range", h.wire_timestamp_us))
        }),
    }
}

/// The set of metadata entries declared for a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataParsers {
    keys: Vec<MetadataKey>,
}

impl MetadataParsers {
    /// Declare every known entry.
    pub fn all() -> Self {
        Self::with_keys(&[
            MetadataKey::SweepIndex,
            MetadataKey::ModelCode,
            MetadataKey::SyncMode,
            MetadataKey::WarningFlags,
            MetadataKey::ScanSpeed,
            MetadataKey::VerticalRate,
            MetadataKey::Temperature,
            MetadataKey::WireTimestamp,
        ])
    }

    /// Declare no entries; frames carry empty metadata.
    pub fn none() -> Self {
        Self { keys: Vec::new() }
    }

    pub fn with_keys(keys: &[MetadataKey]) -> Self {
        Self {
            keys: keys.to_vec(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = MetadataKey> + '_ {
        self.keys.iter().copied()
    }

    /// Parse every declared entry; any invalid entry fails the whole frame.
    pub fn parse(&self, header: &Header) -> Result<FrameMetadata> {
        self.keys
            .iter()
            .map(|key| parse_entry(*key, header).map(|v| (*key, v)))
            .collect()
    }
}

impl Default for MetadataParsers {
    fn default() -> Self {
        Self::all()
    }
}
