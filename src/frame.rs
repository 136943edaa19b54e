// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Assembled sensor frames.

use crate::{
    formats,
    lidar::{DataFormat, FrameType, StreamProfile},
    metadata::{FrameMetadata, MetadataKey},
    packet::Header,
};
use std::sync::Arc;

/// One complete sweep of converted sensor output.
///
/// Frames are created by the [`crate::assembler::FrameAssembler`] only when
/// a sweep completes, enriched by the stream pipeline, and handed to the
/// consumer by value. The point data is shared and immutable.
#[derive(Clone, Debug)]
pub struct Frame {
    frame_type: FrameType,
    format: DataFormat,
    data: Arc<[u8]>,
    receipt_timestamp_ns: u64,
    device_timestamp_us: u64,
    global_timestamp_us: u64,
    sequence: u64,
    profile: Option<StreamProfile>,
    metadata: FrameMetadata,
    header: Header,
}

impl Frame {
    pub(crate) fn new(
        format: DataFormat,
        data: Arc<[u8]>,
        receipt_timestamp_ns: u64,
        sequence: u64,
        header: Header,
    ) -> Self {
        Self {
            frame_type: format.frame_type(),
            format,
            data,
            receipt_timestamp_ns,
            device_timestamp_us: 0,
            global_timestamp_us: 0,
            sequence,
            profile: None,
            metadata: FrameMetadata::new(),
            header,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Converted point data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the point data.
    pub fn shared_data(&self) -> Arc<[u8]> {
        self.data.clone()
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Number of points (or calibration samples) in the frame.
    pub fn point_count(&self) -> usize {
        self.data.len() / formats::layout(self.format).output_point_size
    }

    /// Local monotonic time at which the final block was ingested.
    pub fn receipt_timestamp_ns(&self) -> u64 {
        self.receipt_timestamp_ns
    }

    /// Stream-relative timestamp assigned by the timestamp calculator.
    pub fn device_timestamp_us(&self) -> u64 {
        self.device_timestamp_us
    }

    /// Cross-device timestamp assigned by the global timestamp calculator.
    pub fn global_timestamp_us(&self) -> u64 {
        self.global_timestamp_us
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn profile(&self) -> Option<&StreamProfile> {
        self.profile.as_ref()
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub fn metadata_value(&self, key: MetadataKey) -> Option<i64> {
        self.metadata.get(&key).copied()
    }

    /// Header of the sweep's final block.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Replace the point data, keeping every other attribute.
    ///
    /// Used by frame processors that transform the payload.
    pub fn with_data(mut self, data: Arc<[u8]>) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn set_profile(&mut self, profile: StreamProfile) {
        self.profile = Some(profile);
    }

    pub(crate) fn set_metadata(&mut self, metadata: FrameMetadata) {
        self.metadata = metadata;
    }

    pub(crate) fn set_device_timestamp_us(&mut self, ts: u64) {
        self.device_timestamp_us = ts;
    }

    pub(crate) fn set_global_timestamp_us(&mut self, ts: u64) {
        self.global_timestamp_us = ts;
    }
}
