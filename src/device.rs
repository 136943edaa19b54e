// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Device-level context shared by the streams of one device.
//!
//! [`DeviceContext`] replaces process-wide state: it is created once per
//! device, shared by reference with every [`crate::stream::SensorStream`],
//! and exposes the flags a stream consults before starting.

use crate::lidar::{Error, ModelClass, Result, StreamType, WorkMode};
use clap::ValueEnum;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
};

/// Multi-device synchronization mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum)]
pub enum SyncMode {
    /// Free-running, no synchronization
    #[default]
    FreeRun = 0x00,
    /// Drives the sync signal for other devices
    Primary = 0x01,
    /// Follows a primary device's sync signal
    Secondary = 0x02,
    /// Follows a primary device with a fixed delay
    SecondarySynced = 0x03,
    /// Captures only when triggered by software
    SoftwareTriggering = 0x04,
    /// Captures only when triggered by a hardware line
    HardwareTriggering = 0x05,
}

impl SyncMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(SyncMode::FreeRun),
            0x01 => Some(SyncMode::Primary),
            0x02 => Some(SyncMode::Secondary),
            0x03 => Some(SyncMode::SecondarySynced),
            0x04 => Some(SyncMode::SoftwareTriggering),
            0x05 => Some(SyncMode::HardwareTriggering),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Frames only arrive on an external trigger, so silence is expected.
    pub const fn is_externally_triggered(self) -> bool {
        matches!(
            self,
            SyncMode::SoftwareTriggering | SyncMode::HardwareTriggering
        )
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SyncMode::FreeRun => "free-run",
            SyncMode::Primary => "primary",
            SyncMode::Secondary => "secondary",
            SyncMode::SecondarySynced => "secondary-synced",
            SyncMode::SoftwareTriggering => "software-triggering",
            SyncMode::HardwareTriggering => "hardware-triggering",
        };
        write!(f, "{}", name)
    }
}

/// Source of the currently configured multi-device sync mode.
pub trait SyncConfig: Send + Sync {
    fn sync_mode(&self) -> SyncMode;
}

/// Sync configuration held in memory and changed at runtime.
#[derive(Debug, Default)]
pub struct StaticSyncConfig {
    mode: AtomicU8,
}

impl StaticSyncConfig {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode: AtomicU8::new(mode.code()),
        }
    }

    pub fn set(&self, mode: SyncMode) {
        self.mode.store(mode.code(), Ordering::Release);
    }
}

impl SyncConfig for StaticSyncConfig {
    fn sync_mode(&self) -> SyncMode {
        SyncMode::from_code(self.mode.load(Ordering::Acquire)).unwrap_or_default()
    }
}

/// Per-device state read by streams before they start.
pub struct DeviceContext {
    model_code: u16,
    model: ModelClass,
    firmware_updating: AtomicBool,
    error_mask: AtomicU32,
    work_mode: Mutex<WorkMode>,
    sync: Arc<dyn SyncConfig>,
}

impl DeviceContext {
    /// Create a context for a device reporting `model_code`.
    pub fn new(model_code: u16, sync: Arc<dyn SyncConfig>) -> Result<Self> {
        let model = ModelClass::from_code(model_code).ok_or_else(|| {
            Error::Configuration(format!("unsupported model code {:#06x}", model_code))
        })?;

        Ok(Self {
            model_code,
            model,
            firmware_updating: AtomicBool::new(false),
            error_mask: AtomicU32::new(0),
            work_mode: Mutex::new(WorkMode::Normal),
            sync,
        })
    }

    pub fn model_code(&self) -> u16 {
        self.model_code
    }

    pub fn model(&self) -> ModelClass {
        self.model
    }

    pub fn set_firmware_updating(&self, updating: bool) {
        self.firmware_updating.store(updating, Ordering::Release);
    }

    pub fn firmware_updating(&self) -> bool {
        self.firmware_updating.load(Ordering::Acquire)
    }

    pub fn set_error_mask(&self, mask: u32) {
        self.error_mask.store(mask, Ordering::Release);
    }

    pub fn error_mask(&self) -> u32 {
        self.error_mask.load(Ordering::Acquire)
    }

    pub fn set_work_mode(&self, mode: WorkMode) {
        *self.work_mode.lock() = mode;
    }

    pub fn work_mode(&self) -> WorkMode {
        *self.work_mode.lock()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync.sync_mode()
    }

    /// Fail fast if the device cannot start a stream of this type.
    pub fn check_stream_allowed(&self, stream_type: StreamType) -> Result<()> {
        if self.firmware_updating() {
            return Err(Error::DeviceBusy(
                "firmware update in progress".to_string(),
            ));
        }

        let mask = self.error_mask();
        if mask & stream_type.error_bit() != 0 {
            return Err(Error::DeviceFault { stream_type, mask });
        }

        Ok(())
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("model_code", &format_args!("{:#06x}", self.model_code))
            .field("model", &self.model)
            .field("firmware_updating", &self.firmware_updating())
            .field("error_mask", &self.error_mask())
            .field("work_mode", &self.work_mode())
            .field("sync_mode", &self.sync_mode())
            .finish()
    }
}
