// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Sensor stream state machine and per-frame pipeline.
//!
//! A [`SensorStream`] binds a [`RawPacketSource`] to a [`FrameAssembler`]
//! and runs every completed frame through the pipeline before handing it to
//! the consumer callback:
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ RawPacket    │──►│ FrameAssembler │──►│ profile ─ metadata ─ device  │──►│ callback │
//! │ Source       │   │                │   │ ts ─ global ts ─ anomaly ─   │   │ or       │
//! └──────────────┘   └────────────────┘   │ record                       │   │ processor│
//!                                         └──────────────────────────────┘   └──────────┘
//! ```
//!
//! The pipeline runs on the thread that delivered the packet. Each stage is
//! isolated: an error or a panic in one stage drops that frame only.
//!
//! # Locking
//!
//! - `state`: state, profile, callback, recovery parameters and the wake
//!   counter. Never held while user code runs.
//! - `restart`: reentrant, held by start, stop and recovery restarts so a
//!   caller's stop waits for an in-flight restart. A stop issued from a
//!   frame callback never blocks on it while another stop is joining the
//!   delivery thread; it defers to that stop instead.
//! - `delivery`: reentrant, held while a frame is delivered. Stop passes
//!   through it after the source has stopped, so no callback runs once stop
//!   returns.

use crate::{
    assembler::{AssemblerStats, FrameAssembler},
    config::{RecoveryConfig, StreamConfig},
    device::{DeviceContext, SyncMode},
    frame::Frame,
    geometry::GeometryTable,
    lidar::{Error, Result, StreamProfile, StreamState, StreamType},
    metadata::MetadataParsers,
    packet_source::{PacketCallback, RawPacketSource},
    processor::FrameProcessor,
    recorder::FrameRecorder,
    recovery,
    timestamp::{
        AnomalyDetector, GlobalTimestampCalculator, HostClockGlobalTimestamp,
        RateAnomalyDetector, ReceiptTimestampCalculator, TimestampCalculator,
    },
};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::Duration,
};

/// How long a frame callback waits on the restart lock before checking
/// whether a stop has begun.
const RESTART_POLL: Duration = Duration::from_millis(10);

/// Consumer callback receiving delivered frames.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Listener notified with (new state, active profile) on every state change.
pub type StateListener = Arc<dyn Fn(StreamState, Option<StreamProfile>) + Send + Sync>;

/// Stream counters, cumulative over the life of the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames handed to the consumer
    pub frames_delivered: u64,
    /// Frames dropped by a failing pipeline stage
    pub frames_dropped: u64,
    /// Frames that completed after stop was requested
    pub late_frames: u64,
    /// Recovery restarts that succeeded
    pub recoveries: u64,
    /// Recovery restarts that failed
    pub failed_recoveries: u64,
}

/// State guarded by the state lock.
pub(crate) struct Inner {
    pub(crate) state: StreamState,
    pub(crate) profile: Option<StreamProfile>,
    pub(crate) callback: Option<FrameCallback>,
    pub(crate) recovery: RecoveryConfig,
    /// Bumped on every notification of the condition variable
    pub(crate) wake_seq: u64,
    /// Bumped on every start; packets and restarts from older activations
    /// are ignored
    pub(crate) activation: u64,
    /// Suppresses listener fan-out while a recovery restart is in progress
    pub(crate) quiet: bool,
    /// Set when a frame callback asked to stop while another stop or
    /// restart held the restart lock
    pub(crate) stop_pending: bool,
    pub(crate) shutdown: bool,
    pub(crate) listeners: Vec<StateListener>,
    pub(crate) stats: StreamStats,
}

/// Listener invocations collected under the state lock, fired after it is
/// released.
#[must_use]
pub(crate) struct Notice {
    listeners: Vec<StateListener>,
    state: StreamState,
    profile: Option<StreamProfile>,
}

impl Notice {
    pub(crate) fn fire(self) {
        for listener in &self.listeners {
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| listener(self.state, self.profile)))
            {
                error!("state listener panicked: {}", panic_reason(payload));
            }
        }
    }
}

impl Inner {
    fn notify(&mut self, wake: &Condvar) {
        self.wake_seq += 1;
        wake.notify_all();
    }

    /// Move to `to`, returning the listener fan-out for a real change.
    pub(crate) fn transition(&mut self, to: StreamState, wake: &Condvar) -> Option<Notice> {
        if self.state == to {
            return None;
        }
        debug!("stream state {} -> {}", self.state, to);
        self.state = to;
        self.notify(wake);
        if self.quiet || self.listeners.is_empty() {
            return None;
        }
        Some(Notice {
            listeners: self.listeners.clone(),
            state: to,
            profile: self.profile,
        })
    }

    pub(crate) fn notice(&self) -> Option<Notice> {
        if self.listeners.is_empty() {
            return None;
        }
        Some(Notice {
            listeners: self.listeners.clone(),
            state: self.state,
            profile: self.profile,
        })
    }
}

/// Pluggable per-frame pipeline stages.
struct Pipeline {
    metadata: MetadataParsers,
    timestamp: Box<dyn TimestampCalculator>,
    global: Box<dyn GlobalTimestampCalculator>,
    anomaly: Option<Box<dyn AnomalyDetector>>,
    recorder: Option<Arc<dyn FrameRecorder>>,
    processor: Option<Box<dyn FrameProcessor>>,
}

impl Pipeline {
    fn reset(&mut self, profile: &StreamProfile) {
        self.timestamp.reset();
        self.global.reset();
        if let Some(anomaly) = self.anomaly.as_mut() {
            anomaly.reset(profile.scan_rate);
        }
    }

    fn run(
        &mut self,
        mut frame: Frame,
        profile: StreamProfile,
        sync_mode: SyncMode,
    ) -> Result<Option<Frame>> {
        frame.set_profile(profile);

        let metadata = stage("metadata", || self.metadata.parse(frame.header()))?;
        frame.set_metadata(metadata);

        let device_ts = stage("timestamp", || self.timestamp.calculate(&frame))?;
        frame.set_device_timestamp_us(device_ts);

        let global_ts = stage("global_timestamp", || self.global.calculate(&frame, device_ts))?;
        frame.set_global_timestamp_us(global_ts);

        if let Some(anomaly) = self.anomaly.as_mut() {
            stage("anomaly", || anomaly.check(device_ts, sync_mode))?;
        }

        if let Some(recorder) = self.recorder.as_ref() {
            stage("record", || recorder.record(&frame))?;
        }

        match self.processor.as_mut() {
            Some(processor) => stage("process", move || processor.process(frame)),
            None => Ok(Some(frame)),
        }
    }
}

/// Run one pipeline stage, converting errors and panics into a stage error.
fn stage<T>(name: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Error::Stage {
            stage: name,
            reason: err.to_string(),
        }),
        Err(payload) => Err(Error::Stage {
            stage: name,
            reason: format!("panicked: {}", panic_reason(payload)),
        }),
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// State shared between the stream handle, the packet callback and the
/// recovery watcher.
pub(crate) struct Shared {
    pub(crate) stream_type: StreamType,
    pub(crate) device: Arc<DeviceContext>,
    table: Arc<GeometryTable>,
    source: Arc<dyn RawPacketSource>,
    this: Weak<Shared>,

    pub(crate) state: Mutex<Inner>,
    pub(crate) wake: Condvar,
    pub(crate) restart: ReentrantMutex<()>,
    delivery: ReentrantMutex<()>,

    assembler: Mutex<Option<FrameAssembler>>,
    last_assembler_stats: Mutex<AssemblerStats>,
    pipeline: Mutex<Pipeline>,
}

impl Shared {
    pub(crate) fn start(&self, profile: StreamProfile, callback: FrameCallback) -> Result<()> {
        let _restart = self.restart.lock();

        {
            let inner = self.state.lock();
            if !matches!(inner.state, StreamState::Stopped | StreamState::Error) {
                return Err(Error::InvalidState(format!(
                    "cannot start {} stream while {}",
                    self.stream_type, inner.state
                )));
            }
        }

        if profile.stream_type != self.stream_type {
            return Err(Error::Configuration(format!(
                "profile {} does not match {} stream",
                profile, self.stream_type
            )));
        }

        self.device.check_stream_allowed(self.stream_type)?;

        let geometry = self.table.resolve(
            self.device.model(),
            profile.scan_rate,
            profile.format,
            self.device.work_mode(),
        )?;

        self.pipeline.lock().reset(&profile);
        *self.assembler.lock() = Some(FrameAssembler::new(geometry, profile.format));

        let (activation, notice) = {
            let mut inner = self.state.lock();
            inner.activation += 1;
            inner.stop_pending = false;
            inner.profile = Some(profile);
            inner.callback = Some(callback);
            let notice = inner.transition(StreamState::Starting, &self.wake);
            (inner.activation, notice)
        };
        if let Some(notice) = notice {
            notice.fire();
        }

        let this = self.this.clone();
        let on_packet: PacketCallback = Arc::new(move |data: &[u8]| {
            if let Some(shared) = this.upgrade() {
                shared.on_packet(activation, data);
            }
        });

        if let Err(err) = self.source.start(on_packet) {
            warn!("{} stream source failed to start: {}", self.stream_type, err);
            self.assembler.lock().take();
            let notice = {
                let mut inner = self.state.lock();
                inner.callback = None;
                inner.transition(StreamState::Stopped, &self.wake)
            };
            if let Some(notice) = notice {
                notice.fire();
            }
            return Err(err);
        }

        info!(
            "{} stream started: {} ({} blocks of {} points)",
            self.stream_type, profile, geometry.max_blocks_per_frame, geometry.points_per_block
        );
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        self.halt(StreamState::Stopped)
    }

    /// Stop the source and settle in `end`, which is Stopped or Error.
    pub(crate) fn halt(&self, end: StreamState) -> Result<()> {
        let _restart = if self.delivery.is_owned_by_current_thread() {
            match self.restart_from_delivery(end) {
                Some(guard) => guard,
                None => return Ok(()),
            }
        } else {
            self.restart.lock()
        };

        let notice = {
            let mut inner = self.state.lock();
            if inner.state == end || (inner.state == StreamState::Stopped && end == StreamState::Error)
            {
                return Ok(());
            }
            inner.transition(StreamState::Stopping, &self.wake)
        };
        // A forced failure is reported as a single change to Error.
        if let Some(notice) = notice
            && end == StreamState::Stopped
        {
            notice.fire();
        }

        let result = self.source.stop();
        if let Err(err) = &result {
            warn!("{} stream source failed to stop: {}", self.stream_type, err);
        }

        // Wait out any frame still being delivered.
        drop(self.delivery.lock());

        if let Some(assembler) = self.assembler.lock().take() {
            let stats = assembler.stats();
            if assembler.offset() > 0 {
                debug!("discarding partial frame of {} bytes", assembler.offset());
            }
            debug!("assembler: {:?}", stats);
            *self.last_assembler_stats.lock() = stats;
        }

        let notice = {
            let mut inner = self.state.lock();
            inner.callback = None;
            inner.transition(end, &self.wake)
        };
        if let Some(notice) = notice {
            notice.fire();
        }

        match end {
            StreamState::Error => error!("{} stream failed", self.stream_type),
            _ => info!("{} stream stopped", self.stream_type),
        }
        result
    }

    /// Take the restart lock from inside a frame callback.
    ///
    /// A stop already in flight may be joining this very thread, so the
    /// lock is never waited on unbounded. Returns None when that stop is
    /// left to finish on its own.
    fn restart_from_delivery(&self, end: StreamState) -> Option<ReentrantMutexGuard<'_, ()>> {
        loop {
            {
                let mut inner = self.state.lock();
                if inner.state == end {
                    return None;
                }
                if inner.state == StreamState::Stopping {
                    debug!("{} stream: stop already in progress", self.stream_type);
                    inner.stop_pending = true;
                    return None;
                }
            }
            if let Some(guard) = self.restart.try_lock_for(RESTART_POLL) {
                return Some(guard);
            }
        }
    }

    fn is_current(&self, activation: u64) -> bool {
        let inner = self.state.lock();
        inner.activation == activation && inner.state.is_active()
    }

    fn on_packet(&self, activation: u64, data: &[u8]) {
        if !self.is_current(activation) {
            return;
        }

        let frame = match self.assembler.lock().as_mut() {
            Some(assembler) => assembler.ingest(data),
            None => None,
        };

        if let Some(frame) = frame {
            let _delivery = self.delivery.lock();
            self.deliver(frame, activation);
        }
    }

    fn deliver(&self, frame: Frame, activation: u64) {
        let (profile, callback) = {
            let mut inner = self.state.lock();
            match (inner.profile, inner.callback.clone()) {
                (Some(profile), Some(callback))
                    if inner.activation == activation && inner.state.is_active() =>
                {
                    (profile, callback)
                }
                _ => {
                    trace!("dropping frame {} completed after stop", frame.sequence());
                    inner.stats.late_frames += 1;
                    return;
                }
            }
        };

        let sync_mode = self.device.sync_mode();
        let result = self.pipeline.lock().run(frame, profile, sync_mode);
        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                match &err {
                    Error::Stage { stage: "anomaly", .. } => debug!("dropping frame: {}", err),
                    _ => warn!("dropping frame: {}", err),
                }
                self.state.lock().stats.frames_dropped += 1;
                return;
            }
        };

        let notice = {
            let mut inner = self.state.lock();
            // A frame finishing after stop was requested never revives the stream.
            if inner.activation != activation || !inner.state.is_active() {
                inner.stats.late_frames += 1;
                return;
            }
            inner.stats.frames_delivered += 1;
            let notice = inner.transition(StreamState::Streaming, &self.wake);
            inner.notify(&self.wake);
            notice
        };
        if let Some(notice) = notice {
            notice.fire();
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(frame))) {
            error!("frame callback panicked: {}", panic_reason(payload));
        }
    }
}

/// A sensor stream bound to one device and one packet source.
pub struct SensorStream {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SensorStream {
    pub fn new(
        stream_type: StreamType,
        device: Arc<DeviceContext>,
        table: Arc<GeometryTable>,
        source: Arc<dyn RawPacketSource>,
        config: &StreamConfig,
    ) -> Result<Self> {
        let anomaly: Option<Box<dyn AnomalyDetector>> = if config.anomaly.enabled {
            Some(Box::new(RateAnomalyDetector::from_config(&config.anomaly)))
        } else {
            None
        };

        let shared = Arc::new_cyclic(|this| Shared {
            stream_type,
            device,
            table,
            source,
            this: this.clone(),
            state: Mutex::new(Inner {
                state: StreamState::Stopped,
                profile: None,
                callback: None,
                recovery: config.recovery,
                wake_seq: 0,
                activation: 0,
                quiet: false,
                stop_pending: false,
                shutdown: false,
                listeners: Vec::new(),
                stats: StreamStats::default(),
            }),
            wake: Condvar::new(),
            restart: ReentrantMutex::new(()),
            delivery: ReentrantMutex::new(()),
            assembler: Mutex::new(None),
            last_assembler_stats: Mutex::new(AssemblerStats::default()),
            pipeline: Mutex::new(Pipeline {
                metadata: MetadataParsers::default(),
                timestamp: Box::new(ReceiptTimestampCalculator::new()),
                global: Box::new(HostClockGlobalTimestamp::new()),
                anomaly,
                recorder: None,
                processor: None,
            }),
        });

        let stream = Self {
            shared,
            watcher: Mutex::new(None),
        };
        if config.recovery.is_enabled() {
            stream.spawn_watcher()?;
        }
        Ok(stream)
    }

    fn spawn_watcher(&self) -> Result<()> {
        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(recovery::spawn(self.shared.clone())?);
        }
        Ok(())
    }

    fn join_watcher(&self) {
        if let Some(handle) = self.watcher.lock().take()
            && handle.join().is_err()
        {
            error!("recovery watcher panicked");
        }
    }

    /// Start streaming `profile`, delivering frames to `callback`.
    ///
    /// Permitted from Stopped or Error. Device and configuration errors are
    /// returned without changing state.
    pub fn start<F>(&self, profile: StreamProfile, callback: F) -> Result<()>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.shared.start(profile, Arc::new(callback))
    }

    /// Stop streaming. Idempotent; once it returns no callback is running.
    ///
    /// May be called from the frame callback. If another thread is already
    /// stopping the stream, the call returns at once and that stop finishes
    /// after the callback returns.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.lock().state
    }

    pub fn stream_type(&self) -> StreamType {
        self.shared.stream_type
    }

    /// Profile of the current or most recent activation.
    pub fn active_profile(&self) -> Option<StreamProfile> {
        self.shared.state.lock().profile
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.state.lock().stats
    }

    /// Assembler counters of the current activation, or of the last one.
    pub fn assembler_stats(&self) -> AssemblerStats {
        match self.shared.assembler.lock().as_ref() {
            Some(assembler) => assembler.stats(),
            None => *self.shared.last_assembler_stats.lock(),
        }
    }

    /// Register a listener for state changes.
    pub fn add_state_listener<F>(&self, listener: F)
    where
        F: Fn(StreamState, Option<StreamProfile>) + Send + Sync + 'static,
    {
        self.shared.state.lock().listeners.push(Arc::new(listener));
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        self.shared.state.lock().recovery
    }

    /// Change the recovery parameters. Disabling recovery entirely stops and
    /// joins the watcher thread.
    pub fn set_recovery_config(&self, config: RecoveryConfig) -> Result<()> {
        {
            let mut inner = self.shared.state.lock();
            inner.recovery = config;
            inner.notify(&self.shared.wake);
        }
        if config.is_enabled() {
            self.spawn_watcher()
        } else {
            self.join_watcher();
            Ok(())
        }
    }

    pub fn set_metadata_parsers(&self, parsers: MetadataParsers) {
        self.shared.pipeline.lock().metadata = parsers;
    }

    pub fn set_timestamp_calculator(&self, calculator: Box<dyn TimestampCalculator>) {
        self.shared.pipeline.lock().timestamp = calculator;
    }

    pub fn set_global_timestamp_calculator(&self, calculator: Box<dyn GlobalTimestampCalculator>) {
        self.shared.pipeline.lock().global = calculator;
    }

    pub fn set_anomaly_detector(&self, detector: Option<Box<dyn AnomalyDetector>>) {
        self.shared.pipeline.lock().anomaly = detector;
    }

    pub fn set_recorder(&self, recorder: Option<Arc<dyn FrameRecorder>>) {
        self.shared.pipeline.lock().recorder = recorder;
    }

    pub fn set_frame_processor(&self, processor: Option<Box<dyn FrameProcessor>>) {
        self.shared.pipeline.lock().processor = processor;
    }
}

impl Drop for SensorStream {
    fn drop(&mut self) {
        if let Err(err) = self.shared.stop() {
            warn!("{} stream: {}", self.shared.stream_type, err);
        }
        {
            let mut inner = self.shared.state.lock();
            inner.shutdown = true;
            inner.notify(&self.shared.wake);
        }
        self.join_watcher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::StaticSyncConfig,
        geometry::Geometry,
        lidar::{DataFormat, ModelClass, ScanRate, WorkMode},
        metadata::MetadataKey,
        packet::BlockBuilder,
        packet_source::TestSource,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        stream: SensorStream,
        source: Arc<TestSource>,
        device: Arc<DeviceContext>,
        builder: BlockBuilder,
        geometry: Geometry,
        frames: Arc<Mutex<Vec<Frame>>>,
        states: Arc<Mutex<Vec<StreamState>>>,
    }

    fn profile() -> StreamProfile {
        StreamProfile::new(StreamType::Lidar, DataFormat::Scan, ScanRate::Hz10)
    }

    fn harness() -> Harness {
        let device = Arc::new(
            DeviceContext::new(0x0101, Arc::new(StaticSyncConfig::default())).unwrap(),
        );
        let source = Arc::new(TestSource::new());
        let mut config = StreamConfig {
            recovery: RecoveryConfig::disabled(),
            ..StreamConfig::default()
        };
        // Back-to-back test sweeps can land within the same microsecond
        config.anomaly.enabled = false;
        let stream = SensorStream::new(
            StreamType::Lidar,
            device.clone(),
            Arc::new(GeometryTable::new()),
            source.clone(),
            &config,
        )
        .unwrap();

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        stream.add_state_listener(move |state, _| sink.lock().push(state));

        let geometry = GeometryTable::new()
            .resolve(ModelClass::SingleLine, ScanRate::Hz10, DataFormat::Scan, WorkMode::Normal)
            .unwrap();
        Harness {
            stream,
            source,
            device,
            builder: BlockBuilder::new(0x0101, ScanRate::Hz10, DataFormat::Scan),
            geometry,
            frames: Arc::new(Mutex::new(Vec::new())),
            states,
        }
    }

    impl Harness {
        fn start(&self) -> Result<()> {
            let frames = self.frames.clone();
            self.stream.start(profile(), move |frame| frames.lock().push(frame))
        }

        fn sweep(&self, index: u32) {
            self.source.inject_all(self.builder.sweep(&self.geometry, index));
        }
    }

    #[test]
    fn test_start_stop_transitions() {
        let h = harness();
        assert_eq!(h.stream.state(), StreamState::Stopped);

        h.start().unwrap();
        assert_eq!(h.stream.state(), StreamState::Starting);
        assert_eq!(h.stream.active_profile(), Some(profile()));

        h.sweep(0);
        assert_eq!(h.stream.state(), StreamState::Streaming);
        assert_eq!(h.frames.lock().len(), 1);

        h.stream.stop().unwrap();
        assert_eq!(h.stream.state(), StreamState::Stopped);
        h.stream.stop().unwrap();

        assert_eq!(
            *h.states.lock(),
            vec![
                StreamState::Starting,
                StreamState::Streaming,
                StreamState::Stopping,
                StreamState::Stopped,
            ]
        );
    }

    #[test]
    fn test_frame_pipeline_fields() {
        let h = harness();
        h.start().unwrap();
        h.sweep(7);
        h.sweep(8);

        let frames = h.frames.lock();
        assert_eq!(frames.len(), 2);
        let frame = &frames[1];
        assert_eq!(frame.profile(), Some(&profile()));
        assert_eq!(frame.metadata_value(MetadataKey::SweepIndex), Some(8));
        assert_eq!(frame.byte_size(), h.geometry.total_frame_byte_size);
        assert!(frame.device_timestamp_us() >= frames[0].device_timestamp_us());
        assert!(frame.global_timestamp_us() > frame.device_timestamp_us());
    }

    #[test]
    fn test_start_rejected_while_active() {
        let h = harness();
        h.start().unwrap();
        assert!(matches!(h.start(), Err(Error::InvalidState(_))));
        assert_eq!(h.stream.state(), StreamState::Starting);
    }

    #[test]
    fn test_device_busy_rejects_start() {
        let h = harness();
        h.device.set_firmware_updating(true);
        assert!(matches!(h.start(), Err(Error::DeviceBusy(_))));
        assert_eq!(h.stream.state(), StreamState::Stopped);
        assert!(!h.source.is_started());

        h.device.set_firmware_updating(false);
        h.device.set_error_mask(StreamType::Lidar.error_bit());
        assert!(matches!(h.start(), Err(Error::DeviceFault { .. })));
        assert!(h.states.lock().is_empty());
    }

    #[test]
    fn test_configuration_error_leaves_stopped() {
        let h = harness();
        let bad = StreamProfile::new(StreamType::Lidar, DataFormat::Point, ScanRate::Hz10);
        let result = h.stream.start(bad, |_| {});
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(h.stream.state(), StreamState::Stopped);

        h.device.set_work_mode(WorkMode::Calibration);
        assert!(matches!(h.start(), Err(Error::Configuration(_))));
        assert!(h.states.lock().is_empty());
    }

    #[test]
    fn test_source_start_failure_returns_to_stopped() {
        let h = harness();
        h.source.set_fail_start(true);
        assert!(matches!(h.start(), Err(Error::Source(_))));
        assert_eq!(h.stream.state(), StreamState::Stopped);
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let h = harness();
        h.start().unwrap();
        let blocks = h.builder.sweep(&h.geometry, 0);
        h.source.inject_all(&blocks[..10]);
        h.stream.stop().unwrap();

        // Source is stopped; nothing reaches the assembler
        assert_eq!(h.source.inject_all(&blocks[10..]), 0);
        assert!(h.frames.lock().is_empty());
        assert_eq!(h.stream.assembler_stats().packets, 10);
    }

    #[test]
    fn test_restart_after_stop() {
        let h = harness();
        h.start().unwrap();
        h.sweep(0);
        h.stream.stop().unwrap();
        h.start().unwrap();
        assert_eq!(h.stream.state(), StreamState::Starting);
        h.sweep(1);
        assert_eq!(h.stream.state(), StreamState::Streaming);
        assert_eq!(h.frames.lock().len(), 2);
        assert_eq!(h.stream.stats().frames_delivered, 2);
    }

    struct FailingStage;

    impl FrameProcessor for FailingStage {
        fn process(&mut self, frame: Frame) -> Result<Option<Frame>> {
            if frame.header().sweep_index % 2 == 0 {
                panic!("processor exploded");
            }
            Ok(Some(frame))
        }
    }

    #[test]
    fn test_failing_stage_drops_only_that_frame() {
        let h = harness();
        h.stream.set_frame_processor(Some(Box::new(FailingStage)));
        h.start().unwrap();
        for sweep in 0..4 {
            h.sweep(sweep);
        }
        let frames = h.frames.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.header().sweep_index % 2 == 1));
        assert_eq!(h.stream.stats().frames_dropped, 2);
        assert_eq!(h.stream.state(), StreamState::Streaming);
    }

    struct RejectAll;

    impl AnomalyDetector for RejectAll {
        fn reset(&mut self, _rate: ScanRate) {}

        fn check(&mut self, ts: u64, _sync_mode: SyncMode) -> Result<()> {
            Err(Error::TimestampAnomaly(format!("rejecting {}", ts)))
        }
    }

    #[test]
    fn test_anomaly_drops_silently() {
        let h = harness();
        h.stream.set_anomaly_detector(Some(Box::new(RejectAll)));
        h.start().unwrap();
        h.sweep(0);
        assert!(h.frames.lock().is_empty());
        // No frame delivered, so no Streaming transition either
        assert_eq!(h.stream.state(), StreamState::Starting);
    }

    #[test]
    fn test_stop_from_callback() {
        let h = harness();
        let stream = Arc::new(h.stream);
        let weak = Arc::downgrade(&stream);
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = delivered.clone();
        stream
            .start(profile(), move |_frame| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(stream) = weak.upgrade() {
                    stream.stop().unwrap();
                }
            })
            .unwrap();

        h.source.inject_all(h.builder.sweep(&h.geometry, 0));
        h.source.inject_all(h.builder.sweep(&h.geometry, 1));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[test]
    fn test_metadata_failure_drops_frame() {
        let h = harness();
        h.start().unwrap();
        let bad_sync = h.builder.clone().sync_mode(0x7f);
        h.source.inject_all(bad_sync.sweep(&h.geometry, 0));
        assert!(h.frames.lock().is_empty());

        h.stream.set_metadata_parsers(MetadataParsers::with_keys(&[MetadataKey::Temperature]));
        h.source.inject_all(bad_sync.sweep(&h.geometry, 1));
        assert_eq!(h.frames.lock().len(), 1);
        assert_eq!(h.frames.lock()[0].metadata().len(), 1);
    }
}
