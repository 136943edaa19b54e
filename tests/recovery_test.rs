// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stall detection and automatic restart.

use edgefirst_lidarstream::{
    DataFormat, DeviceContext, GeometryTable, ModelClass, RecoveryConfig, ReplaySource,
    ScanRate, SensorStream, StaticSyncConfig, StreamConfig, StreamProfile, StreamState,
    StreamType, SyncMode, TestSource, WorkMode, packet::BlockBuilder,
};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

struct Fixture {
    stream: SensorStream,
    source: Arc<TestSource>,
    sync: Arc<StaticSyncConfig>,
    states: Arc<Mutex<Vec<StreamState>>>,
}

fn fixture(recovery: RecoveryConfig, sync_mode: SyncMode) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let sync = Arc::new(StaticSyncConfig::new(sync_mode));
    let device = Arc::new(DeviceContext::new(0x0101, sync.clone()).unwrap());
    let source = Arc::new(TestSource::new());
    let config = StreamConfig {
        recovery,
        ..StreamConfig::default()
    };
    let stream = SensorStream::new(
        StreamType::Lidar,
        device,
        Arc::new(GeometryTable::new()),
        source.clone(),
        &config,
    )
    .unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    stream.add_state_listener(move |state, _| sink.lock().push(state));

    Fixture {
        stream,
        source,
        sync,
        states,
    }
}

fn recovery(max_recovery_count: u32, no_stream_ms: u64, interrupt_ms: u64) -> RecoveryConfig {
    RecoveryConfig {
        max_recovery_count,
        no_stream_timeout_ms: no_stream_ms,
        stream_interrupt_timeout_ms: interrupt_ms,
    }
}

fn profile() -> StreamProfile {
    StreamProfile::new(StreamType::Lidar, DataFormat::Scan, ScanRate::Hz10)
}

fn sweep(index: u32) -> Vec<Vec<u8>> {
    let geometry = GeometryTable::new()
        .resolve(ModelClass::SingleLine, ScanRate::Hz10, DataFormat::Scan, WorkMode::Normal)
        .unwrap();
    BlockBuilder::new(0x0101, ScanRate::Hz10, DataFormat::Scan).sweep(&geometry, index)
}

fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_no_stream_exhausts_budget() {
    let f = fixture(recovery(2, 50, 50), SyncMode::FreeRun);

    let started = Instant::now();
    f.stream.start(profile(), |_| {}).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        f.stream.state() == StreamState::Error
    }));
    assert!(started.elapsed() >= Duration::from_millis(100));

    let stats = f.stream.stats();
    assert_eq!(stats.recoveries, 2);
    assert_eq!(stats.failed_recoveries, 0);
    // The original start plus two restarts
    assert_eq!(f.source.start_count(), 3);
    assert!(!f.source.is_started());

    // Restarts are invisible to listeners; only the final failure is seen.
    assert_eq!(
        *f.states.lock(),
        vec![StreamState::Starting, StreamState::Error]
    );
}

#[test]
fn test_start_from_error_after_recovery_gives_up() {
    let f = fixture(recovery(1, 40, 40), SyncMode::FreeRun);
    f.stream.start(profile(), |_| {}).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        f.stream.state() == StreamState::Error
    }));

    let frames = Arc::new(Mutex::new(0u32));
    let counter = frames.clone();
    f.stream.start(profile(), move |_| *counter.lock() += 1).unwrap();
    f.source.inject_all(sweep(0));
    assert_eq!(f.stream.state(), StreamState::Streaming);
    assert_eq!(*frames.lock(), 1);
    f.stream.stop().unwrap();
}

#[test]
fn test_stream_interrupt_restarts() {
    let f = fixture(recovery(3, 5_000, 50), SyncMode::FreeRun);
    let frames = Arc::new(Mutex::new(0u32));
    let counter = frames.clone();
    f.stream.start(profile(), move |_| *counter.lock() += 1).unwrap();

    f.source.inject_all(sweep(0));
    assert_eq!(f.stream.state(), StreamState::Streaming);

    assert!(wait_for(Duration::from_secs(5), || f.stream.stats().recoveries == 1));
    assert_eq!(f.stream.state(), StreamState::Starting);
    assert_eq!(f.source.start_count(), 2);

    // The restarted stream keeps the original callback.
    f.source.inject_all(sweep(1));
    assert_eq!(*frames.lock(), 2);
    f.stream.stop().unwrap();

    let states = f.states.lock();
    assert_eq!(
        states[..3],
        [
            StreamState::Starting,
            StreamState::Streaming,
            StreamState::Starting
        ]
    );
}

#[test]
fn test_triggered_sync_mode_suppresses_restart() {
    let f = fixture(recovery(1, 30, 30), SyncMode::HardwareTriggering);
    f.stream.start(profile(), |_| {}).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert_eq!(f.stream.state(), StreamState::Starting);
    assert_eq!(f.stream.stats().recoveries, 0);
    assert_eq!(f.source.start_count(), 1);

    // Free-running again: the next stall is acted on.
    f.sync.set(SyncMode::FreeRun);
    assert!(wait_for(Duration::from_secs(5), || {
        f.stream.state() == StreamState::Error
    }));
    assert_eq!(f.stream.stats().recoveries, 1);
}

#[test]
fn test_failed_restart_counts_against_budget() {
    let f = fixture(recovery(2, 50, 50), SyncMode::FreeRun);
    f.stream.start(profile(), |_| {}).unwrap();
    f.source.set_fail_start(true);

    assert!(wait_for(Duration::from_secs(5), || {
        f.stream.state() == StreamState::Error
    }));
    let stats = f.stream.stats();
    assert_eq!(stats.failed_recoveries, 2);
    assert_eq!(stats.recoveries, 0);
    assert_eq!(f.source.start_count(), 1);
}

#[test]
fn test_stop_wins_over_watcher() {
    let f = fixture(recovery(3, 60_000, 60_000), SyncMode::FreeRun);
    f.stream.start(profile(), |_| {}).unwrap();
    f.stream.stop().unwrap();
    assert_eq!(f.stream.state(), StreamState::Stopped);

    let started = Instant::now();
    drop(f.stream);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_disabling_recovery() {
    let f = fixture(recovery(1, 40, 40), SyncMode::FreeRun);
    f.stream.set_recovery_config(RecoveryConfig::disabled()).unwrap();
    assert!(!f.stream.recovery_config().is_enabled());

    f.stream.start(profile(), |_| {}).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(f.stream.state(), StreamState::Starting);
    assert_eq!(f.source.start_count(), 1);

    // Re-enabling spawns a fresh watcher that acts on the stall.
    f.stream.set_recovery_config(recovery(1, 40, 40)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        f.stream.state() == StreamState::Error
    }));
}

#[test]
fn test_frames_keep_watcher_quiet() {
    let f = fixture(recovery(1, 150, 150), SyncMode::FreeRun);
    f.stream.start(profile(), |_| {}).unwrap();

    for index in 0..10 {
        f.source.inject_all(sweep(index));
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(f.stream.state(), StreamState::Streaming);
    assert_eq!(f.stream.stats().recoveries, 0);
    assert_eq!(f.source.start_count(), 1);
    f.stream.stop().unwrap();
}

#[test]
fn test_callback_stop_during_restart() {
    let _ = env_logger::builder().is_test(true).try_init();
    let packets: Vec<Vec<u8>> = (0..4).flat_map(sweep).collect();
    let source = Arc::new(
        ReplaySource::new(packets)
            .with_interval(Duration::from_micros(200))
            .looping(true),
    );
    let sync = Arc::new(StaticSyncConfig::new(SyncMode::FreeRun));
    let config = StreamConfig {
        recovery: recovery(3, 5_000, 50),
        ..StreamConfig::default()
    };
    let stream = Arc::new(
        SensorStream::new(
            StreamType::Lidar,
            Arc::new(DeviceContext::new(0x0101, sync).unwrap()),
            Arc::new(GeometryTable::new()),
            source.clone(),
            &config,
        )
        .unwrap(),
    );

    // The first callback outlives the interrupt timeout, so the watcher
    // restarts the stream and joins this thread while it is still here.
    let entered = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let weak = Arc::downgrade(&stream);
    let (flag, done) = (entered.clone(), stopped.clone());
    stream
        .start(profile(), move |_| {
            if flag.swap(true, Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(300));
            if let Some(stream) = weak.upgrade() {
                stream.stop().unwrap();
                done.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || stopped.load(Ordering::SeqCst)));
    assert!(wait_for(Duration::from_secs(5), || {
        stream.state() == StreamState::Stopped
    }));

    // The restart was abandoned and nothing revives the stream.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(stream.state(), StreamState::Stopped);
    assert!(!source.is_running());
    assert_eq!(stream.stats().recoveries, 0);
}
