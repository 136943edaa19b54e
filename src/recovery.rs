// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Recovery watcher.
//!
//! Each [`crate::stream::SensorStream`] with recovery enabled owns one
//! watcher thread. The watcher sleeps on the stream's condition variable and
//! restarts the stream when no frame arrives in time:
//!
//! - Stopped, Stopping or Error: wait for any state change, then reset the
//!   retry counter.
//! - Starting: wait up to `no_stream_timeout_ms` for the first frame.
//! - Streaming: wait up to `stream_interrupt_timeout_ms` for the next frame.
//!
//! A timeout with no wake in between is a stall. The stream is restarted
//! with its previous profile and callback, and after `max_recovery_count`
//! restarts it is forced into Error. Stalls are expected, and ignored, while
//! the device is in an externally triggered sync mode.
//!
//! Restarts happen under the stream's reentrant restart lock, so a caller's
//! `stop()` waits for an in-flight restart and then wins.

pub use crate::config::RecoveryConfig;

use crate::{
    lidar::{Error, Result, StreamState},
    stream::Shared,
};
use log::{debug, error, info, trace, warn};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

/// Outcome of one restart attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Restart {
    /// The stream changed or was stopped under us; no restart happened
    Aborted,
    Restarted,
    Failed,
}

pub(crate) fn spawn(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("recovery-{}", shared.stream_type))
        .spawn(move || watch(&shared))?;
    Ok(handle)
}

fn watch(shared: &Shared) {
    let mut retries = 0u32;
    let mut delivered_at_restart = 0u64;
    debug!("{} recovery watcher started", shared.stream_type);

    loop {
        let mut inner = shared.state.lock();
        if inner.shutdown || !inner.recovery.is_enabled() {
            break;
        }

        let timeout = match inner.state {
            StreamState::Starting => inner.recovery.no_stream_timeout(),
            StreamState::Streaming => {
                if retries > 0 && inner.stats.frames_delivered > delivered_at_restart {
                    info!(
                        "{} stream recovered after {} restarts",
                        shared.stream_type, retries
                    );
                    retries = 0;
                }
                inner.recovery.stream_interrupt_timeout()
            }
            StreamState::Stopped | StreamState::Stopping | StreamState::Error => {
                let seq = inner.wake_seq;
                while inner.wake_seq == seq {
                    shared.wake.wait(&mut inner);
                }
                retries = 0;
                continue;
            }
        };

        let Some(timeout) = timeout else {
            // This check is disabled; sleep until something changes.
            let seq = inner.wake_seq;
            while inner.wake_seq == seq {
                shared.wake.wait(&mut inner);
            }
            continue;
        };

        let (state, activation, seq) = (inner.state, inner.activation, inner.wake_seq);
        let deadline = Instant::now() + timeout;
        let mut stalled = false;
        while inner.wake_seq == seq {
            if shared.wake.wait_until(&mut inner, deadline).timed_out() {
                stalled = inner.wake_seq == seq;
                break;
            }
        }
        if !stalled {
            continue;
        }
        let max_recovery_count = inner.recovery.max_recovery_count;
        drop(inner);

        let sync_mode = shared.device.sync_mode();
        if sync_mode.is_externally_triggered() {
            trace!(
                "{} stream idle for {:?} in {} sync mode",
                shared.stream_type, timeout, sync_mode
            );
            continue;
        }

        warn!(
            "{} stream: no frames for {:?} while {}, restart {}/{}",
            shared.stream_type,
            timeout,
            state,
            retries + 1,
            max_recovery_count
        );
        match restart(shared, state, activation) {
            Restart::Aborted => continue,
            Restart::Restarted | Restart::Failed => retries += 1,
        }
        delivered_at_restart = shared.state.lock().stats.frames_delivered;

        if retries >= max_recovery_count {
            error!("{} stream: {}", shared.stream_type, stall(retries));
            if let Err(err) = shared.halt(StreamState::Error) {
                warn!("{} stream: {}", shared.stream_type, err);
            }
        }
    }

    debug!("{} recovery watcher exiting", shared.stream_type);
}

fn stall(retries: u32) -> Error {
    Error::Stall(format!("no frames after {} restarts, giving up", retries))
}

/// Stop then start the stream with its previous profile and callback.
///
/// Intermediate transitions are hidden from listeners; only a net change of
/// state is reported.
fn restart(shared: &Shared, expected: StreamState, activation: u64) -> Restart {
    let _restart = shared.restart.lock();

    let (profile, callback) = {
        let mut inner = shared.state.lock();
        if inner.shutdown || inner.state != expected || inner.activation != activation {
            return Restart::Aborted;
        }
        match (inner.profile, inner.callback.clone()) {
            (Some(profile), Some(callback)) => {
                inner.quiet = true;
                (profile, callback)
            }
            _ => return Restart::Aborted,
        }
    };

    if let Err(err) = shared.stop() {
        warn!("{} stream: restart stop failed: {}", shared.stream_type, err);
    }

    // The consumer stopped the stream from its callback while we were
    // tearing it down; leave it stopped.
    let aborted = {
        let mut inner = shared.state.lock();
        if inner.stop_pending {
            inner.quiet = false;
            Some(inner.notice())
        } else {
            None
        }
    };
    if let Some(notice) = aborted {
        info!("{} stream: stopped during restart", shared.stream_type);
        if let Some(notice) = notice {
            notice.fire();
        }
        return Restart::Aborted;
    }

    let outcome = match shared.start(profile, callback.clone()) {
        Ok(()) => Restart::Restarted,
        Err(err) => {
            warn!("{} stream: restart failed: {}", shared.stream_type, err);
            Restart::Failed
        }
    };

    let notice = {
        let mut inner = shared.state.lock();
        match outcome {
            Restart::Failed => {
                // Hold in Starting so the next timeout retries.
                inner.profile = Some(profile);
                inner.callback = Some(callback);
                inner.activation += 1;
                let _ = inner.transition(StreamState::Starting, &shared.wake);
                inner.stats.failed_recoveries += 1;
            }
            _ => inner.stats.recoveries += 1,
        }
        inner.quiet = false;
        if inner.state != expected {
            inner.notice()
        } else {
            None
        }
    };
    if let Some(notice) = notice {
        notice.fire();
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_reason() {
        let err = stall(3);
        assert!(matches!(err, Error::Stall(_)));
        assert_eq!(
            err.to_string(),
            "stream stalled: no frames after 3 restarts, giving up"
        );
    }
}
