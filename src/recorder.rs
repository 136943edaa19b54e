// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame recording sink.
//!
//! Recording runs on the packet delivery thread, so a recorder must never
//! block. [`FileRecorder`] hands frames to a writer thread through a bounded
//! `kanal` channel and drops (and counts) frames when the queue is full.
//!
//! # File Layout
//!
//! ```text
//! "LDSTREC1"                             file magic, 8 bytes
//! repeated:
//!   sequence            u64 LE
//!   device timestamp    u64 LE (us)
//!   global timestamp    u64 LE (us)
//!   format code         u8
//!   data length         u32 LE
//!   data                [u8; length]
//! ```

use crate::{
    frame::Frame,
    lidar::{DataFormat, Error, Result},
};
use kanal::{Receiver, Sender};
use log::{debug, error, warn};
use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

/// Recording file magic
pub const RECORDING_MAGIC: [u8; 8] = *b"LDSTREC1";

const RECORD_HEADER_LEN: usize = 8 + 8 + 8 + 1 + 4;

/// Sink receiving a copy of every delivered frame.
pub trait FrameRecorder: Send + Sync {
    /// Queue a frame for recording without blocking.
    fn record(&self, frame: &Frame) -> Result<()>;
}

/// Records frames to a file from a dedicated writer thread.
pub struct FileRecorder {
    tx: Option<Sender<Frame>>,
    writer: Option<JoinHandle<Result<u64>>>,
    dropped: Arc<AtomicU64>,
}

impl FileRecorder {
    /// Create `path` and start the writer thread with a queue of
    /// `queue_depth` frames.
    pub fn create<P: AsRef<Path>>(path: P, queue_depth: usize) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path.as_ref())?);
        file.write_all(&RECORDING_MAGIC)?;

        let (tx, rx) = kanal::bounded(queue_depth.max(1));
        let writer = thread::Builder::new()
            .name("frame-recorder".to_string())
            .spawn(move || write_frames(file, rx))?;

        debug!("recording frames to {}", path.as_ref().display());
        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Frames dropped because the writer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush the queue, close the file and return the number of frames
    /// written.
    pub fn finish(mut self) -> Result<u64> {
        self.close()
    }

    fn close(&mut self) -> Result<u64> {
        // Dropping the sender ends the writer loop once the queue drains.
        self.tx.take();
        match self.writer.take() {
            Some(writer) => writer
                .join()
                .map_err(|_| Error::Io(std::io::Error::other("recorder thread panicked")))?,
            None => Ok(0),
        }
    }
}

impl FrameRecorder for FileRecorder {
    fn record(&self, frame: &Frame) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(Error::Stage {
                stage: "record",
                reason: "recorder closed".to_string(),
            });
        };

        match tx.try_send(frame.clone()) {
            Ok(true) => Ok(()),
            Ok(false) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("recorder queue full, {} frames dropped", dropped);
                }
                Ok(())
            }
            Err(err) => Err(Error::Stage {
                stage: "record",
                reason: err.to_string(),
            }),
        }
    }
}

impl Drop for FileRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("recorder: {}", err);
        }
    }
}

fn write_frames(mut file: BufWriter<File>, rx: Receiver<Frame>) -> Result<u64> {
    let mut written = 0u64;
    let mut failed = false;

    while let Ok(frame) = rx.recv() {
        if failed {
            continue;
        }
        if let Err(err) = write_frame(&mut file, &frame) {
            // Keep draining so producers never see a closed channel.
            error!("recording stopped: {}", err);
            failed = true;
            continue;
        }
        written += 1;
    }

    file.flush()?;
    debug!("recorder wrote {} frames", written);
    Ok(written)
}

fn write_frame<W: Write>(out: &mut W, frame: &Frame) -> Result<()> {
    out.write_all(&frame.sequence().to_le_bytes())?;
    out.write_all(&frame.device_timestamp_us().to_le_bytes())?;
    out.write_all(&frame.global_timestamp_us().to_le_bytes())?;
    out.write_all(&[frame.format().code()])?;
    out.write_all(&(frame.byte_size() as u32).to_le_bytes())?;
    out.write_all(frame.data())?;
    Ok(())
}

/// A frame read back from a recording.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedFrame {
    pub sequence: u64,
    pub device_timestamp_us: u64,
    pub global_timestamp_us: u64,
    pub format: DataFormat,
    pub data: Vec<u8>,
}

/// Read every frame from a recording file.
///
/// A truncated final record, as left by an interrupted writer, is ignored.
pub fn read_recording<P: AsRef<Path>>(path: P) -> Result<Vec<RecordedFrame>> {
    let mut input = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if magic != RECORDING_MAGIC {
        return Err(Error::InvalidPacket(format!(
            "not a frame recording: magic {:02x?}",
            magic
        )));
    }

    let mut frames = Vec::new();
    let mut header = [0u8; RECORD_HEADER_LEN];
    loop {
        match input.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }

        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&header[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        let format = DataFormat::from_code(header[24]).ok_or_else(|| {
            Error::InvalidPacket(format!("unknown format code {:#04x}", header[24]))
        })?;
        let len = u32::from_le_bytes([header[25], header[26], header[27], header[28]]) as usize;

        let mut data = vec![0u8; len];
        match input.read_exact(&mut data) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                warn!("recording ends with a truncated frame");
                break;
            }
            Err(err) => return Err(err.into()),
        }

        frames.push(RecordedFrame {
            sequence: u64_at(0),
            device_timestamp_us: u64_at(8),
            global_timestamp_us: u64_at(16),
            format,
            data,
        });
    }

    Ok(frames)
}
