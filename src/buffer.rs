// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Fixed-capacity frame byte buffer.
//!
//! The frame assembler writes converted block payloads into a
//! [`FrameBuffer`] sized exactly to the geometry's frame size. The buffer
//! never grows: a write that would pass the end is refused, so a
//! misbehaving device cannot cause unbounded allocation or an overrun.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ block 1 │ block 2 │ ... │ block k │    (unwritten)    │
//! └──────────────────────────────────────────────────────┘
//! 0                                  len              capacity
//! ```
//!
//! # Example
//!
//! ```
//! use edgefirst_lidarstream::buffer::FrameBuffer;
//!
//! let mut buf = FrameBuffer::with_capacity(8);
//! buf.write_with(4, |out| {
//!     out.copy_from_slice(&[1, 2, 3, 4]);
//!     Ok(4)
//! })
//! .unwrap();
//! assert_eq!(buf.len(), 4);
//!
//! let data = buf.freeze();
//! assert_eq!(&data[..], &[1, 2, 3, 4]);
//! ```

use crate::lidar::{Error, Result};
use std::sync::Arc;

/// Pre-allocated byte buffer with a write offset.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: Vec<u8>,
    len: usize,
}

impl FrameBuffer {
    /// Create a buffer holding exactly `capacity` bytes.
    ///
    /// Memory is allocated once at construction.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
        }
    }

    /// Returns the number of bytes written.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the fixed capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes still available for writing.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Reset the write offset without zeroing the memory.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Returns the written bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Reserve `reserve` bytes at the write offset and let `f` fill them.
    ///
    /// `f` returns how many of the reserved bytes it wrote; the offset
    /// advances by that amount. If `reserve` bytes do not fit, nothing is
    /// written and [`Error::InvalidPacket`] is returned with the offset
    /// unchanged. The offset is also unchanged when `f` fails.
    pub fn write_with<F>(&mut self, reserve: usize, f: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        if reserve > self.remaining() {
            return Err(Error::InvalidPacket(format!(
                "frame buffer overflow: offset {} + {} exceeds {}",
                self.len,
                reserve,
                self.capacity()
            )));
        }

        let start = self.len;
        let written = f(&mut self.data[start..start + reserve])?;
        let written = written.min(reserve);
        self.len += written;
        Ok(written)
    }

    /// Truncate to the written size and convert into shared frame data.
    pub fn freeze(mut self) -> Arc<[u8]> {
        self.data.truncate(self.len);
        Arc::from(self.data)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}
