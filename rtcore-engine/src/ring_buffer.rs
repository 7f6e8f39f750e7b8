//! Fixed-capacity circular buffer
//!
//! Single-producer/single-consumer storage for uniform elements. There is no
//! locking here; the owner serializes access.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{CoreError, CoreResult};

/// Circular buffer of `capacity` elements
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<T>,
    read_pos: usize,
    /// Unread element count
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a new ring buffer holding up to `capacity` elements
    pub fn new(capacity: usize) -> CoreResult<Self> {
        if capacity == 0 {
            return Err(CoreError::ConfigInvalid(
                "ring buffer capacity must be positive".to_string(),
            ));
        }
        Ok(RingBuffer {
            data: vec![T::default(); capacity],
            read_pos: 0,
            len: 0,
        })
    }

    /// Total number of elements the buffer can hold
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Elements written but not yet read
    pub fn available_read(&self) -> usize {
        self.len
    }

    /// Free slots
    pub fn available_write(&self) -> usize {
        self.capacity() - self.len
    }

    fn check_request(&self, n: usize) -> CoreResult<()> {
        if n > self.capacity() {
            return Err(CoreError::Buffer(format!(
                "request of {} elements exceeds capacity {}",
                n,
                self.capacity()
            )));
        }
        Ok(())
    }

    /// Read up to `dst.len()` elements, returning how many were copied
    pub fn read(&mut self, dst: &mut [T]) -> CoreResult<usize> {
        self.check_request(dst.len())?;

        let n = dst.len().min(self.len);
        let capacity = self.capacity();
        let first = n.min(capacity - self.read_pos);

        dst[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        // Second segment when the request crosses the end of storage
        dst[first..n].copy_from_slice(&self.data[..n - first]);

        self.read_pos = (self.read_pos + n) % capacity;
        self.len -= n;
        Ok(n)
    }

    /// Write as much of `src` as fits without overwriting unread data
    pub fn write(&mut self, src: &[T]) -> CoreResult<usize> {
        self.check_request(src.len())?;

        let n = src.len().min(self.available_write());
        let capacity = self.capacity();
        let write_pos = (self.read_pos + self.len) % capacity;
        let first = n.min(capacity - write_pos);

        self.data[write_pos..write_pos + first].copy_from_slice(&src[..first]);
        self.data[..n - first].copy_from_slice(&src[first..n]);

        self.len += n;
        Ok(n)
    }

    /// Move the read position without copying.
    ///
    /// A positive `delta` flushes unread elements, a negative one stuffs
    /// previously read elements back. Returns the signed distance moved,
    /// clamped by what is available in that direction.
    pub fn move_read(&mut self, delta: isize) -> CoreResult<isize> {
        self.check_request(delta.unsigned_abs())?;

        let capacity = self.capacity();
        if delta >= 0 {
            let moved = delta.unsigned_abs().min(self.len);
            self.read_pos = (self.read_pos + moved) % capacity;
            self.len -= moved;
            Ok(moved as isize)
        } else {
            let moved = delta.unsigned_abs().min(self.available_write());
            self.read_pos = (self.read_pos + capacity - moved) % capacity;
            self.len += moved;
            Ok(-(moved as isize))
        }
    }

    /// Drop all unread elements
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.len = 0;
    }
}
