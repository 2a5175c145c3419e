// Copyright 2025 Chris Custine
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

//! Bounded hand-off between the acquisition and analysis threads.
//!
//! The producer never waits: when the buffer is full the oldest block is
//! discarded and counted. The consumer blocks until a block arrives or the
//! buffer is closed. Blocks must arrive in strictly increasing timestamp
//! order; anything else is rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;
use ringbuf::{HeapRb, Rb};

use crate::error::AcquisitionError;
use crate::source::SampleBlock;

struct Inner {
    ring: HeapRb<SampleBlock>,
    last_timestamp: Option<Duration>,
    closed: bool,
}

/// Bounded FIFO of sample blocks with drop-oldest overflow.
pub struct SampleBuffer {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
    overflow: AtomicU64,
    rejected: AtomicU64,
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("overflow", &self.overflow_count())
            .finish_non_exhaustive()
    }
}

impl SampleBuffer {
    /// Create a buffer holding at most `capacity` blocks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "sample buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                ring: HeapRb::new(capacity),
                last_timestamp: None,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
            overflow: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a block without blocking.
    ///
    /// On a full buffer the oldest block is evicted and
    /// [`AcquisitionError::BufferOverflow`] is returned; the new block has
    /// still been stored. Blocks that do not advance the stream clock are
    /// rejected with [`AcquisitionError::OutOfOrder`].
    pub fn push(&self, block: SampleBlock) -> Result<(), AcquisitionError> {
        let mut inner = self.lock();

        if inner.closed {
            return Err(AcquisitionError::BufferClosed);
        }

        let received = block.start_timestamp();
        if let Some(previous) = inner.last_timestamp {
            if received <= previous {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(AcquisitionError::OutOfOrder { previous, received });
            }
        }
        inner.last_timestamp = Some(received);

        let evicted = if inner.ring.len() >= self.capacity {
            inner.ring.pop()
        } else {
            None
        };
        let stored = inner.ring.push(block);
        debug_assert!(stored.is_ok(), "ring has room after eviction");
        drop(inner);

        self.available.notify_one();

        match evicted {
            Some(old) => {
                let dropped = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Buffer full, dropped block at {:?} (total dropped: {dropped})",
                    old.start_timestamp()
                );
                Err(AcquisitionError::BufferOverflow { dropped })
            }
            None => Ok(()),
        }
    }

    /// Take the oldest block, waiting until one is available.
    ///
    /// Returns `None` once the buffer is closed and drained.
    pub fn pop(&self) -> Option<SampleBlock> {
        let mut inner = self.lock();
        loop {
            if let Some(block) = inner.ring.pop() {
                return Some(block);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SampleBlock> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(block) = inner.ring.pop() {
                return Some(block);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if inner.closed || remaining.is_zero() {
                return None;
            }
            inner = self
                .available
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop accepting blocks and wake every waiting consumer.
    ///
    /// Blocks already queued can still be popped.
    pub fn close(&self) {
        let mut inner = self.lock();
        if !inner.closed {
            inner.closed = true;
            debug!("Sample buffer closed with {} blocks pending", inner.ring.len());
        }
        drop(inner);
        self.available.notify_all();
    }

    /// Discard every queued block.
    pub fn clear(&self) -> usize {
        self.lock().ring.clear()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks evicted because the buffer was full.
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Blocks refused for not advancing the stream clock.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;
    use std::sync::Arc;

    fn block_at(millis: u64) -> SampleBlock {
        SampleBlock::new(
            Duration::from_millis(millis),
            1_000_000.0,
            100e6,
            vec![Complex::new(0.0, 0.0); 16],
        )
    }

    #[test]
    fn test_overflow_keeps_most_recent() {
        let capacity = 4;
        let buffer = SampleBuffer::new(capacity);

        for ms in 0..capacity as u64 {
            assert!(buffer.push(block_at(ms)).is_ok());
        }
        assert_eq!(
            buffer.push(block_at(capacity as u64)),
            Err(AcquisitionError::BufferOverflow { dropped: 1 })
        );

        assert_eq!(buffer.len(), capacity);
        assert_eq!(buffer.overflow_count(), 1);

        let kept: Vec<u64> = std::iter::from_fn(|| buffer.pop_timeout(Duration::ZERO))
            .map(|b| b.start_timestamp().as_millis() as u64)
            .collect();
        assert_eq!(kept, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let buffer = SampleBuffer::new(4);
        buffer.push(block_at(10)).unwrap();

        assert!(matches!(
            buffer.push(block_at(10)),
            Err(AcquisitionError::OutOfOrder { .. })
        ));
        assert!(matches!(
            buffer.push(block_at(5)),
            Err(AcquisitionError::OutOfOrder { .. })
        ));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.rejected_count(), 2);
    }

    #[test]
    fn test_close_drains_then_ends() {
        let buffer = SampleBuffer::new(4);
        buffer.push(block_at(1)).unwrap();
        buffer.push(block_at(2)).unwrap();
        buffer.close();

        assert_eq!(buffer.push(block_at(3)), Err(AcquisitionError::BufferClosed));
        assert_eq!(buffer.pop().map(|b| b.start_timestamp()), Some(Duration::from_millis(1)));
        assert_eq!(buffer.pop().map(|b| b.start_timestamp()), Some(Duration::from_millis(2)));
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let buffer = Arc::new(SampleBuffer::new(2));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.pop())
        };

        std::thread::sleep(Duration::from_millis(20));
        buffer.push(block_at(7)).unwrap();

        let block = consumer.join().unwrap();
        assert_eq!(block.map(|b| b.start_timestamp()), Some(Duration::from_millis(7)));
    }

    #[test]
    fn test_pop_wakes_on_close() {
        let buffer = Arc::new(SampleBuffer::new(2));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.pop())
        };

        std::thread::sleep(Duration::from_millis(20));
        buffer.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_pop_timeout_on_empty() {
        let buffer = SampleBuffer::new(2);
        assert!(buffer.pop_timeout(Duration::from_millis(5)).is_none());
        assert!(buffer.is_empty());
    }
}
