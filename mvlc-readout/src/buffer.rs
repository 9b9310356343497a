// Copyright 2024-Present mesytec GmbH & Co. KG <info@mesytec.com>
// SPDX-License-Identifier: Apache-2.0

//! Readout buffers and the two-queue buffer pool.
//!
//! A buffer is exclusively owned by whichever queue or worker currently
//! holds it; the pool size is fixed and backpressure is expressed by the
//! empty queue draining.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use mvlc_proto::{words_from_bytes, TransportKind};

/// A growable byte buffer tagged with its transport type and a
/// monotonically increasing buffer number. After fixup it contains whole
/// frames (USB) or whole packets (ETH) only.
#[derive(Debug, Clone)]
pub struct ReadoutBuffer {
    kind: TransportKind,
    number: u32,
    data: Vec<u8>,
}

impl ReadoutBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            kind: TransportKind::Usb,
            number: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: TransportKind) {
        self.kind = kind;
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn set_number(&mut self, number: u32) {
        self.number = number;
    }

    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn free(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ensure_free_space(&mut self, bytes: usize) {
        if self.free() < bytes {
            self.data.reserve(bytes - self.free());
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append `len` bytes written by `f` into the buffer's free tail.
    /// `f` receives the uninitialized-but-zeroed tail region and returns
    /// how many bytes it actually produced.
    pub fn fill_tail(
        &mut self,
        max_len: usize,
        f: impl FnOnce(&mut [u8]) -> usize,
    ) -> usize {
        let old_len = self.data.len();
        self.data.resize(old_len + max_len, 0);
        let produced = f(&mut self.data[old_len..]);
        debug_assert!(produced <= max_len);
        self.data.truncate(old_len + produced);
        produced
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn view_u32(&self) -> Vec<u32> {
        words_from_bytes(&self.data)
    }
}

/// Fixed-size pool of readout buffers circulating through an empty and a
/// filled queue. One producer (a readout or replay worker) and one
/// consumer (the parser loop) pass buffers by value through bounded
/// channels.
pub struct BufferPool {
    empty_tx: Sender<ReadoutBuffer>,
    empty_rx: Receiver<ReadoutBuffer>,
    filled_tx: Sender<ReadoutBuffer>,
    filled_rx: Receiver<ReadoutBuffer>,
    buffer_count: usize,
}

impl BufferPool {
    pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;
    pub const DEFAULT_BUFFER_COUNT: usize = 10;

    pub fn new(buffer_count: usize, buffer_capacity: usize) -> Self {
        let (empty_tx, empty_rx) = bounded(buffer_count);
        let (filled_tx, filled_rx) = bounded(buffer_count);

        for _ in 0..buffer_count {
            // The channel was sized for exactly this many buffers.
            let _ = empty_tx.send(ReadoutBuffer::new(buffer_capacity));
        }

        Self {
            empty_tx,
            empty_rx,
            filled_tx,
            filled_rx,
            buffer_count,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn dequeue_empty(&self, timeout: Duration) -> Option<ReadoutBuffer> {
        self.empty_rx.recv_timeout(timeout).ok()
    }

    pub fn enqueue_empty(&self, mut buffer: ReadoutBuffer) {
        buffer.clear();
        let _ = self.empty_tx.send(buffer);
    }

    pub fn dequeue_filled(&self, timeout: Duration) -> Option<ReadoutBuffer> {
        self.filled_rx.recv_timeout(timeout).ok()
    }

    pub fn enqueue_filled(&self, buffer: ReadoutBuffer) {
        let _ = self.filled_tx.send(buffer);
    }

    pub fn filled_len(&self) -> usize {
        self.filled_rx.len()
    }

    pub fn empty_len(&self) -> usize {
        self.empty_rx.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUFFER_COUNT, Self::DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_circulate_between_the_queues() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.empty_len(), 2);

        let mut buffer = pool.dequeue_empty(Duration::from_millis(10)).unwrap();
        buffer.set_number(1);
        buffer.extend_from_slice(&[1, 2, 3, 4]);
        pool.enqueue_filled(buffer);

        assert_eq!(pool.empty_len(), 1);
        assert_eq!(pool.filled_len(), 1);

        let buffer = pool.dequeue_filled(Duration::from_millis(10)).unwrap();
        assert_eq!(buffer.number(), 1);
        assert_eq!(buffer.used(), 4);

        pool.enqueue_empty(buffer);
        assert_eq!(pool.empty_len(), 2);

        // returned buffers come back cleared
        while let Some(buffer) = pool.dequeue_empty(Duration::from_millis(1)) {
            assert_eq!(buffer.used(), 0);
        }
    }

    #[test]
    fn dequeue_times_out_when_drained() {
        let pool = BufferPool::new(1, 16);
        let _held = pool.dequeue_empty(Duration::from_millis(10)).unwrap();
        assert!(pool.dequeue_empty(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn fill_tail_truncates_to_produced_bytes() {
        let mut buffer = ReadoutBuffer::new(16);
        buffer.extend_from_slice(&[0xaa]);

        let produced = buffer.fill_tail(8, |tail| {
            tail[0] = 0xbb;
            tail[1] = 0xcc;
            2
        });

        assert_eq!(produced, 2);
        assert_eq!(buffer.data(), &[0xaa, 0xbb, 0xcc]);
    }
}
