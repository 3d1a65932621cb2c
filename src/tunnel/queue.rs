//! Bounded packet queue with back-pressure

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// FIFO of byte chunks waiting to be written to one endpoint
///
/// Once the queued byte count reaches the high-water mark the queue reports
/// itself saturated, and stays so until it drains to the low-water mark.
/// The forwarder stops reading from the queue's source while it is
/// saturated.
#[derive(Debug)]
pub struct PacketQueue {
    chunks: VecDeque<Bytes>,
    queued: usize,
    high_water: usize,
    low_water: usize,
    saturated: bool,
}

impl PacketQueue {
    /// Create a queue with the given watermarks
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            queued: 0,
            high_water,
            low_water: low_water.min(high_water),
            saturated: false,
        }
    }

    /// Append a chunk
    pub fn push_back(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.queued += chunk.len();
        self.chunks.push_back(chunk);
        self.update_pressure();
    }

    /// Put a chunk back at the head, ahead of everything queued
    pub fn push_front(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.queued += chunk.len();
        self.chunks.push_front(chunk);
        self.update_pressure();
    }

    /// Take the head chunk
    pub fn pop_front(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.queued -= chunk.len();
        self.update_pressure();
        Some(chunk)
    }

    /// Peek at the head chunk
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Concatenate the first two chunks into one
    ///
    /// Returns false when fewer than two chunks are queued.
    pub fn merge_front(&mut self) -> bool {
        if self.chunks.len() < 2 {
            return false;
        }
        let (Some(first), Some(second)) = (self.chunks.pop_front(), self.chunks.pop_front()) else {
            return false;
        };

        let mut merged = BytesMut::with_capacity(first.len() + second.len());
        merged.extend_from_slice(&first);
        merged.extend_from_slice(&second);
        self.chunks.push_front(merged.freeze());
        true
    }

    /// Drain everything into a single contiguous buffer
    pub fn take_all(&mut self) -> Bytes {
        let mut all = BytesMut::with_capacity(self.queued);
        for chunk in self.chunks.drain(..) {
            all.extend_from_slice(&chunk);
        }
        self.queued = 0;
        self.update_pressure();
        all.freeze()
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total queued bytes
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// Check if the source of this queue may still be read
    pub fn accepts_more(&self) -> bool {
        !self.saturated
    }

    fn update_pressure(&mut self) {
        if self.queued >= self.high_water {
            self.saturated = true;
        } else if self.queued <= self.low_water {
            self.saturated = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = PacketQueue::new(1024, 256);
        for i in 0..10u8 {
            queue.push_back(Bytes::from(vec![i; 4]));
        }
        for i in 0..10u8 {
            assert_eq!(queue.pop_front().unwrap()[0], i);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_partial_write_requeue_keeps_order() {
        let mut queue = PacketQueue::new(1024, 256);
        queue.push_back(Bytes::from_static(b"first"));
        queue.push_back(Bytes::from_static(b"second"));

        // Simulate a write that only took 2 bytes of the head
        let head = queue.pop_front().unwrap();
        queue.push_front(head.slice(2..));
        queue.push_back(Bytes::from_static(b"third"));

        let drained: Vec<Bytes> = std::iter::from_fn(|| queue.pop_front()).collect();
        assert_eq!(drained, vec![
            Bytes::from_static(b"rst"),
            Bytes::from_static(b"second"),
            Bytes::from_static(b"third"),
        ]);
    }

    #[test]
    fn test_back_pressure_hysteresis() {
        let mut queue = PacketQueue::new(100, 40);
        assert!(queue.accepts_more());

        for _ in 0..10 {
            queue.push_back(Bytes::from(vec![0u8; 10]));
        }
        assert!(!queue.accepts_more());

        // Draining below high water is not enough
        for _ in 0..5 {
            queue.pop_front();
        }
        assert_eq!(queue.queued_bytes(), 50);
        assert!(!queue.accepts_more());

        queue.pop_front();
        assert_eq!(queue.queued_bytes(), 40);
        assert!(queue.accepts_more());
    }

    #[test]
    fn test_merge_front() {
        let mut queue = PacketQueue::new(1024, 256);
        assert!(!queue.merge_front());

        queue.push_back(Bytes::from_static(b"ab"));
        queue.push_back(Bytes::from_static(b"cd"));
        queue.push_back(Bytes::from_static(b"ef"));

        assert!(queue.merge_front());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().unwrap(), &Bytes::from_static(b"abcd"));
        assert_eq!(queue.queued_bytes(), 6);
    }

    #[test]
    fn test_empty_chunks_ignored() {
        let mut queue = PacketQueue::new(1024, 256);
        queue.push_back(Bytes::new());
        queue.push_front(Bytes::new());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_all() {
        let mut queue = PacketQueue::new(8, 2);
        queue.push_back(Bytes::from_static(b"1234"));
        queue.push_back(Bytes::from_static(b"5678"));
        assert!(!queue.accepts_more());

        assert_eq!(queue.take_all(), Bytes::from_static(b"12345678"));
        assert!(queue.is_empty());
        assert!(queue.accepts_more());
    }
}
