// src/runtime/instruction_queue.rs
//! Bounded FIFO of pending instructions
//!
//! A fixed-capacity ring buffer: admission never blocks, an instruction that
//! does not fit is handed back to the caller and counted as dropped.
//! Dispatched entries leave the buffer, so memory stays bounded for
//! long-running pools.

use crossbeam::queue::ArrayQueue;

/// Bounded instruction queue
pub struct InstructionQueue<T> {
    queue: ArrayQueue<T>,
    accepted: u64,
    dropped: u64,
    dispatched: u64,
    drained: u64,
}

impl<T> InstructionQueue<T> {
    /// Create a queue holding at most `capacity` pending entries
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            accepted: 0,
            dropped: 0,
            dispatched: 0,
            drained: 0,
        }
    }

    /// Append an entry, handing it back when the queue is full
    pub fn push(&mut self, item: T) -> Result<(), T> {
        match self.queue.push(item) {
            Ok(()) => {
                self.accepted += 1;
                Ok(())
            }
            Err(item) => {
                self.dropped += 1;
                Err(item)
            }
        }
    }

    /// Take the oldest pending entry for dispatch
    pub fn pop(&mut self) -> Option<T> {
        let item = self.queue.pop()?;
        self.dispatched += 1;
        Some(item)
    }

    /// Discard every pending entry, returning how many were dropped
    pub fn drain_pending(&mut self) -> usize {
        let mut count = 0;
        while self.queue.pop().is_some() {
            count += 1;
        }
        self.drained += count as u64;
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            accepted: self.accepted,
            dropped: self.dropped,
            dispatched: self.dispatched,
            drained: self.drained,
            pending: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries admitted
    pub accepted: u64,

    /// Entries refused because the queue was full
    pub dropped: u64,

    /// Entries handed out for dispatch
    pub dispatched: u64,

    /// Entries discarded by a drain
    pub drained: u64,

    pub pending: usize,
    pub capacity: usize,
}
