// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Lock-free queue carrying tagged sensor packets from the transport
//! notification thread to the service tick.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Bounded lock-free packet queue. The producer is a transport notification
/// thread, the consumer is the service tick; a full queue drops the oldest
/// unread packet so the producer never blocks or allocates.
///
/// The queue is gated: while the owning sensor slot is closed, pushes are
/// discarded. The queue itself persists across reconnects.
pub struct PacketQueue<T> {
    queue: ArrayQueue<T>,
    open: AtomicBool,
    dropped: AtomicUsize,
}

impl<T> PacketQueue<T> {
    pub fn new(capacity: usize) -> Self {
        PacketQueue {
            queue: ArrayQueue::new(capacity.max(1)),
            open: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Enqueue a packet. Returns false when the gate is closed or the packet
    /// displaced an unread one.
    pub fn push(&self, item: T) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }

        if self.queue.force_push(item).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        true
    }

    /// Dequeue the oldest packet, `None` when empty.
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Open or close the producer gate. Closing also drains anything still
    /// queued so a reconnected sensor starts from an empty queue.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
        if !open {
            while self.queue.pop().is_some() {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of packets lost to overwrites since the queue was created.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
