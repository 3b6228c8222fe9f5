// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The bounded queue between the receiver and worker threads.

use slog::warn;
use slog::Logger;
use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// A bounded, blocking FIFO.
///
/// Producers never block: an item pushed onto a full queue is dropped.
/// Consumers block in [`MessageQueue::pop`] until an item arrives or the
/// queue is stopped.
#[derive(Debug)]
pub struct MessageQueue<T> {
    log: Logger,
    capacity: usize,
    inner: Mutex<Inner<T>>,
    cvar: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new(log: Logger, capacity: usize) -> Self {
        Self {
            log,
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an item onto the back of the queue.
    ///
    /// Return false if the item was dropped, because the queue is full or
    /// stopped.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.stopped {
            return false;
        }
        if inner.items.len() >= self.capacity {
            drop(inner);
            warn!(
                self.log,
                "queue full, dropping message";
                "capacity" => self.capacity,
            );
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.cvar.notify_one();
        true
    }

    /// Pop the item at the front of the queue, waiting for one if needed.
    ///
    /// Return `None` once the queue has been stopped.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if inner.stopped {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            inner = self
                .cvar
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop the queue, waking all consumers and discarding queued items.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        inner.items.clear();
        drop(inner);
        self.cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::MessageQueue;
    use crate::test_utils::test_logger;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(test_logger(), 4);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_drops_newest_when_full() {
        let queue = MessageQueue::new(test_logger(), 2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(MessageQueue::new(test_logger(), 2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(queue.push(7));
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn test_stop_wakes_consumer() {
        let queue: Arc<MessageQueue<u8>> = Arc::new(MessageQueue::new(test_logger(), 2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert_eq!(consumer.join().unwrap(), None);
        assert!(queue.is_stopped());
        assert!(!queue.push(1));
    }
}
