//! Named FIFO queues connecting the pipeline stages.
//!
//! `push` never blocks and never rejects; each queue carries the maximum
//! length the governor trims it back to. Producers and consumers never trim.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Ordered, multi-producer multi-consumer byte queue.
#[derive(Debug)]
pub struct Queue {
    name: String,
    max_len: usize,
    items: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
}

impl Queue {
    pub fn new(name: impl Into<String>, max_len: usize) -> Self {
        Self {
            name: name.into(),
            max_len,
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length the governor trims this queue back to.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the tail and wake one waiting consumer.
    pub fn push(&self, item: Vec<u8>) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Pop the head, waiting up to `timeout` for one to arrive.
    ///
    /// `None` means the timeout elapsed with the queue empty; that is the idle
    /// case, not an error.
    pub fn blocking_pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        // past the end of the clock: wait for an item with no deadline
        let deadline = Instant::now().checked_add(timeout);
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            items = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.available
                        .wait_timeout(items, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .available
                    .wait(items)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop the oldest entries until at most `max_len` remain. Returns how many
    /// were removed. The surviving entries keep their order.
    pub fn trim_to(&self, max_len: usize) -> usize {
        let mut items = self.lock();
        let excess = items.len().saturating_sub(max_len);
        items.drain(..excess);
        excess
    }

    /// Trim to this queue's configured maximum.
    pub fn trim(&self) -> usize {
        self.trim_to(self.max_len)
    }
}

/// The three queues of the pipeline.
#[derive(Clone, Debug)]
pub struct Broker {
    pub frames: Arc<Queue>,
    pub faces: Arc<Queue>,
    pub recognition: Arc<Queue>,
}

/// Name and bound of one queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub max_len: usize,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, max_len: usize) -> Self {
        Self {
            name: name.into(),
            max_len,
        }
    }
}

impl Broker {
    pub fn new(frames: &QueueSpec, faces: &QueueSpec, recognition: &QueueSpec) -> Self {
        Self {
            frames: Arc::new(Queue::new(&frames.name, frames.max_len)),
            faces: Arc::new(Queue::new(&faces.name, faces.max_len)),
            recognition: Arc::new(Queue::new(&recognition.name, recognition.max_len)),
        }
    }

    pub fn queues(&self) -> [&Arc<Queue>; 3] {
        [&self.frames, &self.faces, &self.recognition]
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Queue>> {
        self.queues().into_iter().find(|q| q.name() == name)
    }
}
