//! Queues shared between the posting threads, the sender thread and the
//! receiver.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::wire::MessageBuffer;

/// Whether a posted frame must wait in the acknowledgement queue until the
/// peer confirms having parsed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeedsAcknowledgement {
    Yes,
    No,
}

pub(crate) struct SendItem {
    pub buffer: MessageBuffer,
    pub needs_acknowledgement: NeedsAcknowledgement,
}

struct SendQueueInner {
    items: VecDeque<SendItem>,
    running: bool,
}

/// FIFO of pending outbound frames. Any thread pushes; only the sender
/// thread pops.
pub(crate) struct SendQueue {
    inner: Mutex<SendQueueInner>,
    available: Condvar,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SendQueueInner { items: VecDeque::new(), running: true }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, item: SendItem) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push_back(item);
        self.available.notify_one();
    }

    /// Blocks until an item is available or the queue is stopped. Returns
    /// `None` on stop, dropping whatever is still queued.
    pub fn pop_blocking(&self) -> Option<SendItem> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !inner.running {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        self.available.notify_one();
    }
}

/// FIFO of transferred frames awaiting a peer acknowledgement.
///
/// The sender appends before transmitting; the receiver pops when an
/// acknowledgement is parsed.
pub(crate) struct AcknowledgementWaitQueue {
    messages: Mutex<VecDeque<MessageBuffer>>,
}

impl AcknowledgementWaitQueue {
    pub fn new() -> Self {
        Self { messages: Mutex::new(VecDeque::new()) }
    }

    pub fn append(&self, buffer: MessageBuffer) {
        self.messages.lock().unwrap().push_back(buffer);
    }

    /// Rolls back the most recent append, used when the transfer it was
    /// covering failed.
    pub fn remove_last(&self) {
        self.messages.lock().unwrap().pop_back();
    }

    pub fn pop_acknowledged(&self, count: u32) {
        let mut messages = self.messages.lock().unwrap();
        for popped in 0..count {
            if messages.pop_front().is_none() {
                kvlog::warn!("Peer acknowledged more messages than are waiting", count, popped);
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}
