//! Lock-free multi-producer single-consumer handoff between writers and the
//! background flusher.
//!
//! Simplified Michael–Scott linked queue: producers atomically swap the tail
//! pointer and link the predecessor with a release store; the single
//! consumer owns the head pointer, advances it past the sentinel, and frees
//! dequeued nodes itself. With exactly one consumer there is no
//! use-after-free window, so no epoch or hazard-pointer machinery is needed.

use crate::types::Sample;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node {
    next: AtomicPtr<Node>,
    sample: Option<Sample>,
}

impl Node {
    fn sentinel() -> *mut Node {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            sample: None,
        }))
    }
}

/// MPSC FIFO of samples.
///
/// `push` may be called from any number of threads concurrently; `pop` must
/// only ever be called from one thread at a time (the flusher). Samples are
/// owned by the queue between push and pop.
pub struct IngestQueue {
    /// Consumer-owned; only touched by the single `pop` caller.
    head: UnsafeCell<*mut Node>,
    tail: AtomicPtr<Node>,
}

// The raw pointers are managed under the MPSC discipline documented above.
unsafe impl Send for IngestQueue {}
unsafe impl Sync for IngestQueue {}

impl IngestQueue {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        IngestQueue {
            head: UnsafeCell::new(sentinel),
            tail: AtomicPtr::new(sentinel),
        }
    }

    /// Enqueues one sample. Wait-free apart from the node allocation.
    pub fn push(&self, sample: Sample) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            sample: Some(sample),
        }));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // Link the predecessor. Between the swap and this store the node is
        // unreachable from head; the consumer simply sees an empty queue.
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Dequeues the oldest sample, or `None` if the queue is (transiently)
    /// empty.
    ///
    /// # Safety contract
    /// Must only be called from the single consumer thread. The engine
    /// upholds this by popping exclusively from the flusher.
    pub fn pop(&self) -> Option<Sample> {
        unsafe {
            let head = *self.head.get();
            let next = (*head).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            let sample = (*next).sample.take();
            *self.head.get() = next;
            drop(Box::from_raw(head));
            sample
        }
    }
}

impl Default for IngestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IngestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestQueue").finish_non_exhaustive()
    }
}

impl Drop for IngestQueue {
    fn drop(&mut self) {
        // Walk and free every remaining node, sentinel included.
        unsafe {
            let mut node = *self.head.get();
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}
