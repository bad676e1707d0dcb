use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::stateless::{StatelessContext, StatelessKind};

/// A queued stateless response, waiting for a worker to build and send it
#[derive(Clone, Debug)]
pub struct StatelessOperation {
    pub kind: StatelessKind,
    pub context: Arc<StatelessContext>,
}

/// Interface to one worker thread of the scheduler
///
/// The scheduler itself is an external collaborator; the binding only needs
/// the overload signal and a queue to park stateless work on.
#[derive(Debug)]
pub struct Worker {
    overloaded: AtomicBool,
    stateless_queue: Mutex<VecDeque<StatelessOperation>>,
}

impl Worker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            overloaded: AtomicBool::new(false),
            stateless_queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }

    pub fn set_overloaded(&self, overloaded: bool) {
        self.overloaded.store(overloaded, Ordering::Relaxed);
    }

    pub(crate) fn queue_stateless(&self, operation: StatelessOperation) {
        self.stateless_queue.lock().unwrap().push_back(operation);
    }

    /// Pop the next stateless operation for processing
    pub fn next_stateless(&self) -> Option<StatelessOperation> {
        self.stateless_queue.lock().unwrap().pop_front()
    }

    pub fn stateless_queue_len(&self) -> usize {
        self.stateless_queue.lock().unwrap().len()
    }
}

/// Round-robin handle over the scheduler's workers
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "a worker pool needs at least one worker");
        Self {
            workers: (0..count).map(|_| Worker::new()).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> Arc<Worker> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[i].clone()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }
}
