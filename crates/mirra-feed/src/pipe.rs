//! Bounded hand-off between a stream-decoding producer and its consumer.
//!
//! Cooperative backpressure: `push` blocks once the buffer is full
//! (pausing the producer); the consumer signals `drain` after taking
//! items, which resumes the producer exactly once per pause. A repeated
//! drain while the producer is already running is a no-op, so a
//! double-resume can never happen.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard},
};

struct PipeState<T> {
    buf: VecDeque<T>,
    paused: bool,
    closed: bool,
}

pub struct ChangePipe<T> {
    state: Mutex<PipeState<T>>,
    space: Condvar,
    items: Condvar,
    capacity: usize,
}

impl<T> ChangePipe<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PipeState {
                buf: VecDeque::new(),
                paused: false,
                closed: false,
            }),
            space: Condvar::new(),
            items: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands one item to the consumer, blocking while the pipe is full.
    /// Returns `false` if the consumer closed the pipe.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        while state.buf.len() >= self.capacity && !state.closed {
            state.paused = true;
            state = self
                .space
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.closed {
            return false;
        }
        state.buf.push_back(item);
        self.items.notify_one();
        true
    }

    /// Takes the next item, blocking until one is available or the pipe
    /// is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        while state.buf.is_empty() && !state.closed {
            state = self
                .items
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.buf.pop_front()
    }

    /// Resumes a paused producer. At most one resume per pause; calling
    /// again while the producer is running does nothing.
    pub fn drain(&self) {
        let mut state = self.lock();
        if state.paused {
            state.paused = false;
            self.space.notify_one();
        }
    }

    /// Whether the producer is currently paused on a full buffer.
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Closes the pipe; blocked producers give up, consumers drain what
    /// remains.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.space.notify_all();
        self.items.notify_all();
    }
}
