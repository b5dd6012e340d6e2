use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

/// Outcome of [`Queue::pop_deadline`].
#[derive(Debug)]
pub enum Pop<T> {
    Popped(T),
    TimedOut,
    Disabled,
}

/// Failed [`Queue::try_push`], handing the element back.
#[derive(Debug)]
pub enum TryPush<T> {
    Full(T),
    Disabled(T),
}

#[derive(Debug, PartialEq)]
enum Gate {
    /// push and pop both work
    Open,
    /// no more producers: pop drains the backlog, push fails
    Draining,
    /// both directions fail immediately, backlog is unreachable
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    gate: Gate,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

/// Bounded FIFO linking two adjacent chain stages. Back-pressure is the
/// only flow control: `push` blocks on a full queue, `pop` on an empty one.
/// `disable` aborts both sides, `delayed_disable` lets the consumer drain
/// what the producer already delivered.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue needs capacity to move anything");
        Queue {
            inner: Arc::new(Inner {
                state: Mutex::new(State { items: VecDeque::with_capacity(capacity), gate: Gate::Open }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Block until there is room, then append. `false` once the queue was
    /// (delayed-)disabled; the element is dropped in that case.
    pub fn push(&self, item: T) -> bool {
        let mut st = self.inner.state.lock().unwrap();
        loop {
            match st.gate {
                Gate::Open => {}
                Gate::Draining | Gate::Closed => return false,
            }
            if st.items.len() < self.inner.capacity {
                st.items.push_back(item);
                self.inner.not_empty.notify_one();
                return true;
            }
            st = self.inner.not_full.wait(st).unwrap();
        }
    }

    /// Non-blocking push for callers that must not stall on a slow
    /// consumer (the multi-destination router treats a full lane as fatal
    /// rather than let one destination hold up the rest).
    pub fn try_push(&self, item: T) -> Result<(), TryPush<T>> {
        let mut st = self.inner.state.lock().unwrap();
        match st.gate {
            Gate::Open => {}
            Gate::Draining | Gate::Closed => return Err(TryPush::Disabled(item)),
        }
        if st.items.len() >= self.inner.capacity {
            return Err(TryPush::Full(item));
        }
        st.items.push_back(item);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Block until an element arrives. `None` when disabled, or when
    /// delayed-disabled and drained.
    pub fn pop(&self) -> Option<T> {
        let mut st = self.inner.state.lock().unwrap();
        loop {
            if st.gate == Gate::Closed {
                return None;
            }
            if let Some(item) = st.items.pop_front() {
                self.inner.not_full.notify_one();
                return Some(item);
            }
            if st.gate == Gate::Draining {
                return None;
            }
            st = self.inner.not_empty.wait(st).unwrap();
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`. The faker uses
    /// this to notice a silent upstream.
    pub fn pop_deadline(&self, timeout: Duration) -> Pop<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut st = self.inner.state.lock().unwrap();
        loop {
            if st.gate == Gate::Closed {
                return Pop::Disabled;
            }
            if let Some(item) = st.items.pop_front() {
                self.inner.not_full.notify_one();
                return Pop::Popped(item);
            }
            if st.gate == Gate::Draining {
                return Pop::Disabled;
            }
            let now = std::time::Instant::now();
            let Some(left) = deadline.checked_duration_since(now).filter(|d| !d.is_zero()) else {
                return Pop::TimedOut;
            };
            let (guard, res) = self.inner.not_empty.wait_timeout(st, left).unwrap();
            st = guard;
            if res.timed_out() && st.items.is_empty() {
                return Pop::TimedOut;
            }
        }
    }

    /// Hard stop: wakes every waiter, push and pop fail from here on and
    /// whatever is still queued is dropped.
    pub fn disable(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.gate = Gate::Closed;
        st.items.clear();
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
    }

    /// No more producers: pop keeps returning queued elements until the
    /// backlog is gone, push fails immediately.
    pub fn delayed_disable(&self) {
        let mut st = self.inner.state.lock().unwrap();
        if st.gate == Gate::Open {
            st.gate = Gate::Draining;
        }
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
    }

    /// Drop the backlog without changing the gate.
    pub fn clear(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.items.clear();
        self.inner.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
