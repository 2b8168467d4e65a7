use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueState<T> {
    items: VecDeque<T>,
    completed: bool,
    disposed: bool,
}

/// An unbounded FIFO hand-off queue between stages.
///
/// Producers append whole batches with [`try_add`](Self::try_add), consumers remove
/// up to a requested number of items with [`try_take`](Self::try_take). Once
/// [`complete_adding`](Self::complete_adding) is called no more items are accepted and
/// takers drain whatever is left before being told the queue is finished.
pub struct HandoffQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
}

impl<T> HandoffQueue<T> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                completed: false,
                disposed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Create a queue holding `items` that is already marked complete
    pub fn completed_from(items: impl IntoIterator<Item = T>) -> Self {
        let queue = Self::new();
        {
            let mut state = queue.state.lock();
            state.items.extend(items);
            state.completed = true;
        }
        queue
    }

    /// Append every item in `items`.
    ///
    /// Returns false and adds nothing once adding has been completed.
    pub fn try_add(&self, items: impl IntoIterator<Item = T>) -> bool {
        let mut state = self.state.lock();
        if state.completed {
            return false;
        }
        let before = state.items.len();
        state.items.extend(items);
        let added = state.items.len() - before;
        drop(state);

        match added {
            0 => {}
            1 => {
                self.not_empty.notify_one();
            }
            _ => {
                self.not_empty.notify_all();
            }
        }
        true
    }

    /// Append a single item
    pub fn try_add_one(&self, item: T) -> bool {
        self.try_add(std::iter::once(item))
    }

    /// Remove up to `max_count` items, blocking while the queue is empty and open.
    ///
    /// Returns `None` when the queue is complete and empty. Never waits to fill the
    /// request once at least one item is available.
    pub fn try_take(&self, max_count: usize) -> Option<Vec<T>> {
        let max_count = max_count.max(1);
        let mut state = self.state.lock();
        while state.items.is_empty() {
            if state.completed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }

        let count = max_count.min(state.items.len());
        let taken: Vec<T> = state.items.drain(..count).collect();
        let more_left = !state.items.is_empty();
        drop(state);

        // Another taker may still be able to make progress
        if more_left {
            self.not_empty.notify_one();
        }
        Some(taken)
    }

    /// Mark the queue as complete and wake every blocked taker. Idempotent.
    pub fn complete_adding(&self) {
        let mut state = self.state.lock();
        if !state.completed {
            trace!("handoff queue completed with {} buffered items", state.items.len());
        }
        state.completed = true;
        drop(state);
        self.not_empty.notify_all();
    }

    /// Whether adding has been completed
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Current number of buffered items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if no items are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything currently buffered
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Release the buffered items and close the queue
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        trace!("disposing handoff queue ({} items dropped)", state.items.len());
        state.disposed = true;
        state.completed = true;
        state.items = VecDeque::new();
        drop(state);
        self.not_empty.notify_all();
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HandoffQueue")
            .field("len", &state.items.len())
            .field("completed", &state.completed)
            .field("disposed", &state.disposed)
            .finish()
    }
}
