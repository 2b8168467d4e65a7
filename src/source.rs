use crate::queue::HandoffQueue;
use parking_lot::Mutex;
use std::sync::Arc;

/// Something a stage can pull batches of input from
pub trait Source<T>: Send + Sync {
    /// Remove up to `max_count` items, blocking if the source needs to wait for them.
    /// Returns `None` once the source is exhausted.
    fn try_take(&self, max_count: usize) -> Option<Vec<T>>;

    /// Release whatever the source holds
    fn dispose(&self) {}
}

/// A source that can also report how many items are currently buffered
pub trait CountedSource<T>: Source<T> {
    fn count(&self) -> usize;
}

impl<T: Send> Source<T> for HandoffQueue<T> {
    fn try_take(&self, max_count: usize) -> Option<Vec<T>> {
        HandoffQueue::try_take(self, max_count)
    }

    fn dispose(&self) {
        HandoffQueue::dispose(self)
    }
}

impl<T: Send> CountedSource<T> for HandoffQueue<T> {
    fn count(&self) -> usize {
        self.len()
    }
}

/// Lazily pulls items from an iterator, one lock acquisition per batch
pub struct IterSource<I> {
    iter: Mutex<Option<I>>,
}

impl<I: Iterator> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: Mutex::new(Some(iter.into_iter())),
        }
    }
}

impl<I> Source<I::Item> for IterSource<I>
where
    I: Iterator + Send,
{
    fn try_take(&self, max_count: usize) -> Option<Vec<I::Item>> {
        let mut guard = self.iter.lock();
        let iter = guard.as_mut()?;
        let batch: Vec<_> = iter.by_ref().take(max_count.max(1)).collect();
        if batch.is_empty() {
            // Fuse so a finished iterator is never polled again
            *guard = None;
            return None;
        }
        Some(batch)
    }

    fn dispose(&self) {
        self.iter.lock().take();
    }
}

/// The input of a stage.
///
/// Whether the input can report a count is decided once, when the input is built,
/// and enables adaptive batch sizing in the consuming stage.
pub enum Input<T> {
    Counted(Arc<dyn CountedSource<T>>),
    Uncounted(Arc<dyn Source<T>>),
}

impl<T: Send + 'static> Input<T> {
    /// Wrap a source that reports its count
    pub fn counted(source: Arc<dyn CountedSource<T>>) -> Self {
        Input::Counted(source)
    }

    /// Wrap a source that cannot report a count
    pub fn uncounted(source: Arc<dyn Source<T>>) -> Self {
        Input::Uncounted(source)
    }

    /// Pull lazily from an iterator (infinite iterators are fine)
    pub fn lazy<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Input::Uncounted(Arc::new(IterSource::new(iter)))
    }
}

impl<T> Input<T> {
    pub(crate) fn try_take(&self, max_count: usize) -> Option<Vec<T>> {
        match self {
            Input::Counted(source) => source.try_take(max_count),
            Input::Uncounted(source) => source.try_take(max_count),
        }
    }

    /// Buffered item count, if the source can report one
    pub fn count(&self) -> Option<usize> {
        match self {
            Input::Counted(source) => Some(source.count()),
            Input::Uncounted(_) => None,
        }
    }

    pub fn is_counted(&self) -> bool {
        matches!(self, Input::Counted(_))
    }

    pub(crate) fn dispose(&self) {
        match self {
            Input::Counted(source) => source.dispose(),
            Input::Uncounted(source) => source.dispose(),
        }
    }
}

impl<T: Send + 'static> From<Vec<T>> for Input<T> {
    fn from(items: Vec<T>) -> Self {
        Input::Counted(Arc::new(HandoffQueue::completed_from(items)))
    }
}

impl<T: Send + 'static> From<Arc<HandoffQueue<T>>> for Input<T> {
    fn from(queue: Arc<HandoffQueue<T>>) -> Self {
        Input::Counted(queue)
    }
}
