use crate::completion::Completion;
use crate::config::StageOptions;
use crate::engine::{self, chain_length, StageCore, StageEngine, StageState, StageWorker};
use crate::error::{BoxError, PipelineError, Result};
use crate::queue::HandoffQueue;
use crate::source::Input;
use crate::statistics::{StageStatistics, ThreadStatistics, WorkerTimer};
use crossbeam::queue::SegQueue;
use log::{debug, trace};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Values that may represent "no result".
///
/// Map and flat-map stages drop null results unless the stage preserves nulls. Only
/// `Option` has a null value; every other implementation keeps the default. A type of
/// your own opts in with an empty impl:
///
/// ```
/// struct Record {
///     id: u64,
/// }
///
/// impl stage_chain::Nullable for Record {}
/// ```
pub trait Nullable {
    fn is_null(&self) -> bool {
        false
    }
}

impl<T> Nullable for Option<T> {
    fn is_null(&self) -> bool {
        self.is_none()
    }
}

macro_rules! never_null {
    ($($t:ty),* $(,)?) => {
        $(impl Nullable for $t {})*
    };
}

never_null!(
    (), bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
    String, &'static str,
);

impl<T> Nullable for Vec<T> {}
impl<T> Nullable for VecDeque<T> {}
impl<T, const N: usize> Nullable for [T; N] {}
impl<T: ?Sized> Nullable for Box<T> {}
impl<T: ?Sized> Nullable for Arc<T> {}
impl<T: ?Sized> Nullable for std::rc::Rc<T> {}
impl<T: ?Sized + ToOwned> Nullable for Cow<'static, T> {}
impl<K, V, S> Nullable for HashMap<K, V, S> {}
impl<T, S> Nullable for HashSet<T, S> {}
impl<K, V> Nullable for BTreeMap<K, V> {}
impl<T> Nullable for BTreeSet<T> {}
impl<T, E> Nullable for std::result::Result<T, E> {}

macro_rules! never_null_tuple {
    ($(($($name:ident),+)),* $(,)?) => {
        $(impl<$($name),+> Nullable for ($($name,)+) {})*
    };
}

never_null_tuple!(
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
    (A, B, C, D, E),
    (A, B, C, D, E, F),
    (A, B, C, D, E, F, G),
    (A, B, C, D, E, F, G, H),
    (A, B, C, D, E, F, G, H, I),
    (A, B, C, D, E, F, G, H, I, J),
    (A, B, C, D, E, F, G, H, I, J, K),
    (A, B, C, D, E, F, G, H, I, J, K, L),
);

/// The per-item strategy a consuming stage runs for each input item
pub trait Consume<In>: Send + Sync + 'static {
    /// Process one item
    fn consume(&self, item: In, preserve_nulls: bool) -> std::result::Result<(), BoxError>;

    /// Runs once, on the last worker of the stage to finish
    fn complete(&self) {}

    /// Release anything the strategy owns
    fn dispose(&self) {}
}

/// A strategy that publishes results to an output queue
pub trait Produce {
    type Output;

    fn output(&self) -> &Arc<HandoffQueue<Self::Output>>;
}

const OUTPUT_CLOSED: &str = "output queue closed before the stage finished";

type MapFn<In, Out> = Box<dyn Fn(In) -> std::result::Result<Out, BoxError> + Send + Sync>;
type FlatMapFn<In, Out> = Box<dyn Fn(In) -> std::result::Result<Vec<Out>, BoxError> + Send + Sync>;
type SinkFn<In> = Box<dyn Fn(In) -> std::result::Result<(), BoxError> + Send + Sync>;

/// One result per input item
pub struct Map<In, Out> {
    transform: MapFn<In, Out>,
    output: Arc<HandoffQueue<Out>>,
}

impl<In, Out> Consume<In> for Map<In, Out>
where
    In: 'static,
    Out: Nullable + Send + 'static,
{
    fn consume(&self, item: In, preserve_nulls: bool) -> std::result::Result<(), BoxError> {
        let result = (self.transform)(item)?;
        if (preserve_nulls || !result.is_null()) && !self.output.try_add_one(result) {
            return Err(OUTPUT_CLOSED.into());
        }
        Ok(())
    }

    fn complete(&self) {
        self.output.complete_adding();
    }

    fn dispose(&self) {
        self.output.dispose();
    }
}

impl<In, Out> Produce for Map<In, Out> {
    type Output = Out;

    fn output(&self) -> &Arc<HandoffQueue<Out>> {
        &self.output
    }
}

/// Zero or more results per input item
pub struct FlatMap<In, Out> {
    transform: FlatMapFn<In, Out>,
    output: Arc<HandoffQueue<Out>>,
}

impl<In, Out> Consume<In> for FlatMap<In, Out>
where
    In: 'static,
    Out: Nullable + Send + 'static,
{
    fn consume(&self, item: In, preserve_nulls: bool) -> std::result::Result<(), BoxError> {
        let mut results = (self.transform)(item)?;
        if !preserve_nulls {
            results.retain(|r| !r.is_null());
        }
        if !results.is_empty() && !self.output.try_add(results) {
            return Err(OUTPUT_CLOSED.into());
        }
        Ok(())
    }

    fn complete(&self) {
        self.output.complete_adding();
    }

    fn dispose(&self) {
        self.output.dispose();
    }
}

impl<In, Out> Produce for FlatMap<In, Out> {
    type Output = Out;

    fn output(&self) -> &Arc<HandoffQueue<Out>> {
        &self.output
    }
}

/// Side effects only; nothing is produced
pub struct Sink<In> {
    transform: SinkFn<In>,
}

impl<In: 'static> Consume<In> for Sink<In> {
    fn consume(&self, item: In, _preserve_nulls: bool) -> std::result::Result<(), BoxError> {
        (self.transform)(item)
    }
}

/// A stage that runs a one-to-one transform
pub type MapStage<In, Out> = ConsumingStage<In, Map<In, Out>>;

/// A stage that runs a one-to-many transform
pub type FlatMapStage<In, Out> = ConsumingStage<In, FlatMap<In, Out>>;

/// A terminal stage that runs a side-effecting transform
pub type SinkStage<In> = ConsumingStage<In, Sink<In>>;

/// Pick how many items a worker takes from its input at once.
///
/// Sources that can't report a count are read one item at a time. When fewer items are
/// buffered than would fill every worker's batch, the batch shrinks so that the remaining
/// items are spread across workers instead of landing on the first few.
pub fn adaptive_batch_size(batch_size: usize, threads: usize, count: Option<usize>) -> usize {
    match count {
        None => 1,
        Some(count) if batch_size > 1 && count < batch_size * threads => {
            (count / threads.max(1)).max(1)
        }
        Some(_) => batch_size,
    }
}

/// A stage whose workers pull batches from an input and hand each item to a [`Consume`]
/// strategy, recording per-worker timings as they go
pub struct ConsumingStage<In, P> {
    core: StageCore,
    input: Input<In>,
    processor: P,
    batch_size: usize,
    preserve_nulls: AtomicBool,
    thread_statistics: SegQueue<ThreadStatistics>,
    statistics: Mutex<Option<StageStatistics>>,
}

impl<In, P> ConsumingStage<In, P>
where
    In: Send + 'static,
    P: Consume<In>,
{
    /// Build a stage from its parts.
    ///
    /// Thread count and null preservation not set in `options` are inherited from
    /// `upstream`. Fails if the resolved thread count or the batch size is zero.
    pub fn from_parts(
        input: Input<In>,
        processor: P,
        upstream: Option<Arc<dyn StageEngine>>,
        options: &StageOptions,
    ) -> Result<Arc<Self>> {
        let threads = options.resolve_threads(upstream.as_ref().map(|u| u.thread_count()))?;
        let batch_size = options.validate_batch_size()?;
        let preserve_nulls = options
            .preserve_nulls
            .or_else(|| upstream.as_ref().map(|u| u.preserve_nulls()))
            .unwrap_or(false);
        let name = match &options.name {
            Some(name) => name.clone(),
            None => format!(
                "stage-{}",
                upstream.as_ref().map_or(0, |u| chain_length(u.as_ref()))
            ),
        };

        Ok(Arc::new(Self {
            core: StageCore::new(name, threads, upstream)?,
            input,
            processor,
            batch_size,
            preserve_nulls: AtomicBool::new(preserve_nulls),
            thread_statistics: SegQueue::new(),
            statistics: Mutex::new(None),
        }))
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn take_batch(&self) -> Option<Vec<In>> {
        let size = adaptive_batch_size(self.batch_size, self.core.thread_count(), self.input.count());
        self.input.try_take(size)
    }

    fn consume_one(&self, item: In) -> Result<()> {
        let preserve_nulls = self.preserve_nulls();
        match panic::catch_unwind(AssertUnwindSafe(|| {
            self.processor.consume(item, preserve_nulls)
        })) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(PipelineError::transform(self.core.name(), error)),
            Err(payload) => Err(PipelineError::panicked(self.core.name(), payload)),
        }
    }

    fn drain_input(&self, timer: &mut WorkerTimer) -> Result<()> {
        timer.buffer_wait.start();
        while !self.core.has_error() {
            let Some(batch) = self.take_batch() else {
                break;
            };
            timer.buffer_wait.stop();

            for item in batch {
                timer.transform_count += 1;
                timer.to_first_transform.stop();

                timer.transforming.start();
                let result = self.consume_one(item);
                timer.transforming.stop();
                result?;
            }

            timer.buffer_wait.start();
        }
        Ok(())
    }
}

impl<In, P> ConsumingStage<In, P>
where
    In: Send + 'static,
    P: Consume<In> + Produce,
{
    /// The queue this stage publishes its results to
    pub fn output(&self) -> &Arc<HandoffQueue<P::Output>> {
        self.processor.output()
    }
}

impl<In, Out> ConsumingStage<In, Map<In, Out>>
where
    In: Send + 'static,
    Out: Nullable + Send + 'static,
{
    /// A one-to-one stage reading `input`
    pub fn new<F>(input: impl Into<Input<In>>, transform: F, options: &StageOptions) -> Result<Arc<Self>>
    where
        F: Fn(In) -> std::result::Result<Out, BoxError> + Send + Sync + 'static,
    {
        Self::from_input(input.into(), None, transform, options)
    }

    /// A one-to-one stage reading `input`, which is produced by `upstream`
    pub fn from_input<F>(
        input: Input<In>,
        upstream: Option<Arc<dyn StageEngine>>,
        transform: F,
        options: &StageOptions,
    ) -> Result<Arc<Self>>
    where
        F: Fn(In) -> std::result::Result<Out, BoxError> + Send + Sync + 'static,
    {
        let processor = Map {
            transform: Box::new(transform),
            output: Arc::new(HandoffQueue::new()),
        };
        Self::from_parts(input, processor, upstream, options)
    }
}

impl<In, Out> ConsumingStage<In, FlatMap<In, Out>>
where
    In: Send + 'static,
    Out: Nullable + Send + 'static,
{
    /// A one-to-many stage reading `input`
    pub fn new<F, I>(input: impl Into<Input<In>>, transform: F, options: &StageOptions) -> Result<Arc<Self>>
    where
        F: Fn(In) -> std::result::Result<I, BoxError> + Send + Sync + 'static,
        I: IntoIterator<Item = Out>,
    {
        Self::from_input(input.into(), None, transform, options)
    }

    /// A one-to-many stage reading `input`, which is produced by `upstream`
    pub fn from_input<F, I>(
        input: Input<In>,
        upstream: Option<Arc<dyn StageEngine>>,
        transform: F,
        options: &StageOptions,
    ) -> Result<Arc<Self>>
    where
        F: Fn(In) -> std::result::Result<I, BoxError> + Send + Sync + 'static,
        I: IntoIterator<Item = Out>,
    {
        let processor = FlatMap {
            transform: Box::new(move |item: In| {
                transform(item).map(|it| it.into_iter().collect::<Vec<Out>>())
            }),
            output: Arc::new(HandoffQueue::new()),
        };
        Self::from_parts(input, processor, upstream, options)
    }
}

impl<In> ConsumingStage<In, Sink<In>>
where
    In: Send + 'static,
{
    /// A side-effecting stage reading `input`
    pub fn new<F>(input: impl Into<Input<In>>, transform: F, options: &StageOptions) -> Result<Arc<Self>>
    where
        F: Fn(In) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::from_input(input.into(), None, transform, options)
    }

    /// A side-effecting stage reading `input`, which is produced by `upstream`
    pub fn from_input<F>(
        input: Input<In>,
        upstream: Option<Arc<dyn StageEngine>>,
        transform: F,
        options: &StageOptions,
    ) -> Result<Arc<Self>>
    where
        F: Fn(In) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let processor = Sink {
            transform: Box::new(transform),
        };
        Self::from_parts(input, processor, upstream, options)
    }
}

impl<In, P> StageWorker for ConsumingStage<In, P>
where
    In: Send + 'static,
    P: Consume<In>,
{
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn process(&self) -> Result<()> {
        let mut timer = WorkerTimer::start();
        let result = self.drain_input(&mut timer);
        if result.is_err() {
            // Let the other workers know
            self.core.raise_error_flag();
        }

        let statistics = timer.finish();
        debug!(
            "worker of stage '{}' exiting after {} items",
            self.core.name(),
            statistics.transform_count
        );
        self.thread_statistics.push(statistics);
        result
    }

    fn process_complete(&self) {
        self.processor.complete();
    }
}

impl<In, P> StageEngine for ConsumingStage<In, P>
where
    In: Send + 'static,
    P: Consume<In>,
{
    fn name(&self) -> &str {
        self.core.name()
    }

    fn thread_count(&self) -> usize {
        self.core.thread_count()
    }

    fn state(&self) -> StageState {
        self.core.state()
    }

    fn preserve_nulls(&self) -> bool {
        self.preserve_nulls.load(Ordering::Relaxed)
    }

    fn set_preserve_nulls(&self, preserve: bool) {
        self.preserve_nulls.store(preserve, Ordering::Relaxed);
    }

    fn upstream(&self) -> Option<&Arc<dyn StageEngine>> {
        self.core.upstream()
    }

    fn execute(self: Arc<Self>) -> Result<Completion<()>> {
        debug!(
            "stage '{}' batch size {} ({} input)",
            self.core.name(),
            self.batch_size,
            if self.input.is_counted() { "counted" } else { "uncounted" }
        );
        engine::execute(self)
    }

    fn cancel(&self) {
        self.core.cancel();
    }

    fn suppressed_errors(&self) -> usize {
        self.core.suppressed_errors()
    }

    fn statistics(&self) -> Option<StageStatistics> {
        if !self.core.is_completed() {
            return None;
        }
        let mut cached = self.statistics.lock();
        if cached.is_none() {
            let mut threads = Vec::with_capacity(self.core.thread_count());
            while let Some(sample) = self.thread_statistics.pop() {
                threads.push(sample);
            }
            let upstream = self.core.upstream().and_then(|u| u.statistics());
            *cached = Some(StageStatistics::aggregate(self.core.name(), threads, upstream));
        }
        cached.clone()
    }

    fn dispose(&self) {
        if !self.core.begin_dispose() {
            return;
        }
        trace!("disposing stage '{}'", self.core.name());
        // The root stage owns the chain's input; other stages read a queue
        // their upstream stage owns
        if !self.core.dispose_upstream() {
            self.input.dispose();
        }
        self.processor.dispose();
    }
}

impl<In, P> Drop for ConsumingStage<In, P> {
    fn drop(&mut self) {
        if !self.core.begin_dispose() {
            return;
        }
        if !self.core.dispose_upstream() {
            self.input.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use std::sync::atomic::AtomicUsize;

    fn parse(s: String) -> std::result::Result<i32, BoxError> {
        Ok(s.parse::<i32>()?)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    struct TrackedSource {
        inner: HandoffQueue<u32>,
        disposed: Arc<AtomicUsize>,
    }

    impl Source<u32> for TrackedSource {
        fn try_take(&self, max_count: usize) -> Option<Vec<u32>> {
            self.inner.try_take(max_count)
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_adaptive_batch_size() {
        assert_eq!(adaptive_batch_size(4, 2, None), 1);
        assert_eq!(adaptive_batch_size(4, 2, Some(100)), 4);
        assert_eq!(adaptive_batch_size(4, 2, Some(8)), 4);
        assert_eq!(adaptive_batch_size(4, 2, Some(6)), 3);
        assert_eq!(adaptive_batch_size(4, 3, Some(2)), 1);
        assert_eq!(adaptive_batch_size(4, 3, Some(0)), 1);
        assert_eq!(adaptive_batch_size(1, 3, Some(0)), 1);
    }

    #[test]
    fn test_map_stage() {
        let stage = MapStage::new(
            strings(&["1", "2", "3", "4", "5"]),
            |s: String| parse(s).map(|n| n * 10),
            &StageOptions::new().with_threads(3),
        )
        .unwrap();

        Arc::clone(&stage).execute().unwrap().wait().unwrap();
        let mut results = stage.output().drain();
        results.sort_unstable();
        assert_eq!(results, vec![10, 20, 30, 40, 50]);
        assert!(stage.output().is_completed());
        assert_eq!(stage.state(), StageState::Completed);
    }

    #[test]
    fn test_map_stage_drops_nulls() {
        let stage = MapStage::new(
            vec![1, 2, 3, 4],
            |n: i32| Ok(if n % 2 == 0 { Some(n) } else { None }),
            &StageOptions::threads(1),
        )
        .unwrap();
        Arc::clone(&stage).execute().unwrap().wait().unwrap();
        assert_eq!(stage.output().drain(), vec![Some(2), Some(4)]);
    }

    #[test]
    fn test_wide_tuples_are_never_null() {
        assert!(!(1, 2, 3, 4, 5).is_null());
        assert!(!("a", 'b', 3u8, 4i64, 5.0f32, 6usize, (), false).is_null());
        assert!(!HashMap::<u8, u8>::new().is_null());
        assert!(Option::<(u8, u8, u8, u8)>::None.is_null());

        let stage = MapStage::new(
            vec![1, 2],
            |n: i32| Ok((n, n + 1, n + 2, n + 3, n + 4)),
            &StageOptions::threads(1),
        )
        .unwrap();
        Arc::clone(&stage).execute().unwrap().wait().unwrap();
        assert_eq!(stage.output().len(), 2);
    }

    #[test]
    fn test_map_stage_preserves_nulls() {
        let stage = MapStage::new(
            vec![1, 2],
            |n: i32| Ok(if n % 2 == 0 { Some(n) } else { None }),
            &StageOptions::threads(1).with_preserve_nulls(true),
        )
        .unwrap();
        Arc::clone(&stage).execute().unwrap().wait().unwrap();
        assert_eq!(stage.output().drain(), vec![None, Some(2)]);
    }

    #[test]
    fn test_flat_map_stage_filters_nulls() {
        let stage = FlatMapStage::new(
            vec![3],
            |n: i32| Ok(vec![Some(n), None, Some(n * 2)]),
            &StageOptions::threads(1),
        )
        .unwrap();
        Arc::clone(&stage).execute().unwrap().wait().unwrap();
        assert_eq!(stage.output().drain(), vec![Some(3), Some(6)]);
    }

    #[test]
    fn test_sink_stage() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let stage = SinkStage::new(
            Input::lazy(0..100),
            move |n: usize| {
                counter.fetch_add(n, Ordering::SeqCst);
                Ok(())
            },
            &StageOptions::threads(4),
        )
        .unwrap();
        Arc::clone(&stage).execute().unwrap().wait().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), (0..100).sum::<usize>());
    }

    #[test]
    fn test_transform_error_faults_stage() {
        let stage = MapStage::new(
            strings(&["1", "banana", "3"]),
            parse,
            &StageOptions::threads(1),
        )
        .unwrap();
        let error = Arc::clone(&stage).execute().unwrap().wait().unwrap_err();
        assert!(matches!(error, PipelineError::Transform { ref stage, .. } if stage == "stage-0"));
        // Output is still completed so downstream stages can finish
        assert!(stage.output().is_completed());
    }

    #[test]
    fn test_closed_output_faults_stage() {
        let stage = MapStage::new(vec![1, 2, 3], |n: i32| Ok(n), &StageOptions::threads(1)).unwrap();
        stage.output().complete_adding();

        let error = Arc::clone(&stage).execute().unwrap().wait().unwrap_err();
        assert!(error.is_fault());
        assert!(error.to_string().contains("output queue closed"));

        let stage = FlatMapStage::new(vec![1], |n: i32| Ok(vec![n, n]), &StageOptions::threads(1))
            .unwrap();
        stage.output().dispose();
        let error = Arc::clone(&stage).execute().unwrap().wait().unwrap_err();
        assert!(matches!(error, PipelineError::Transform { .. }));
    }

    #[test]
    fn test_panic_faults_stage() {
        let stage = SinkStage::new(
            vec![1, 2, 3],
            |n: i32| {
                if n == 2 {
                    panic!("two is not allowed");
                }
                Ok(())
            },
            &StageOptions::threads(1),
        )
        .unwrap();
        let error = Arc::clone(&stage).execute().unwrap().wait().unwrap_err();
        assert!(matches!(error, PipelineError::Panicked { ref message, .. } if message.contains("two")));
    }

    #[test]
    fn test_chained_stage_inherits_settings() {
        let root = MapStage::new(
            vec![1, 2, 3],
            |n: i32| Ok(n),
            &StageOptions::threads(3).with_preserve_nulls(true),
        )
        .unwrap();
        let upstream: Arc<dyn StageEngine> = root.clone();
        let next = MapStage::from_input(
            Input::from(Arc::clone(root.output())),
            Some(upstream),
            |n: i32| Ok(n + 1),
            &StageOptions::new(),
        )
        .unwrap();

        assert_eq!(next.thread_count(), 3);
        assert!(next.preserve_nulls());
        assert_eq!(next.name(), "stage-1");

        Arc::clone(&next).execute().unwrap().wait().unwrap();
        let mut results = next.output().drain();
        results.sort_unstable();
        assert_eq!(results, vec![2, 3, 4]);
        assert_eq!(root.state(), StageState::Completed);
    }

    #[test]
    fn test_statistics_after_completion() {
        let stage = MapStage::new(vec![1u32; 20], |n: u32| Ok(n), &StageOptions::threads(2)).unwrap();
        assert!(stage.statistics().is_none());
        Arc::clone(&stage).execute().unwrap().wait().unwrap();

        let stats = stage.statistics().expect("completed");
        assert_eq!(stats.thread_count, 2);
        assert_eq!(stats.transform_count.total, 20);
        assert!(stats.upstream.is_none());
        // Cached snapshot is stable
        assert_eq!(stage.statistics().unwrap().transform_count.total, 20);
    }

    #[test]
    fn test_root_dispose_releases_source() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(TrackedSource {
            inner: HandoffQueue::completed_from(vec![1, 2]),
            disposed: Arc::clone(&disposed),
        });
        let stage = MapStage::new(Input::<u32>::uncounted(source), |n: u32| Ok(n), &StageOptions::threads(1))
            .unwrap();
        stage.dispose();
        stage.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(stage.output().is_disposed());
    }
}
