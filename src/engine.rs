//! The stage engine: worker pools, upstream chaining and completion.
//!
//! Every stage owns a [`StageCore`] with its thread count, its (optional) upstream stage
//! and the shared flags its workers coordinate through. [`execute`] starts the upstream
//! chain, spawns the workers and returns a [`Completion`] that the last worker to exit
//! resolves, after folding in the upstream stage's outcome.

use crate::completion::{self, Completion, CompletionSource};
use crate::error::{PipelineError, Result};
use crate::statistics::StageStatistics;
use log::{debug, warn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Lifecycle of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    NotStarted,
    Running,
    /// Finished successfully, faulted or cancelled; the completion carries which
    Completed,
}

/// A link in a chain of stages, independent of the item types flowing through it
pub trait StageEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Number of worker threads this stage runs
    fn thread_count(&self) -> usize;

    fn state(&self) -> StageState;

    /// Whether null results are forwarded rather than dropped
    fn preserve_nulls(&self) -> bool;

    fn set_preserve_nulls(&self, preserve: bool);

    /// The stage whose output this stage consumes
    fn upstream(&self) -> Option<&Arc<dyn StageEngine>>;

    /// Start the upstream chain and then this stage's workers.
    ///
    /// May be called once per stage; a second call fails with
    /// [`PipelineError::AlreadyStarted`].
    fn execute(self: Arc<Self>) -> Result<Completion<()>>;

    /// Ask this stage and everything upstream of it to stop at the next batch boundary
    fn cancel(&self);

    /// Number of worker errors that lost the race to become the stage's error
    fn suppressed_errors(&self) -> usize;

    /// Aggregated statistics for this stage and its upstream stages, once completed
    fn statistics(&self) -> Option<StageStatistics>;

    /// Release this stage's queues and, through the upstream stage, the rest of the chain
    fn dispose(&self);
}

/// Number of stages in the chain ending at `stage`
pub fn chain_length(stage: &dyn StageEngine) -> usize {
    std::iter::successors(Some(stage), |s| s.upstream().map(|u| u.as_ref())).count()
}

/// State shared by every stage regardless of what it consumes or produces
pub(crate) struct StageCore {
    name: String,
    thread_count: usize,
    upstream: Option<Arc<dyn StageEngine>>,
    state: Mutex<StageState>,
    completed_threads: AtomicUsize,
    has_error: AtomicBool,
    cancelled: AtomicBool,
    first_error: Mutex<Option<PipelineError>>,
    suppressed_errors: AtomicUsize,
    disposed: AtomicBool,
}

impl StageCore {
    pub fn new(
        name: String,
        thread_count: usize,
        upstream: Option<Arc<dyn StageEngine>>,
    ) -> Result<Self> {
        if thread_count < 1 {
            return Err(PipelineError::InvalidThreadCount(thread_count));
        }
        Ok(Self {
            name,
            thread_count,
            upstream,
            state: Mutex::new(StageState::NotStarted),
            completed_threads: AtomicUsize::new(0),
            has_error: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
            suppressed_errors: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn upstream(&self) -> Option<&Arc<dyn StageEngine>> {
        self.upstream.as_ref()
    }

    pub fn state(&self) -> StageState {
        *self.state.lock()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == StageState::Completed
    }

    /// Workers check this between batches and stop pulling work once it is set
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    pub fn raise_error_flag(&self) {
        self.has_error.store(true, Ordering::Release);
    }

    /// Record a worker error. The first one becomes the stage's error, later ones are logged.
    ///
    /// The first error also cancels the upstream chain, whose output nobody will read.
    pub fn record_error(&self, error: PipelineError) {
        self.raise_error_flag();
        {
            let mut first = self.first_error.lock();
            if first.is_some() {
                self.suppressed_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "stage '{}' raised an additional error after the first: {}",
                    self.name, error
                );
                return;
            }
            debug!("stage '{}' faulted: {}", self.name, error);
            *first = Some(error);
        }
        if let Some(upstream) = &self.upstream {
            upstream.cancel();
        }
    }

    pub fn suppressed_errors(&self) -> usize {
        self.suppressed_errors.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!("cancelling stage '{}'", self.name);
        }
        self.raise_error_flag();
        if let Some(upstream) = &self.upstream {
            upstream.cancel();
        }
    }

    /// Returns false if the stage had already been disposed
    pub fn begin_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Dispose the upstream stage; returns whether there was one
    pub fn dispose_upstream(&self) -> bool {
        match &self.upstream {
            Some(upstream) => {
                upstream.dispose();
                true
            }
            None => false,
        }
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != StageState::NotStarted {
            return Err(PipelineError::AlreadyStarted(self.name.clone()));
        }
        *state = StageState::Running;
        Ok(())
    }

    /// Count a finished worker; true only for the last one
    fn finish_worker(&self) -> bool {
        self.completed_threads.fetch_add(1, Ordering::AcqRel) + 1 == self.thread_count
    }

    fn outcome(&self, upstream: Option<Result<()>>) -> Result<()> {
        if let Some(error) = self.first_error.lock().clone() {
            return Err(error);
        }
        if let Some(Err(error)) = upstream {
            return Err(error);
        }
        if self.cancelled.load(Ordering::Acquire) {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    fn mark_completed(&self) {
        *self.state.lock() = StageState::Completed;
    }
}

/// The per-stage behaviour the engine drives
pub(crate) trait StageWorker: Send + Sync + 'static {
    fn core(&self) -> &StageCore;

    /// The worker loop, run on every worker thread until the input is exhausted or the
    /// stage's error flag is raised
    fn process(&self) -> Result<()>;

    /// Runs once, on the last worker to exit
    fn process_complete(&self) {}
}

/// Shared by the workers of one run of a stage
struct RunState {
    completion: Mutex<Option<CompletionSource<()>>>,
    upstream: Mutex<Option<Completion<()>>>,
}

/// Start `stage`: its upstream chain first, then `thread_count` workers
pub(crate) fn execute<W: StageWorker>(stage: Arc<W>) -> Result<Completion<()>> {
    let core = stage.core();
    core.begin()?;

    let upstream = match core.upstream() {
        Some(upstream) => match Arc::clone(upstream).execute() {
            Ok(completion) => Some(completion),
            Err(error) => {
                core.mark_completed();
                return Err(error);
            }
        },
        None => None,
    };

    let (source, completion) = completion::pair();
    let run = Arc::new(RunState {
        completion: Mutex::new(Some(source)),
        upstream: Mutex::new(upstream),
    });

    let threads = core.thread_count();
    debug!("starting stage '{}' with {} threads", core.name(), threads);

    for index in 0..threads {
        let worker = Arc::clone(&stage);
        let worker_run = Arc::clone(&run);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", core.name(), index))
            .spawn(move || worker_main(worker.as_ref(), &worker_run));

        if let Err(error) = spawned {
            core.record_error(PipelineError::ThreadSpawn {
                stage: core.name().to_string(),
                message: error.to_string(),
            });
            // Account for every worker that will never run so the rendezvous still happens
            for _ in index..threads {
                worker_exit(stage.as_ref(), &run);
            }
            break;
        }
    }

    Ok(completion)
}

fn worker_main<W: StageWorker>(stage: &W, run: &RunState) {
    let core = stage.core();
    match panic::catch_unwind(AssertUnwindSafe(|| stage.process())) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => core.record_error(error),
        Err(payload) => core.record_error(PipelineError::panicked(core.name(), payload)),
    }
    worker_exit(stage, run);
}

fn worker_exit<W: StageWorker>(stage: &W, run: &RunState) {
    let core = stage.core();
    if !core.finish_worker() {
        return;
    }

    stage.process_complete();

    // The upstream has normally finished already; waiting collects its outcome
    let upstream = run.upstream.lock().take().map(Completion::wait);
    let outcome = core.outcome(upstream);
    core.mark_completed();

    match &outcome {
        Ok(()) => debug!("stage '{}' completed", core.name()),
        Err(error) => debug!("stage '{}' completed with error: {}", core.name(), error),
    }

    let source = run.completion.lock().take();
    if let Some(source) = source {
        source.resolve(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingWorker {
        core: StageCore,
        runs: AtomicU64,
        completes: AtomicU64,
        fail: bool,
    }

    impl CountingWorker {
        fn new(threads: usize, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                core: StageCore::new("counting".into(), threads, None).unwrap(),
                runs: AtomicU64::new(0),
                completes: AtomicU64::new(0),
                fail,
            })
        }
    }

    impl StageWorker for CountingWorker {
        fn core(&self) -> &StageCore {
            &self.core
        }

        fn process(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::transform("counting", "boom".into()));
            }
            Ok(())
        }

        fn process_complete(&self) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_every_worker_runs_and_completion_runs_once() {
        let worker = CountingWorker::new(6, false);
        let completion = execute(Arc::clone(&worker)).unwrap();
        completion.wait().unwrap();

        assert_eq!(worker.runs.load(Ordering::SeqCst), 6);
        assert_eq!(worker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(worker.core.state(), StageState::Completed);
    }

    #[test]
    fn test_second_start_fails() {
        let worker = CountingWorker::new(1, false);
        let completion = execute(Arc::clone(&worker)).unwrap();
        assert!(matches!(
            execute(Arc::clone(&worker)),
            Err(PipelineError::AlreadyStarted(_))
        ));
        completion.wait().unwrap();
    }

    #[test]
    fn test_first_error_wins_others_counted() {
        let worker = CountingWorker::new(4, true);
        let error = execute(Arc::clone(&worker)).unwrap().wait().unwrap_err();
        assert!(matches!(error, PipelineError::Transform { .. }));
        assert_eq!(worker.core.suppressed_errors(), 3);
        assert_eq!(worker.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            StageCore::new("s".into(), 0, None),
            Err(PipelineError::InvalidThreadCount(0))
        ));
    }

    #[test]
    fn test_cancel_before_start() {
        let worker = CountingWorker::new(2, false);
        worker.core.cancel();
        assert!(worker.core.has_error());
        let error = execute(worker).unwrap().wait().unwrap_err();
        assert!(error.is_cancelled());
    }
}
