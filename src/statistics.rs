//! Timing statistics for tuning per-stage thread counts.
//!
//! Every worker thread records a [`ThreadStatistics`] when it exits. Once a stage has
//! completed, those samples are rolled up into an immutable [`StageStatistics`], which also
//! holds the aggregate of the upstream stage so the statistics mirror the chain.

use std::fmt;
use std::time::{Duration, Instant};

/// Accumulating stopwatch that can be started and stopped repeatedly
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    elapsed: Duration,
    started_at: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_new() -> Self {
        let mut watch = Self::new();
        watch.start();
        watch
    }

    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(started_at) = self.started_at.take() {
            self.elapsed += started_at.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Total time accumulated, including the current run if the watch is running
    pub fn elapsed(&self) -> Duration {
        match self.started_at {
            Some(started_at) => self.elapsed + started_at.elapsed(),
            None => self.elapsed,
        }
    }
}

/// Timings recorded by a single worker thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStatistics {
    /// Number of items the worker transformed
    pub transform_count: u64,
    /// Lifetime of the worker
    pub time_total: Duration,
    /// Time spent blocked waiting for a batch of input
    pub time_buffer_wait: Duration,
    /// Time from worker start until its first item was handed to the transform
    pub time_to_first_transform: Duration,
    /// Time spent inside the transform
    pub time_transforming: Duration,
}

/// The live stopwatches a worker carries through its loop
#[derive(Debug)]
pub(crate) struct WorkerTimer {
    pub transform_count: u64,
    pub total: Stopwatch,
    pub buffer_wait: Stopwatch,
    pub to_first_transform: Stopwatch,
    pub transforming: Stopwatch,
}

impl WorkerTimer {
    pub fn start() -> Self {
        Self {
            transform_count: 0,
            total: Stopwatch::start_new(),
            buffer_wait: Stopwatch::new(),
            to_first_transform: Stopwatch::start_new(),
            transforming: Stopwatch::new(),
        }
    }

    pub fn finish(mut self) -> ThreadStatistics {
        self.total.stop();
        self.buffer_wait.stop();
        self.to_first_transform.stop();
        self.transforming.stop();
        ThreadStatistics {
            transform_count: self.transform_count,
            time_total: self.total.elapsed(),
            time_buffer_wait: self.buffer_wait.elapsed(),
            time_to_first_transform: self.to_first_transform.elapsed(),
            time_transforming: self.transforming.elapsed(),
        }
    }
}

/// Total/min/max/average of a count across a stage's workers
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CountSummary {
    pub total: u64,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
}

impl CountSummary {
    fn from_values(values: impl Iterator<Item = u64> + Clone) -> Self {
        let n = values.clone().count();
        if n == 0 {
            return Self::default();
        }
        let total: u64 = values.clone().sum();
        Self {
            total,
            min: values.clone().min().unwrap_or(0),
            max: values.max().unwrap_or(0),
            avg: total as f64 / n as f64,
        }
    }
}

/// Total/min/max/average of a duration across a stage's workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationSummary {
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

impl DurationSummary {
    fn from_values(values: impl Iterator<Item = Duration> + Clone) -> Self {
        let n = values.clone().count();
        if n == 0 {
            return Self::default();
        }
        let total: Duration = values.clone().sum();
        Self {
            total,
            min: values.clone().min().unwrap_or_default(),
            max: values.max().unwrap_or_default(),
            avg: average(total, n as u64),
        }
    }
}

fn average(total: Duration, n: u64) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((total.as_nanos() / u128::from(n)) as u64)
}

/// Aggregated, immutable statistics for one stage and, through `upstream`, the stages before it
#[derive(Debug, Clone)]
pub struct StageStatistics {
    pub name: String,
    /// Number of worker samples aggregated
    pub thread_count: usize,
    pub threads: Vec<ThreadStatistics>,
    pub transform_count: CountSummary,
    pub time_total: DurationSummary,
    pub time_buffer_wait: DurationSummary,
    pub time_to_first_transform: DurationSummary,
    pub time_transforming: DurationSummary,
    /// Average time a single transform took; zero when nothing was transformed
    pub individual_transform_time_avg: Duration,
    /// Average time workers spent waiting for input after the stage's first transform.
    /// A large value suggests the stage has more threads than it can keep busy.
    pub time_idle_after_first_transform_avg: Duration,
    pub upstream: Option<Box<StageStatistics>>,
}

impl StageStatistics {
    /// Aggregate the samples of one stage
    pub fn aggregate(
        name: impl Into<String>,
        threads: Vec<ThreadStatistics>,
        upstream: Option<StageStatistics>,
    ) -> Self {
        let transform_count = CountSummary::from_values(threads.iter().map(|t| t.transform_count));
        let time_total = DurationSummary::from_values(threads.iter().map(|t| t.time_total));
        let time_buffer_wait =
            DurationSummary::from_values(threads.iter().map(|t| t.time_buffer_wait));
        let time_to_first_transform =
            DurationSummary::from_values(threads.iter().map(|t| t.time_to_first_transform));
        let time_transforming =
            DurationSummary::from_values(threads.iter().map(|t| t.time_transforming));

        let individual_transform_time_avg =
            average(time_transforming.total, transform_count.total);

        let first_transform = time_to_first_transform.min;
        let idle_total: Duration = threads
            .iter()
            .map(|t| t.time_buffer_wait.saturating_sub(first_transform))
            .sum();
        let time_idle_after_first_transform_avg = average(idle_total, threads.len() as u64);

        Self {
            name: name.into(),
            thread_count: threads.len(),
            threads,
            transform_count,
            time_total,
            time_buffer_wait,
            time_to_first_transform,
            time_transforming,
            individual_transform_time_avg,
            time_idle_after_first_transform_avg,
            upstream: upstream.map(Box::new),
        }
    }

    /// Iterate this stage's statistics followed by every upstream stage's, terminal first
    pub fn chain(&self) -> impl Iterator<Item = &StageStatistics> {
        std::iter::successors(Some(self), |s| s.upstream.as_deref())
    }

    /// Format this stage's statistics as a single human-readable line
    pub fn format(&self) -> String {
        format!(
            "{}: threads: {}, transforms: {} (min {}, max {}, avg {:.1}), \
             total avg: {:?}, wait avg: {:?}, first transform avg: {:?}, \
             transforming avg: {:?}, per item: {:?}, idle after first: {:?}",
            self.name,
            self.thread_count,
            self.transform_count.total,
            self.transform_count.min,
            self.transform_count.max,
            self.transform_count.avg,
            self.time_total.avg,
            self.time_buffer_wait.avg,
            self.time_to_first_transform.avg,
            self.time_transforming.avg,
            self.individual_transform_time_avg,
            self.time_idle_after_first_transform_avg,
        )
    }
}

impl fmt::Display for StageStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stage Statistics Summary:")?;
        let stages: Vec<_> = self.chain().collect();
        for (i, stage) in stages.iter().rev().enumerate() {
            writeln!(f, "  Stage {}: {}", i, stage.format())?;
        }
        Ok(())
    }
}
