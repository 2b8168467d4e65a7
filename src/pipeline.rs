//! Fluent construction of stage chains and helpers to run them to completion.

use crate::completion::Completion;
use crate::config::StageOptions;
use crate::engine::StageEngine;
use crate::error::{BoxError, Result};
use crate::queue::HandoffQueue;
use crate::source::Input;
use crate::stage::{FlatMapStage, MapStage, Nullable, SinkStage};
use crate::statistics::StageStatistics;
use std::sync::Arc;

type StatisticsCallback = Box<dyn FnOnce(&StageStatistics) + Send + 'static>;

/// Disposes the chain when it goes out of scope, whichever way the scope is left
struct DisposeGuard(Arc<dyn StageEngine>);

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

/// Start a chain with a one-to-one transform over `input`
pub fn begin_chain<In, Out, F>(input: impl Into<Input<In>>, transform: F) -> Result<Chain<Out>>
where
    In: Send + 'static,
    Out: Nullable + Send + 'static,
    F: Fn(In) -> std::result::Result<Out, BoxError> + Send + Sync + 'static,
{
    begin_chain_with(input, transform, StageOptions::new())
}

/// Start a chain with a one-to-one transform and explicit stage options
pub fn begin_chain_with<In, Out, F>(
    input: impl Into<Input<In>>,
    transform: F,
    options: impl Into<StageOptions>,
) -> Result<Chain<Out>>
where
    In: Send + 'static,
    Out: Nullable + Send + 'static,
    F: Fn(In) -> std::result::Result<Out, BoxError> + Send + Sync + 'static,
{
    let stage = MapStage::new(input, transform, &options.into())?;
    let output = Arc::clone(stage.output());
    Ok(Chain { stage, output })
}

/// Start a chain with a one-to-many transform over `input`
pub fn begin_chain_many<In, Out, I, F>(
    input: impl Into<Input<In>>,
    transform: F,
    options: impl Into<StageOptions>,
) -> Result<Chain<Out>>
where
    In: Send + 'static,
    Out: Nullable + Send + 'static,
    I: IntoIterator<Item = Out>,
    F: Fn(In) -> std::result::Result<I, BoxError> + Send + Sync + 'static,
{
    let stage = FlatMapStage::new(input, transform, &options.into())?;
    let output = Arc::clone(stage.output());
    Ok(Chain { stage, output })
}

/// A chain consisting of a single side-effecting stage
pub fn begin_chain_sink<In, F>(
    input: impl Into<Input<In>>,
    transform: F,
    options: impl Into<StageOptions>,
) -> Result<SinkChain>
where
    In: Send + 'static,
    F: Fn(In) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    let stage = SinkStage::new(input, transform, &options.into())?;
    Ok(SinkChain { stage })
}

/// A chain of stages whose last stage produces `Out`.
///
/// Nothing runs until one of the `end` methods (or [`Chain::execute`]) is called.
pub struct Chain<Out> {
    stage: Arc<dyn StageEngine>,
    output: Arc<HandoffQueue<Out>>,
}

impl<Out: Send + 'static> Chain<Out> {
    /// Append a one-to-one stage using the previous stage's thread count.
    ///
    /// `Next` must implement [`Nullable`]. Std types and tuples up to twelve elements
    /// already do; a type of your own needs an empty `impl Nullable for MyType {}`.
    /// `None` results are dropped unless the stage preserves nulls.
    pub fn then<Next, F>(self, transform: F) -> Result<Chain<Next>>
    where
        Next: Nullable + Send + 'static,
        F: Fn(Out) -> std::result::Result<Next, BoxError> + Send + Sync + 'static,
    {
        self.then_with(transform, StageOptions::new())
    }

    /// Append a one-to-one stage with explicit options
    pub fn then_with<Next, F>(
        self,
        transform: F,
        options: impl Into<StageOptions>,
    ) -> Result<Chain<Next>>
    where
        Next: Nullable + Send + 'static,
        F: Fn(Out) -> std::result::Result<Next, BoxError> + Send + Sync + 'static,
    {
        let stage = MapStage::from_input(
            Input::from(self.output),
            Some(self.stage),
            transform,
            &options.into(),
        )?;
        let output = Arc::clone(stage.output());
        Ok(Chain { stage, output })
    }

    /// Append a one-to-many stage using the previous stage's thread count
    pub fn then_many<Next, I, F>(self, transform: F) -> Result<Chain<Next>>
    where
        Next: Nullable + Send + 'static,
        I: IntoIterator<Item = Next>,
        F: Fn(Out) -> std::result::Result<I, BoxError> + Send + Sync + 'static,
    {
        self.then_many_with(transform, StageOptions::new())
    }

    /// Append a one-to-many stage with explicit options
    pub fn then_many_with<Next, I, F>(
        self,
        transform: F,
        options: impl Into<StageOptions>,
    ) -> Result<Chain<Next>>
    where
        Next: Nullable + Send + 'static,
        I: IntoIterator<Item = Next>,
        F: Fn(Out) -> std::result::Result<I, BoxError> + Send + Sync + 'static,
    {
        let stage = FlatMapStage::from_input(
            Input::from(self.output),
            Some(self.stage),
            transform,
            &options.into(),
        )?;
        let output = Arc::clone(stage.output());
        Ok(Chain { stage, output })
    }

    /// Finish the chain with a side-effecting stage
    pub fn then_sink<F>(self, transform: F) -> Result<SinkChain>
    where
        F: Fn(Out) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.then_sink_with(transform, StageOptions::new())
    }

    /// Finish the chain with a side-effecting stage and explicit options
    pub fn then_sink_with<F>(self, transform: F, options: impl Into<StageOptions>) -> Result<SinkChain>
    where
        F: Fn(Out) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let stage = SinkStage::from_input(
            Input::from(self.output),
            Some(self.stage),
            transform,
            &options.into(),
        )?;
        Ok(SinkChain { stage })
    }

    /// Override null preservation for the last stage (later stages inherit it)
    pub fn preserve_nulls(self, preserve: bool) -> Self {
        self.stage.set_preserve_nulls(preserve);
        self
    }

    /// The last stage of the chain
    pub fn stage(&self) -> &Arc<dyn StageEngine> {
        &self.stage
    }

    /// The queue the last stage publishes to
    pub fn output(&self) -> &Arc<HandoffQueue<Out>> {
        &self.output
    }

    /// Start every stage without waiting. The caller is responsible for disposal.
    pub fn execute(&self) -> Result<Completion<()>> {
        Arc::clone(&self.stage).execute()
    }

    /// Run the chain to completion and collect the output
    pub fn end(self) -> Result<Vec<Out>> {
        self.finish(None)
    }

    /// Run the chain to completion, report statistics, and collect the output
    pub fn end_with_statistics<F>(self, callback: F) -> Result<Vec<Out>>
    where
        F: FnOnce(&StageStatistics) + Send + 'static,
    {
        self.finish(Some(Box::new(callback)))
    }

    /// Start the chain and return a completion that yields the output.
    ///
    /// Errors starting the chain are returned here, after disposing it.
    pub fn end_async(self) -> Result<Completion<Vec<Out>>> {
        self.finish_async(None)
    }

    /// Like [`end_async`](Self::end_async), reporting statistics on success
    pub fn end_async_with_statistics<F>(self, callback: F) -> Result<Completion<Vec<Out>>>
    where
        F: FnOnce(&StageStatistics) + Send + 'static,
    {
        self.finish_async(Some(Box::new(callback)))
    }

    fn finish(self, callback: Option<StatisticsCallback>) -> Result<Vec<Out>> {
        let _guard = DisposeGuard(Arc::clone(&self.stage));
        Arc::clone(&self.stage).execute()?.wait()?;
        report_statistics(self.stage.as_ref(), callback);
        Ok(self.output.drain())
    }

    fn finish_async(self, callback: Option<StatisticsCallback>) -> Result<Completion<Vec<Out>>> {
        let guard = DisposeGuard(Arc::clone(&self.stage));
        let completion = Arc::clone(&self.stage).execute()?;
        let Chain { stage, output } = self;
        Ok(completion.map(move |result| {
            let _guard = guard;
            result?;
            report_statistics(stage.as_ref(), callback);
            Ok(output.drain())
        }))
    }
}

/// A chain ending in a side-effecting stage
pub struct SinkChain {
    stage: Arc<dyn StageEngine>,
}

impl SinkChain {
    pub fn stage(&self) -> &Arc<dyn StageEngine> {
        &self.stage
    }

    /// Start every stage without waiting. The caller is responsible for disposal.
    pub fn execute(&self) -> Result<Completion<()>> {
        Arc::clone(&self.stage).execute()
    }

    /// Run the chain to completion
    pub fn end(self) -> Result<()> {
        self.finish(None)
    }

    /// Run the chain to completion and report statistics
    pub fn end_with_statistics<F>(self, callback: F) -> Result<()>
    where
        F: FnOnce(&StageStatistics) + Send + 'static,
    {
        self.finish(Some(Box::new(callback)))
    }

    /// Start the chain and return a completion for it
    pub fn end_async(self) -> Result<Completion<()>> {
        self.finish_async(None)
    }

    /// Like [`end_async`](Self::end_async), reporting statistics on success
    pub fn end_async_with_statistics<F>(self, callback: F) -> Result<Completion<()>>
    where
        F: FnOnce(&StageStatistics) + Send + 'static,
    {
        self.finish_async(Some(Box::new(callback)))
    }

    fn finish(self, callback: Option<StatisticsCallback>) -> Result<()> {
        let _guard = DisposeGuard(Arc::clone(&self.stage));
        Arc::clone(&self.stage).execute()?.wait()?;
        report_statistics(self.stage.as_ref(), callback);
        Ok(())
    }

    fn finish_async(self, callback: Option<StatisticsCallback>) -> Result<Completion<()>> {
        let guard = DisposeGuard(Arc::clone(&self.stage));
        let completion = Arc::clone(&self.stage).execute()?;
        let stage = self.stage;
        Ok(completion.map(move |result| {
            let _guard = guard;
            result?;
            report_statistics(stage.as_ref(), callback);
            Ok(())
        }))
    }
}

fn report_statistics(stage: &dyn StageEngine, callback: Option<StatisticsCallback>) {
    if let Some(callback) = callback {
        if let Some(statistics) = stage.statistics() {
            callback(&statistics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::StageState;

    #[test]
    fn test_begin_and_end() {
        let mut result = begin_chain(vec![1, 2, 3], |n: i32| Ok(n * 2))
            .unwrap()
            .end()
            .unwrap();
        result.sort_unstable();
        assert_eq!(result, vec![2, 4, 6]);
    }

    #[test]
    fn test_then_inherits_thread_count() {
        let chain = begin_chain_with(vec![1], |n: i32| Ok(n), StageOptions::threads(3))
            .unwrap()
            .then(|n: i32| Ok(n.to_string()))
            .unwrap();
        assert_eq!(chain.stage().thread_count(), 3);
        assert_eq!(chain.end().unwrap(), vec!["1".to_string()]);
    }

    #[test]
    fn test_zero_threads_is_synchronous_error() {
        let result = begin_chain_with(vec![1], |n: i32| Ok(n), StageOptions::threads(0));
        assert!(matches!(result, Err(PipelineError::InvalidThreadCount(0))));

        let chain = begin_chain(vec![1], |n: i32| Ok(n)).unwrap();
        let result = chain.then_with(|n: i32| Ok(n), StageOptions::threads(0));
        assert!(matches!(result, Err(PipelineError::InvalidThreadCount(0))));
    }

    #[test]
    fn test_end_disposes_chain() {
        let chain = begin_chain(vec![1, 2], |n: i32| Ok(n)).unwrap();
        let stage = Arc::clone(chain.stage());
        let output = Arc::clone(chain.output());
        chain.end().unwrap();
        assert_eq!(stage.state(), StageState::Completed);
        assert!(output.is_disposed());
    }

    #[test]
    fn test_start_failure_disposes_and_returns_error() {
        let chain = begin_chain(vec![1], |n: i32| Ok(n)).unwrap();
        let output = Arc::clone(chain.output());
        chain.execute().unwrap().wait().unwrap();

        // Already started: the error comes back immediately and the chain is released
        let result = chain.end_async();
        assert!(matches!(result, Err(PipelineError::AlreadyStarted(_))));
        assert!(output.is_disposed());
    }

    #[test]
    fn test_preserve_nulls_flows_downstream() {
        let result = begin_chain(vec![1, 2], |n: i32| Ok(if n == 1 { None } else { Some(n) }))
            .unwrap()
            .preserve_nulls(true)
            .then(|n: Option<i32>| Ok(n))
            .unwrap()
            .end()
            .unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.contains(&None));
    }

    #[test]
    fn test_sink_chain_statistics() {
        let (tx, rx) = std::sync::mpsc::channel();
        begin_chain_sink(vec![1, 2, 3], |_: i32| Ok(()), StageOptions::threads(2))
            .unwrap()
            .end_with_statistics(move |stats| {
                tx.send(stats.transform_count.total).unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv().unwrap(), 3);
    }
}
