use crate::error::{PipelineError, Result};

/// Batch size used by a stage's workers when nothing else is configured
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// Number of worker threads a root stage gets when none is configured.
///
/// Half the logical CPUs on machines with more than two, otherwise one. Rarely the best
/// choice for any particular stage; use the stage statistics to tune it.
pub fn default_thread_count() -> usize {
    let cpus = num_cpus::get();
    if cpus > 2 {
        cpus / 2
    } else {
        1
    }
}

/// Per-stage configuration.
///
/// Unset values are inherited from the upstream stage, or take crate defaults for the
/// first stage of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOptions {
    pub threads: Option<usize>,
    pub batch_size: usize,
    pub preserve_nulls: Option<bool>,
    pub name: Option<String>,
}

impl StageOptions {
    pub fn new() -> Self {
        Self {
            threads: None,
            batch_size: DEFAULT_BATCH_SIZE,
            preserve_nulls: None,
            name: None,
        }
    }

    /// Options with only the thread count set
    pub fn threads(threads: usize) -> Self {
        Self::new().with_threads(threads)
    }

    /// Set the number of worker threads
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Set the largest batch a worker takes from its input at once
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Keep null results instead of dropping them
    pub fn with_preserve_nulls(mut self, preserve: bool) -> Self {
        self.preserve_nulls = Some(preserve);
        self
    }

    /// Name used for worker threads, logs, errors and statistics
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Resolve the thread count against an upstream stage's count
    pub(crate) fn resolve_threads(&self, upstream: Option<usize>) -> Result<usize> {
        let threads = self
            .threads
            .or(upstream)
            .unwrap_or_else(default_thread_count);
        if threads < 1 {
            return Err(PipelineError::InvalidThreadCount(threads));
        }
        Ok(threads)
    }

    pub(crate) fn validate_batch_size(&self) -> Result<usize> {
        if self.batch_size < 1 {
            return Err(PipelineError::InvalidBatchSize(self.batch_size));
        }
        Ok(self.batch_size)
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thread_count() {
        let threads = default_thread_count();
        assert!(threads >= 1);
        assert!(threads <= num_cpus::get().max(1));
    }

    #[test]
    fn test_thread_resolution() {
        let options = StageOptions::new();
        assert_eq!(options.resolve_threads(Some(3)).unwrap(), 3);
        assert_eq!(options.resolve_threads(None).unwrap(), default_thread_count());

        let options = StageOptions::new().with_threads(5);
        assert_eq!(options.resolve_threads(Some(3)).unwrap(), 5);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let result = StageOptions::threads(0).resolve_threads(Some(2));
        assert!(matches!(result, Err(PipelineError::InvalidThreadCount(0))));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let options = StageOptions::new().with_batch_size(0);
        assert!(matches!(
            options.validate_batch_size(),
            Err(PipelineError::InvalidBatchSize(0))
        ));
    }

    #[test]
    fn test_builder() {
        let options = StageOptions::new()
            .with_threads(2)
            .with_batch_size(16)
            .with_preserve_nulls(true)
            .with_name("parse");
        assert_eq!(options.threads, Some(2));
        assert_eq!(options.batch_size, 16);
        assert_eq!(options.preserve_nulls, Some(true));
        assert_eq!(options.name.as_deref(), Some("parse"));
    }
}
