use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by user supplied transforms
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for stage chain operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while building or running a chain of stages
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// A stage was configured with fewer than one worker thread
    #[error("Thread count must be at least 1, got {0}")]
    InvalidThreadCount(usize),

    /// A stage was configured with a batch size of zero
    #[error("Batch size must be at least 1, got {0}")]
    InvalidBatchSize(usize),

    /// The stage has already been started
    #[error("Stage '{0}' has already been started")]
    AlreadyStarted(String),

    /// A transform returned an error
    #[error("Transform failed in stage '{stage}': {source}")]
    Transform {
        stage: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A transform panicked
    #[error("Transform panicked in stage '{stage}': {message}")]
    Panicked { stage: String, message: String },

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread for stage '{stage}': {message}")]
    ThreadSpawn { stage: String, message: String },

    /// The chain was cancelled before it finished
    #[error("Stage chain was cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Wrap an error returned by a transform
    pub fn transform(stage: impl Into<String>, source: BoxError) -> Self {
        PipelineError::Transform {
            stage: stage.into(),
            source: Arc::from(source),
        }
    }

    /// Build an error from a caught panic payload
    pub fn panicked(stage: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        PipelineError::Panicked {
            stage: stage.into(),
            message,
        }
    }

    /// True when this is a cancellation rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// True for errors raised by user code while the chain was running
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            PipelineError::Transform { .. }
                | PipelineError::Panicked { .. }
                | PipelineError::ThreadSpawn { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_keeps_source() {
        let parse_err = "banana".parse::<i32>().unwrap_err();
        let err = PipelineError::transform("parse", Box::new(parse_err));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("invalid digit"));
        assert!(err.to_string().contains("'parse'"));
    }

    #[test]
    fn test_clone_shares_source() {
        let err = PipelineError::transform("s", "boom".into());
        let cloned = err.clone();
        match (&err, &cloned) {
            (
                PipelineError::Transform { source: a, .. },
                PipelineError::Transform { source: b, .. },
            ) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected transform errors"),
        }
    }

    #[test]
    fn test_panic_payloads() {
        let err = PipelineError::panicked("s", Box::new("static message"));
        assert!(err.to_string().contains("static message"));

        let err = PipelineError::panicked("s", Box::new(String::from("owned")));
        assert!(err.to_string().contains("owned"));

        let err = PipelineError::panicked("s", Box::new(42u32));
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_classification() {
        assert!(PipelineError::Cancelled.is_cancelled());
        assert!(!PipelineError::Cancelled.is_fault());
        assert!(PipelineError::transform("s", "x".into()).is_fault());
        assert!(!PipelineError::InvalidThreadCount(0).is_fault());
    }
}
