//! A chain of parallel transformation stages.
//!
//! Each stage consumes the items produced by the stage before it, processes them on its
//! own pool of worker threads and hands the results to the next stage through an
//! unbounded [`HandoffQueue`]. Thread counts are set per stage, and every stage records
//! per-worker timings so the counts can be tuned from measurements.
//!
//! # Features
//!
//! - Blocking bulk hand-off between stages with a one-shot completion protocol
//! - Independent, per-stage worker pools
//! - Map, flat-map and sink stages with optional null preservation
//! - Fault and cancellation propagation down the chain through [`Completion`]s
//! - Per-thread and per-stage timing statistics linked along the chain
//!
//! # Example
//!
//! ```
//! use stage_chain::{begin_chain_with, StageOptions};
//!
//! let mut result = begin_chain_with(
//!     vec!["1", "2", "3"],
//!     |s: &str| Ok(s.parse::<i32>()?),
//!     StageOptions::threads(2),
//! )?
//! .then(|n: i32| Ok(n * 10))?
//! .end()?;
//!
//! result.sort_unstable();
//! assert_eq!(result, vec![10, 20, 30]);
//! # Ok::<(), stage_chain::PipelineError>(())
//! ```

pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod stage;
pub mod statistics;

// Re-exports for convenience
pub use completion::Completion;
pub use config::{default_thread_count, StageOptions, DEFAULT_BATCH_SIZE};
pub use engine::{chain_length, StageEngine, StageState};
pub use error::{BoxError, PipelineError, Result};
pub use pipeline::{begin_chain, begin_chain_many, begin_chain_sink, begin_chain_with, Chain, SinkChain};
pub use queue::HandoffQueue;
pub use source::{CountedSource, Input, IterSource, Source};
pub use stage::{
    adaptive_batch_size, Consume, ConsumingStage, FlatMap, FlatMapStage, Map, MapStage, Nullable,
    Produce, Sink, SinkStage,
};
pub use statistics::{CountSummary, DurationSummary, StageStatistics, Stopwatch, ThreadStatistics};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
