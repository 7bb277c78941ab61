//! The staged question-to-SQL pipeline.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{Pipeline, PipelineFailure, PipelineOptions, PipelineOutcome, DEFAULT_STAGE_TIMEOUT};
pub use state::{ComplexityLabel, PipelinePhase, PipelineState, Transition};
