pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod retrieval;
pub mod retry;
pub mod safety;
pub mod session;

pub use catalog::{CatalogSource, ForeignKey, PrimaryKey, SchemaCatalog, SchemaEntry, StaticCatalog};
pub use config::Settings;
pub use error::{Result, Text2SqlError};
pub use executor::{ExecutionError, ExecutionErrorKind, QueryExecutor, QueryResult};
pub use extract::{ExtractionError, OutputTag};
pub use llm::{GenerationClient, GenerationRequest, GenerationResult, LlmProvider};
pub use pipeline::{ComplexityLabel, Pipeline, PipelineFailure, PipelineOutcome, PipelinePhase, PipelineState};
pub use prompt::{PromptComposer, Stage, TemplateId};
pub use retrieval::{RetrievedSchema, SchemaRetriever};
pub use retry::RetryPolicy;
pub use safety::StatementPolicy;
pub use session::Session;
