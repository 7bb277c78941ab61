//! Pipeline Orchestrator
//!
//! Drives one question through the stages:
//!
//! ```text
//! START -> LINKED -> CLASSIFIED -> GENERATED -> EXECUTED -> DONE
//!                                      |
//!                                      +-> CORRECTING -> EXECUTED -> DONE
//!                                                     \-> FAILED
//! ```
//!
//! Each stage runs under the stage timeout and its results are committed to
//! [`PipelineState`] only once it has finished. Generated SQL gets one review
//! call before its first execution (see [`PipelineOptions::review_sql`]), and
//! a failed execution gets exactly one correction attempt. Engine timeouts
//! are execution errors like any other and go to correction too.

use crate::catalog::SchemaCatalog;
use crate::error::{Result, Text2SqlError};
use crate::executor::{ExecutionError, QueryExecutor, QueryResult};
use crate::extract::{parse_sub_questions, ExtractionError, Extractor, OutputTag};
use crate::llm::{DecodingParams, GenerationClient, GenerationRequest, GenerationResult};
use crate::pipeline::state::{ComplexityLabel, PipelineState, Transition};
use crate::prompt::{render, Bindings, PromptComposer, Stage, TemplateId};
use crate::retrieval::{RetrievedSchema, SchemaRetriever, SemanticIndex};
use crate::safety::StatementPolicy;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub stage_timeout: Duration,
    pub decoding: DecodingParams,
    /// Ask the model to check generated SQL against the schema before it
    /// runs. Costs one extra call per question.
    pub review_sql: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            decoding: DecodingParams::default(),
            review_sql: true,
        }
    }
}

const REVIEW_NOTE: &str = "none reported; the query has not run yet";

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: Uuid,
    pub state: PipelineState,
    pub result: QueryResult,
    /// Whether the returned result came from the corrected query
    pub corrected: bool,
    pub transitions: Vec<Transition>,
}

impl PipelineOutcome {
    pub fn sql(&self) -> &str {
        self.state.sql().unwrap_or_default()
    }
}

#[derive(Error, Debug)]
#[error("run {run_id} failed during {stage}: {error}")]
pub struct PipelineFailure {
    pub run_id: Uuid,
    pub stage: Stage,
    pub state: PipelineState,
    #[source]
    pub error: Text2SqlError,
}

impl PipelineFailure {
    /// Refusal text when the request was rejected as unsafe.
    pub fn refusal(&self) -> Option<&str> {
        match &self.error {
            Text2SqlError::UnsafeStatementRejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// The last SQL that was generated, if any.
    pub fn last_sql(&self) -> Option<&str> {
        match &self.error {
            Text2SqlError::UnrecoverableQuery { last_sql, .. } => Some(last_sql),
            _ => self.state.sql(),
        }
    }

    /// The latest engine error of the run. When the correction call itself
    /// failed this is the error of the first execution.
    pub fn execution_error(&self) -> Option<&ExecutionError> {
        match &self.error {
            Text2SqlError::UnrecoverableQuery { error, .. } => Some(error),
            _ => self.state.execution_error(),
        }
    }
}

struct StageError {
    stage: Stage,
    error: Text2SqlError,
}

type StageResult<T> = std::result::Result<T, StageError>;

trait AtStage<T> {
    fn at(self, stage: Stage) -> StageResult<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> StageResult<T> {
        self.map_err(|error| StageError { stage, error })
    }
}

pub struct Pipeline {
    catalog: Arc<SchemaCatalog>,
    index: Option<Arc<dyn SemanticIndex>>,
    retriever: SchemaRetriever,
    composer: Arc<PromptComposer>,
    client: GenerationClient,
    executor: Arc<dyn QueryExecutor>,
    policy: StatementPolicy,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(catalog: Arc<SchemaCatalog>, client: GenerationClient, executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            catalog,
            index: None,
            retriever: SchemaRetriever::default(),
            composer: Arc::new(PromptComposer::default()),
            client,
            executor,
            policy: StatementPolicy::default(),
            options: PipelineOptions::default(),
        }
    }

    pub fn with_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_retriever(mut self, retriever: SchemaRetriever) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_composer(mut self, composer: Arc<PromptComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_policy(mut self, policy: StatementPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(&self, question: &str) -> std::result::Result<PipelineOutcome, PipelineFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", %run_id);
        let mut state = PipelineState::new(question, self.executor.dialect());

        let outcome = self.drive(&mut state).instrument(span).await;
        match outcome {
            Ok((result, corrected)) => {
                info!("Run {} done: {} rows (corrected: {})", run_id, result.row_count, corrected);
                Ok(PipelineOutcome {
                    run_id,
                    transitions: state.transitions().to_vec(),
                    state,
                    result,
                    corrected,
                })
            }
            Err(StageError { stage, error }) => {
                warn!("Run {} failed during {}: {}", run_id, stage, error);
                state.mark_failed();
                Err(PipelineFailure {
                    run_id,
                    stage,
                    state,
                    error,
                })
            }
        }
    }

    async fn drive(&self, state: &mut PipelineState) -> StageResult<(QueryResult, bool)> {
        let question = state.question.clone();
        self.policy.check_question(&question).at(Stage::Safety)?;

        // START -> LINKED
        let (retrieved, links) = self.timed(Stage::SchemaLinking, self.link_schema(&question)).await?;
        state.record_links(retrieved, links).at(Stage::SchemaLinking)?;
        info!("LINKED: {}", state.schema_links().unwrap_or_default());

        // LINKED -> CLASSIFIED
        let (label, sub_questions) = self
            .timed(Stage::Classification, self.classify(&question, state))
            .await?;
        state
            .record_classification(label, sub_questions)
            .at(Stage::Classification)?;
        info!("CLASSIFIED: {} ({} sub-questions)", label, state.sub_questions().len());

        // CLASSIFIED -> GENERATED
        let sql = self.timed(Stage::Generation, self.generate_sql(&question, state)).await?;
        state.record_sql(sql).at(Stage::Generation)?;
        info!("GENERATED: {}", state.sql().unwrap_or_default());

        if self.options.review_sql {
            let draft = state.sql().unwrap_or_default().to_string();
            let reviewed = self.timed(Stage::Review, self.review(&question, state, &draft)).await?;
            if reviewed != draft {
                info!("REVIEWED: {}", reviewed);
            }
            state.revise_sql(reviewed).at(Stage::Review)?;
        }

        // GENERATED -> EXECUTED | CORRECTING
        let first_sql = state.sql().unwrap_or_default().to_string();
        let first_error = match self.timed(Stage::Execution, self.execute(&first_sql)).await? {
            Ok(result) => {
                state.mark_done().at(Stage::Execution)?;
                return Ok((result, false));
            }
            Err(e) => e,
        };
        warn!("Execution failed ({}), correcting once", first_error);
        state.mark_correcting(first_error.clone()).at(Stage::Execution)?;

        // CORRECTING -> EXECUTED | FAILED
        let corrected_sql = self
            .timed(Stage::Correction, self.correct(&question, state, &first_sql, &first_error))
            .await
            .map_err(|e| {
                warn!("Correction produced no query; first execution error was: {}", first_error);
                e
            })?;
        state.record_sql(corrected_sql.clone()).at(Stage::Correction)?;
        info!("CORRECTED: {}", corrected_sql);

        match self.timed(Stage::Correction, self.execute(&corrected_sql)).await? {
            Ok(result) => {
                state.mark_done().at(Stage::Correction)?;
                Ok((result, true))
            }
            Err(error) => Err(StageError {
                stage: Stage::Correction,
                error: Text2SqlError::UnrecoverableQuery {
                    last_sql: corrected_sql,
                    error,
                },
            }),
        }
    }

    async fn timed<T>(&self, stage: Stage, work: impl Future<Output = Result<T>>) -> StageResult<T> {
        match tokio::time::timeout(self.options.stage_timeout, work).await {
            Ok(result) => result.at(stage),
            Err(_) => Err(StageError {
                stage,
                error: Text2SqlError::Timeout(self.options.stage_timeout.as_millis() as u64),
            }),
        }
    }

    /// Render the stage's template and seed, then call the model.
    async fn call(&self, id: TemplateId, bindings: &Bindings) -> Result<GenerationResult> {
        let descriptor = id.descriptor();
        let prompt = self.composer.compose(id, bindings)?;
        let seed = descriptor.seed.map(|seed| render(seed, bindings)).transpose()?;
        let request = GenerationRequest::new(prompt, self.options.decoding.clone())
            .with_stop_sequences(descriptor.stop_sequences)
            .with_seed(seed);
        self.client.generate_tagged(&request, descriptor.output).await
    }

    fn schema_bindings(&self, question: &str, retrieved: &RetrievedSchema) -> Bindings {
        Bindings::new()
            .with("question", question)
            .with("fields", self.catalog.render_fields(Some(retrieved)))
            .with("foreign_keys", self.catalog.render_foreign_keys(Some(retrieved)))
    }

    async fn link_schema(&self, question: &str) -> Result<(RetrievedSchema, String)> {
        let retrieved = self
            .retriever
            .retrieve(question, &self.catalog, self.index.as_deref())
            .await;
        if retrieved.is_empty() {
            return Err(Text2SqlError::SchemaLink {
                reason: "no schema matched".to_string(),
                raw_output: None,
            });
        }

        let bindings = self.schema_bindings(question, &retrieved);
        let generated = self.call(TemplateId::SchemaLinking, &bindings).await?;
        match generated.extracted_tag_value {
            Some(links) => Ok((retrieved, links)),
            None => Err(Text2SqlError::SchemaLink {
                reason: "model output contained no <links> block".to_string(),
                raw_output: Some(generated.raw_text),
            }),
        }
    }

    async fn classify(&self, question: &str, state: &PipelineState) -> Result<(ComplexityLabel, Vec<String>)> {
        let bindings = self
            .schema_bindings(question, state.retrieved())
            .with("schema_links", state.schema_links().unwrap_or_default());
        let generated = self.call(TemplateId::Classification, &bindings).await?;
        let value = required(&generated, TemplateId::Classification)?;

        let label: ComplexityLabel = value.parse().map_err(|label| Text2SqlError::Classification {
            label,
            raw_output: generated.raw_text.clone(),
        })?;

        let sub_questions = if label == ComplexityLabel::Nested {
            Extractor::new(OutputTag::Xml("sub_questions"))
                .require_last(&generated.raw_text)
                .map(|m| parse_sub_questions(m.content))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok((label, sub_questions))
    }

    async fn generate_sql(&self, question: &str, state: &PipelineState) -> Result<String> {
        let bindings = self
            .schema_bindings(question, state.retrieved())
            .with("schema_links", state.schema_links().unwrap_or_default());

        match state.complexity_label() {
            Some(ComplexityLabel::Easy) => self.generate_with(TemplateId::EasyGeneration, &bindings).await,
            Some(ComplexityLabel::NonNested) => self.generate_with(TemplateId::MediumGeneration, &bindings).await,
            Some(ComplexityLabel::Nested) if state.sub_questions().is_empty() => {
                warn!("NESTED question without sub-questions, using the non-nested template");
                self.generate_with(TemplateId::MediumGeneration, &bindings).await
            }
            Some(ComplexityLabel::Nested) => {
                let mut solved = String::new();
                for (i, sub_question) in state.sub_questions().iter().enumerate() {
                    let mut sub_bindings = bindings.clone();
                    sub_bindings.set("question", sub_question.as_str());
                    let sql = self.generate_with(TemplateId::MediumGeneration, &sub_bindings).await?;
                    debug!("Sub-question {} solved: {}", i + 1, sql);
                    solved.push_str(&format!("Sub-question {}: \"{}\"\nSQL: {}\n", i + 1, sub_question, sql));
                }
                let hard_bindings = bindings
                    .with("sub_questions", state.sub_questions().join("; "))
                    .with("solved_sub_queries", solved);
                self.generate_with(TemplateId::HardGeneration, &hard_bindings).await
            }
            None => Err(Text2SqlError::State("generation before classification".to_string())),
        }
    }

    /// One generation call: refusal check, SQL extraction, statement policy.
    async fn generate_with(&self, id: TemplateId, bindings: &Bindings) -> Result<String> {
        let generated = self.call(id, bindings).await?;
        if let Ok(refusal) = Extractor::new(OutputTag::Xml("refusal")).require_last(&generated.raw_text) {
            return Err(Text2SqlError::UnsafeStatementRejected(refusal.content.to_string()));
        }
        let sql = required(&generated, id)?;
        self.policy.check_sql(&sql, self.executor.dialect())?;
        Ok(sql)
    }

    fn fix_bindings(&self, question: &str, state: &PipelineState, sql: &str, error: &str) -> Bindings {
        self.schema_bindings(question, state.retrieved())
            .with("primary_keys", self.catalog.render_primary_keys(Some(state.retrieved())))
            .with("dialect", self.executor.dialect())
            .with("sql", sql)
            .with("error", error)
    }

    /// Pre-execution review through the correction template. Output without
    /// a SQL block keeps the draft.
    async fn review(&self, question: &str, state: &PipelineState, draft: &str) -> Result<String> {
        let bindings = self.fix_bindings(question, state, draft, REVIEW_NOTE);
        let generated = self.call(TemplateId::Correction, &bindings).await?;
        let reviewed = match required(&generated, TemplateId::Correction) {
            Ok(sql) => sql,
            Err(Text2SqlError::Extraction(e)) => {
                warn!("Review returned no {}, keeping the generated query", e.tag);
                return Ok(draft.to_string());
            }
            Err(e) => return Err(e),
        };
        self.policy.check_sql(&reviewed, self.executor.dialect())?;
        Ok(reviewed)
    }

    async fn correct(
        &self,
        question: &str,
        state: &PipelineState,
        sql: &str,
        error: &ExecutionError,
    ) -> Result<String> {
        let bindings = self.fix_bindings(question, state, sql, &error.to_string());
        let generated = self.call(TemplateId::Correction, &bindings).await?;
        let corrected = required(&generated, TemplateId::Correction)?;
        self.policy.check_sql(&corrected, self.executor.dialect())?;
        Ok(corrected)
    }

    /// Engine errors are a value here, not a stage failure.
    async fn execute(&self, sql: &str) -> Result<std::result::Result<QueryResult, ExecutionError>> {
        Ok(self.executor.execute(sql).await)
    }
}

fn required(generated: &GenerationResult, id: TemplateId) -> Result<String> {
    generated.extracted_tag_value.clone().ok_or_else(|| {
        ExtractionError {
            tag: id.descriptor().output.to_string(),
            raw_output: generated.raw_text.clone(),
        }
        .into()
    })
}
