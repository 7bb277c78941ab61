//! Pipeline state
//!
//! Mutable record of one question's trip through the stages. The
//! orchestrator only writes to it after a stage has finished, so a stage
//! that fails or times out leaves the previous values in place.

use crate::error::{Result, Text2SqlError};
use crate::executor::ExecutionError;
use crate::retrieval::RetrievedSchema;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Query complexity, as decided by the classification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComplexityLabel {
    #[serde(rename = "EASY")]
    Easy,
    #[serde(rename = "NON-NESTED")]
    NonNested,
    #[serde(rename = "NESTED")]
    Nested,
}

impl ComplexityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityLabel::Easy => "EASY",
            ComplexityLabel::NonNested => "NON-NESTED",
            ComplexityLabel::Nested => "NESTED",
        }
    }
}

impl fmt::Display for ComplexityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact match after trimming whitespace. No case folding.
impl FromStr for ComplexityLabel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "EASY" => Ok(ComplexityLabel::Easy),
            "NON-NESTED" => Ok(ComplexityLabel::NonNested),
            "NESTED" => Ok(ComplexityLabel::Nested),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelinePhase {
    Start,
    Linked,
    Classified,
    Generated,
    Executed,
    Correcting,
    Done,
    Failed,
}

impl PipelinePhase {
    fn can_move_to(self, next: PipelinePhase) -> bool {
        use PipelinePhase::*;
        matches!(
            (self, next),
            (Start, Linked)
                | (Linked, Classified)
                | (Classified, Generated)
                | (Generated, Executed)
                | (Generated, Correcting)
                | (Correcting, Executed)
                | (Executed, Done)
        ) || (next == Failed && !matches!(self, Done | Failed))
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelinePhase::Start => "START",
            PipelinePhase::Linked => "LINKED",
            PipelinePhase::Classified => "CLASSIFIED",
            PipelinePhase::Generated => "GENERATED",
            PipelinePhase::Executed => "EXECUTED",
            PipelinePhase::Correcting => "CORRECTING",
            PipelinePhase::Done => "DONE",
            PipelinePhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: PipelinePhase,
    pub to: PipelinePhase,
    /// Milliseconds since the run started
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    pub question: String,
    pub dialect: String,
    phase: PipelinePhase,
    retrieved: RetrievedSchema,
    schema_links: Option<String>,
    complexity_label: Option<ComplexityLabel>,
    sub_questions: Vec<String>,
    sql: Option<String>,
    /// Engine error that sent the run into correction
    execution_error: Option<ExecutionError>,
    transitions: Vec<Transition>,
    #[serde(skip)]
    started: Instant,
}

impl PipelineState {
    pub fn new(question: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            dialect: dialect.into(),
            phase: PipelinePhase::Start,
            retrieved: RetrievedSchema::default(),
            schema_links: None,
            complexity_label: None,
            sub_questions: Vec::new(),
            sql: None,
            execution_error: None,
            transitions: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn retrieved(&self) -> &RetrievedSchema {
        &self.retrieved
    }

    pub fn schema_links(&self) -> Option<&str> {
        self.schema_links.as_deref()
    }

    pub fn complexity_label(&self) -> Option<ComplexityLabel> {
        self.complexity_label
    }

    pub fn sub_questions(&self) -> &[String] {
        &self.sub_questions
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn execution_error(&self) -> Option<&ExecutionError> {
        self.execution_error.as_ref()
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn record_links(&mut self, retrieved: RetrievedSchema, links: String) -> Result<()> {
        self.advance(PipelinePhase::Linked)?;
        self.retrieved = retrieved;
        self.schema_links = Some(links);
        Ok(())
    }

    pub fn record_classification(&mut self, label: ComplexityLabel, sub_questions: Vec<String>) -> Result<()> {
        self.advance(PipelinePhase::Classified)?;
        self.complexity_label = Some(label);
        self.sub_questions = sub_questions;
        Ok(())
    }

    /// Store generated SQL. Refused before classification and for empty
    /// text, so nothing unclassified or empty can reach the executor.
    pub fn record_sql(&mut self, sql: String) -> Result<()> {
        if self.complexity_label.is_none() {
            return Err(Text2SqlError::State(
                "SQL recorded before a complexity label was assigned".to_string(),
            ));
        }
        if sql.trim().is_empty() {
            return Err(Text2SqlError::State("refusing to record empty SQL".to_string()));
        }
        if self.phase != PipelinePhase::Correcting {
            self.advance(PipelinePhase::Generated)?;
        }
        self.sql = Some(sql);
        Ok(())
    }

    /// Replace the generated SQL after a review, staying in GENERATED.
    pub fn revise_sql(&mut self, sql: String) -> Result<()> {
        if self.phase != PipelinePhase::Generated {
            return Err(Text2SqlError::State(format!("cannot revise SQL in {}", self.phase)));
        }
        if sql.trim().is_empty() {
            return Err(Text2SqlError::State("refusing to record empty SQL".to_string()));
        }
        self.sql = Some(sql);
        Ok(())
    }

    pub fn mark_correcting(&mut self, error: ExecutionError) -> Result<()> {
        self.advance(PipelinePhase::Correcting)?;
        self.execution_error = Some(error);
        Ok(())
    }

    pub fn mark_done(&mut self) -> Result<()> {
        self.advance(PipelinePhase::Executed)?;
        self.advance(PipelinePhase::Done)
    }

    pub fn mark_failed(&mut self) {
        if self.phase.can_move_to(PipelinePhase::Failed) {
            self.push_transition(PipelinePhase::Failed);
        }
    }

    fn advance(&mut self, next: PipelinePhase) -> Result<()> {
        if !self.phase.can_move_to(next) {
            return Err(Text2SqlError::State(format!("cannot move from {} to {}", self.phase, next)));
        }
        self.push_transition(next);
        Ok(())
    }

    fn push_transition(&mut self, next: PipelinePhase) {
        self.transitions.push(Transition {
            from: self.phase,
            to: next,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
        self.phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionErrorKind;

    #[test]
    fn test_label_parsing_is_strict() {
        assert_eq!(" NESTED\n".parse::<ComplexityLabel>(), Ok(ComplexityLabel::Nested));
        assert_eq!("NON-NESTED".parse::<ComplexityLabel>(), Ok(ComplexityLabel::NonNested));
        assert_eq!("easy".parse::<ComplexityLabel>(), Err("easy".to_string()));
        assert_eq!("NON NESTED".parse::<ComplexityLabel>(), Err("NON NESTED".to_string()));
        assert!("HARD".parse::<ComplexityLabel>().is_err());
    }

    #[test]
    fn test_sql_requires_label() {
        let mut state = PipelineState::new("q", "SQLite");
        state.record_links(RetrievedSchema::default(), "[t.a]".into()).unwrap();
        assert!(matches!(state.record_sql("SELECT 1".into()), Err(Text2SqlError::State(_))));
        assert_eq!(state.sql(), None);
        assert_eq!(state.phase(), PipelinePhase::Linked);
    }

    #[test]
    fn test_empty_sql_is_refused() {
        let mut state = PipelineState::new("q", "SQLite");
        state.record_links(RetrievedSchema::default(), "[]".into()).unwrap();
        state.record_classification(ComplexityLabel::Easy, vec![]).unwrap();
        assert!(state.record_sql("  \n".into()).is_err());
        assert_eq!(state.phase(), PipelinePhase::Classified);
    }

    #[test]
    fn test_correction_path_transitions() {
        let mut state = PipelineState::new("q", "SQLite");
        state.record_links(RetrievedSchema::default(), "[]".into()).unwrap();
        state.record_classification(ComplexityLabel::Easy, vec![]).unwrap();
        state.record_sql("SELECT nme FROM t".into()).unwrap();
        state
            .mark_correcting(ExecutionError::new(ExecutionErrorKind::UnknownObject, "no such column: nme"))
            .unwrap();
        state.record_sql("SELECT name FROM t".into()).unwrap();
        state.mark_done().unwrap();

        let phases: Vec<PipelinePhase> = state.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            phases,
            vec![
                PipelinePhase::Linked,
                PipelinePhase::Classified,
                PipelinePhase::Generated,
                PipelinePhase::Correcting,
                PipelinePhase::Executed,
                PipelinePhase::Done,
            ]
        );
        assert_eq!(state.sql(), Some("SELECT name FROM t"));
        assert_eq!(
            state.execution_error().map(|e| e.message.as_str()),
            Some("no such column: nme")
        );
    }

    #[test]
    fn test_revise_only_while_generated() {
        let mut state = PipelineState::new("q", "SQLite");
        state.record_links(RetrievedSchema::default(), "[]".into()).unwrap();
        state.record_classification(ComplexityLabel::Easy, vec![]).unwrap();
        assert!(state.revise_sql("SELECT 1".into()).is_err());

        state.record_sql("SELECT name FROM t GROUP BY name, id".into()).unwrap();
        state.revise_sql("SELECT name FROM t GROUP BY name".into()).unwrap();
        assert_eq!(state.phase(), PipelinePhase::Generated);
        assert_eq!(state.sql(), Some("SELECT name FROM t GROUP BY name"));
        assert_eq!(state.transitions().len(), 3);
    }

    #[test]
    fn test_cannot_skip_stages() {
        let mut state = PipelineState::new("q", "SQLite");
        assert!(state.record_classification(ComplexityLabel::Easy, vec![]).is_err());
        state.mark_failed();
        assert_eq!(state.phase(), PipelinePhase::Failed);
        state.mark_failed();
        assert_eq!(state.transitions().len(), 1);
    }
}
