//! Stage descriptor table
//!
//! One row per template: which pipeline stage uses it, which tag the model
//! must answer in, the stop sequences and the word-in-mouth seed. The
//! composer and the extractor both read from here, and
//! [`verify_stage_table`] refuses to start a session whose templates do not
//! contain the markers their row promises.

use crate::error::{Result, Text2SqlError};
use crate::extract::{is_valid_tag_name, OutputTag};
use crate::prompt::composer::PromptComposer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Pipeline stage, used for error context and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Question pre-filter, before any model call
    Safety,
    SchemaLinking,
    Classification,
    Generation,
    /// Second look at generated SQL before it first runs
    Review,
    Execution,
    Correction,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Safety => "safety-check",
            Stage::SchemaLinking => "schema-linking",
            Stage::Classification => "classification",
            Stage::Generation => "generation",
            Stage::Review => "review",
            Stage::Execution => "execution",
            Stage::Correction => "correction",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    SchemaLinking,
    Classification,
    EasyGeneration,
    MediumGeneration,
    HardGeneration,
    Correction,
}

impl TemplateId {
    pub const ALL: &'static [TemplateId] = &[
        TemplateId::SchemaLinking,
        TemplateId::Classification,
        TemplateId::EasyGeneration,
        TemplateId::MediumGeneration,
        TemplateId::HardGeneration,
        TemplateId::Correction,
    ];

    pub fn file_stem(&self) -> &'static str {
        match self {
            TemplateId::SchemaLinking => "schema_linking",
            TemplateId::Classification => "classification",
            TemplateId::EasyGeneration => "easy_generation",
            TemplateId::MediumGeneration => "medium_generation",
            TemplateId::HardGeneration => "hard_generation",
            TemplateId::Correction => "correction",
        }
    }

    pub fn descriptor(&self) -> &'static StageDescriptor {
        match self {
            TemplateId::SchemaLinking => &SCHEMA_LINKING,
            TemplateId::Classification => &CLASSIFICATION,
            TemplateId::EasyGeneration => &EASY_GENERATION,
            TemplateId::MediumGeneration => &MEDIUM_GENERATION,
            TemplateId::HardGeneration => &HARD_GENERATION,
            TemplateId::Correction => &CORRECTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub template: TemplateId,
    pub stage: Stage,
    /// Tag holding the value the stage needs
    pub output: OutputTag,
    /// Tags the stage reads when present
    pub optional_outputs: &'static [OutputTag],
    pub stop_sequences: &'static [&'static str],
    /// Word-in-mouth prefix; rendered with the same bindings as the template
    pub seed: Option<&'static str>,
}

const EXAMPLE_STOPS: &[&str] = &["</example>", "<example>"];

pub const SCHEMA_LINKING: StageDescriptor = StageDescriptor {
    template: TemplateId::SchemaLinking,
    stage: Stage::SchemaLinking,
    output: OutputTag::Xml("links"),
    optional_outputs: &[],
    stop_sequences: EXAMPLE_STOPS,
    seed: Some("A: Let's think step by step. In the question \"{{question}}\", we are asked:"),
};

pub const CLASSIFICATION: StageDescriptor = StageDescriptor {
    template: TemplateId::Classification,
    stage: Stage::Classification,
    output: OutputTag::Xml("label"),
    optional_outputs: &[OutputTag::Xml("sub_questions")],
    stop_sequences: EXAMPLE_STOPS,
    seed: Some("A: Let's think step by step."),
};

pub const EASY_GENERATION: StageDescriptor = StageDescriptor {
    template: TemplateId::EasyGeneration,
    stage: Stage::Generation,
    output: OutputTag::Fence("sql"),
    optional_outputs: &[OutputTag::Xml("refusal")],
    stop_sequences: EXAMPLE_STOPS,
    seed: Some("SQL: ```sql"),
};

pub const MEDIUM_GENERATION: StageDescriptor = StageDescriptor {
    template: TemplateId::MediumGeneration,
    stage: Stage::Generation,
    output: OutputTag::Fence("sql"),
    optional_outputs: &[OutputTag::Xml("refusal")],
    stop_sequences: EXAMPLE_STOPS,
    seed: Some(
        "A: Let's think step by step. For creating the SQL for the given question, we need to join these tables =",
    ),
};

pub const HARD_GENERATION: StageDescriptor = StageDescriptor {
    template: TemplateId::HardGeneration,
    stage: Stage::Generation,
    output: OutputTag::Fence("sql"),
    optional_outputs: &[OutputTag::Xml("refusal")],
    stop_sequences: EXAMPLE_STOPS,
    seed: Some(
        "A: Let's think step by step. \"{{question}}\" can be solved by knowing the answer to the following sub-question \"{{sub_questions}}\".",
    ),
};

pub const CORRECTION: StageDescriptor = StageDescriptor {
    template: TemplateId::Correction,
    stage: Stage::Correction,
    output: OutputTag::Fence("sql"),
    optional_outputs: &[],
    stop_sequences: EXAMPLE_STOPS,
    seed: None,
};

pub const STAGE_TABLE: [&StageDescriptor; 6] = [
    &SCHEMA_LINKING,
    &CLASSIFICATION,
    &EASY_GENERATION,
    &MEDIUM_GENERATION,
    &HARD_GENERATION,
    &CORRECTION,
];

/// Check that every template in `composer` carries the exact open and close
/// markers of the tags its stage extracts, and that the table covers each
/// template once.
pub fn verify_stage_table(composer: &PromptComposer) -> Result<()> {
    let mut seen = HashSet::new();
    let mut problems = Vec::new();

    for descriptor in STAGE_TABLE.iter() {
        if !seen.insert(descriptor.template) {
            problems.push(format!("{} appears twice", descriptor.template.file_stem()));
        }

        let template = composer.template(descriptor.template);
        let tags = std::iter::once(&descriptor.output).chain(descriptor.optional_outputs.iter());
        for tag in tags {
            let name = match tag {
                OutputTag::Xml(name) | OutputTag::Fence(name) => *name,
            };
            if !is_valid_tag_name(name) {
                problems.push(format!("{}: invalid tag name {:?}", descriptor.template.file_stem(), name));
            }
            for marker in [tag.open_marker(), tag.close_marker()] {
                if !template.contains(&marker) {
                    problems.push(format!(
                        "{} template never mentions {}",
                        descriptor.template.file_stem(),
                        marker
                    ));
                }
            }
        }
    }

    for id in TemplateId::ALL {
        if !seen.contains(id) {
            problems.push(format!("{} has no stage descriptor", id.file_stem()));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Text2SqlError::Template(format!(
            "stage table check failed: {}",
            problems.join("; ")
        )))
    }
}
