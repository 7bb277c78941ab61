//! Prompt templates, composition and the stage descriptor table.

pub mod composer;
pub mod stages;
pub mod templates;

pub use composer::{placeholders, render, Bindings, PromptComposer};
pub use stages::{verify_stage_table, Stage, StageDescriptor, TemplateId, STAGE_TABLE};
