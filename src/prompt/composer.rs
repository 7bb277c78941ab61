//! Prompt Composer
//!
//! Renders stage templates by substituting `{{name}}` placeholders. Values
//! are inserted verbatim and never re-scanned, so a question containing
//! `{{` cannot inject another placeholder.

use crate::error::{Result, Text2SqlError};
use crate::prompt::stages::TemplateId;
use crate::prompt::templates;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::info;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap();
}

/// Values substituted into a template.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: BTreeMap<&'static str, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(name, value.into());
        self
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<String>) {
        self.values.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Placeholder names used in `template`, sorted.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Substitute every placeholder. Any placeholder without a binding is an
/// error; extra bindings are ignored.
pub fn render(template: &str, bindings: &Bindings) -> Result<String> {
    let mut missing = BTreeSet::new();
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match bindings.get(name) {
            Some(value) => value.to_string(),
            None => {
                missing.insert(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(Text2SqlError::Template(format!(
            "missing bindings: {}",
            missing.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(rendered.into_owned())
}

#[derive(Debug, Clone)]
pub struct PromptComposer {
    templates: HashMap<TemplateId, Cow<'static, str>>,
}

impl Default for PromptComposer {
    fn default() -> Self {
        let templates = TemplateId::ALL
            .iter()
            .map(|id| (*id, Cow::Borrowed(builtin(*id))))
            .collect();
        Self { templates }
    }
}

impl PromptComposer {
    /// Built-in templates, overridden by `<dir>/<template>.txt` files that
    /// exist.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut composer = Self::default();
        for id in TemplateId::ALL {
            let path = dir.join(format!("{}.txt", id.file_stem()));
            if path.is_file() {
                let text = std::fs::read_to_string(&path)?;
                info!("Using template override {}", path.display());
                composer = composer.with_template(*id, text);
            }
        }
        Ok(composer)
    }

    pub fn with_template(mut self, id: TemplateId, text: impl Into<String>) -> Self {
        self.templates.insert(id, Cow::Owned(text.into()));
        self
    }

    pub fn template(&self, id: TemplateId) -> &str {
        self.templates
            .get(&id)
            .map(|t| t.as_ref())
            .unwrap_or_else(|| builtin(id))
    }

    pub fn compose(&self, id: TemplateId, bindings: &Bindings) -> Result<String> {
        render(self.template(id), bindings)
            .map_err(|e| Text2SqlError::Template(format!("{} template: {}", id.file_stem(), e)))
    }
}

fn builtin(id: TemplateId) -> &'static str {
    match id {
        TemplateId::SchemaLinking => templates::SCHEMA_LINKING,
        TemplateId::Classification => templates::CLASSIFICATION,
        TemplateId::EasyGeneration => templates::EASY_GENERATION,
        TemplateId::MediumGeneration => templates::MEDIUM_GENERATION,
        TemplateId::HardGeneration => templates::HARD_GENERATION,
        TemplateId::Correction => templates::CORRECTION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_all() {
        let bindings = Bindings::new().with("question", "How many?").with("fields", "Table t");
        let out = render("{{fields}}\nQ: \"{{ question }}\"", &bindings).unwrap();
        assert_eq!(out, "Table t\nQ: \"How many?\"");
    }

    #[test]
    fn test_missing_binding_is_an_error() {
        let err = render("{{a}} {{b}}", &Bindings::new().with("a", "x")).unwrap_err();
        assert!(err.to_string().contains("missing bindings: b"));
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let bindings = Bindings::new().with("question", "{{secret}}");
        assert_eq!(render("Q: {{question}}", &bindings).unwrap(), "Q: {{secret}}");
    }

    #[test]
    fn test_schema_linking_template_bindings() {
        let composer = PromptComposer::default();
        let names = placeholders(composer.template(TemplateId::SchemaLinking));
        let expected: BTreeSet<String> = ["fields", "foreign_keys", "question"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_compose_embeds_question_after_examples() {
        let composer = PromptComposer::default();
        let prompt = composer
            .compose(
                TemplateId::EasyGeneration,
                &Bindings::new()
                    .with("fields", "Table pets, columns = [pet_id,age]\n")
                    .with("question", "How many pets are there?")
                    .with("schema_links", "[pets.pet_id]"),
            )
            .unwrap();
        let example_end = prompt.rfind("</example>").unwrap();
        let question_pos = prompt.find("How many pets are there?").unwrap();
        assert!(question_pos > example_end);
    }

    #[test]
    fn test_override_from_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("correction.txt"), "fix {{sql}} ```sql ```").unwrap();
        let composer = PromptComposer::from_dir(dir.path()).unwrap();
        assert_eq!(composer.template(TemplateId::Correction), "fix {{sql}} ```sql ```");
        assert_eq!(
            composer.template(TemplateId::SchemaLinking),
            templates::SCHEMA_LINKING
        );
    }
}
