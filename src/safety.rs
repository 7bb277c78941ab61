//! Statement Safety Policy
//!
//! Two checks, both producing `UnsafeStatementRejected`: a keyword filter
//! on the question before any model call, and a parse of the generated SQL
//! before it reaches the executor. Only queries (and EXPLAIN of a query)
//! pass the second check.

use crate::error::{Result, Text2SqlError};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::{dialect_from_str, GenericDialect};
use sqlparser::parser::Parser;
use tracing::{debug, warn};

/// Verbs that ask for data to be changed rather than read.
pub const MUTATING_VERBS: &[&str] = &[
    "delete", "drop", "insert", "update", "truncate", "alter", "create", "grant", "revoke", "merge",
];

const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "EXPLAIN", "VALUES"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementClass {
    ReadOnly,
    /// Statement kind that was found, e.g. "DELETE"
    Mutating(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementPolicy {
    enabled: bool,
}

impl Default for StatementPolicy {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl StatementPolicy {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn check_question(&self, question: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        match mutating_verb(question) {
            Some(verb) => Err(Text2SqlError::UnsafeStatementRejected(format!(
                "question asks to {} data; only read-only questions are answered",
                verb
            ))),
            None => Ok(()),
        }
    }

    pub fn check_sql(&self, sql: &str, dialect: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        match classify_statement(sql, dialect) {
            StatementClass::ReadOnly => Ok(()),
            StatementClass::Mutating(kind) => Err(Text2SqlError::UnsafeStatementRejected(format!(
                "generated {} statement: {}",
                kind, sql
            ))),
        }
    }
}

/// Words after which the next word is read as a command ("please delete",
/// "can you drop", "and then update").
const LEAD_INS: &[&str] = &["please", "kindly", "you", "to", "and", "then", "now", "also", "just", "go"];

/// First mutating verb used as a command: opening a clause or following a
/// lead-in. Nouns such as "a grant" or "the latest update" do not count.
pub fn mutating_verb(question: &str) -> Option<&'static str> {
    for clause in question.split(['.', ';', ':', '!', '?', ',', '\n']) {
        let mut previous: Option<String> = None;
        for word in clause
            .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '\'')
            .filter(|word| !word.is_empty())
        {
            let lower = word.to_lowercase();
            let imperative = previous.as_deref().map_or(true, |p| LEAD_INS.contains(&p));
            if imperative {
                if let Some(verb) = MUTATING_VERBS.iter().copied().find(|verb| *verb == lower) {
                    return Some(verb);
                }
            }
            previous = Some(lower);
        }
    }
    None
}

/// Parse `sql` with the named dialect (generic when unknown) and classify
/// every statement. Unparsable input falls back to the leading keyword.
pub fn classify_statement(sql: &str, dialect: &str) -> StatementClass {
    let dialect = dialect_from_str(dialect.to_lowercase()).unwrap_or_else(|| Box::new(GenericDialect {}));

    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) if statements.is_empty() => StatementClass::Mutating("empty".to_string()),
        Ok(statements) => statements
            .iter()
            .map(classify_ast)
            .find(|class| *class != StatementClass::ReadOnly)
            .unwrap_or(StatementClass::ReadOnly),
        Err(e) => {
            warn!("SQL parsing failed: {}, using keyword fallback", e);
            classify_by_keyword(sql)
        }
    }
}

fn classify_ast(statement: &Statement) -> StatementClass {
    match statement {
        Statement::Query(query) => {
            if query_writes(&query.body) {
                StatementClass::Mutating("data-modifying query".to_string())
            } else {
                StatementClass::ReadOnly
            }
        }
        Statement::Explain { statement, .. } => classify_ast(statement),
        other => {
            let kind = statement_kind(other);
            debug!("Rejecting {} statement", kind);
            StatementClass::Mutating(kind)
        }
    }
}

fn query_writes(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::Query(query) => query_writes(&query.body),
        SetExpr::SetOperation { left, right, .. } => query_writes(left) || query_writes(right),
        SetExpr::Insert(_) | SetExpr::Update(_) => true,
        _ => false,
    }
}

fn statement_kind(statement: &Statement) -> String {
    // The Display form starts with the statement keyword(s)
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

fn classify_by_keyword(sql: &str) -> StatementClass {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_uppercase();
    if READ_KEYWORDS.contains(&first.as_str()) {
        let upper = sql.to_uppercase();
        let hidden_write = upper
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .any(|word| MUTATING_VERBS.iter().any(|verb| verb.eq_ignore_ascii_case(word)));
        if hidden_write {
            StatementClass::Mutating("statement with a mutating keyword".to_string())
        } else {
            StatementClass::ReadOnly
        }
    } else if first.is_empty() {
        StatementClass::Mutating("empty".to_string())
    } else {
        StatementClass::Mutating(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_prefilter() {
        let policy = StatementPolicy::default();
        assert!(policy.check_question("How many customers do we have?").is_ok());
        assert!(matches!(
            policy.check_question("delete all the customers"),
            Err(Text2SqlError::UnsafeStatementRejected(_))
        ));
        assert_eq!(mutating_verb("Please DROP the orders table"), Some("drop"));
        // Whole words only
        assert_eq!(mutating_verb("customers created last week"), None);
    }

    #[test]
    fn test_question_prefilter_reads_verbs_as_commands() {
        let policy = StatementPolicy::default();
        for question in [
            "Which students received a grant?",
            "Show the latest update for each order",
            "How many merge requests were opened?",
            "List the drop-off points in Paris",
        ] {
            assert!(policy.check_question(question).is_ok(), "{question}");
        }

        assert_eq!(mutating_verb("Delete every customer from London"), Some("delete"));
        assert_eq!(mutating_verb("Can you delete all customers"), Some("delete"));
        assert_eq!(mutating_verb("Show the orders, then truncate them"), Some("truncate"));
        assert_eq!(mutating_verb("I want to insert a new product"), Some("insert"));
    }

    #[test]
    fn test_queries_pass() {
        assert_eq!(classify_statement("SELECT COUNT(*) FROM customers", "SQLite"), StatementClass::ReadOnly);
        assert_eq!(
            classify_statement(
                "WITH t AS (SELECT * FROM orders) SELECT customer_id FROM t UNION SELECT 1",
                "PostgreSQL"
            ),
            StatementClass::ReadOnly
        );
        assert_eq!(classify_statement("EXPLAIN SELECT 1", "generic"), StatementClass::ReadOnly);
    }

    #[test]
    fn test_mutations_rejected() {
        assert_eq!(
            classify_statement("DELETE FROM customers", "SQLite"),
            StatementClass::Mutating("DELETE".to_string())
        );
        assert_eq!(
            classify_statement("SELECT 1; DROP TABLE customers", "SQLite"),
            StatementClass::Mutating("DROP".to_string())
        );
        assert!(matches!(
            classify_statement("SELECT * INTO backup FROM customers", "PostgreSQL"),
            StatementClass::Mutating(_)
        ));
    }

    #[test]
    fn test_unparsable_falls_back_to_keyword() {
        assert_eq!(classify_by_keyword("SELECT weird ~~~ syntax"), StatementClass::ReadOnly);
        assert_eq!(
            classify_by_keyword("UPSERT INTO t VALUES (1)"),
            StatementClass::Mutating("UPSERT".to_string())
        );
    }

    #[test]
    fn test_disabled_policy_allows_everything() {
        let policy = StatementPolicy::disabled();
        assert!(policy.check_question("delete all the customers").is_ok());
        assert!(policy.check_sql("DELETE FROM customers", "SQLite").is_ok());
    }
}
