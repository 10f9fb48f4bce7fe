//! Prompt builders
//!
//! Each stage asks for one JSON shape; the shape is spelled out at the end of
//! every prompt.

use std::fmt::Write;

use crate::introspection::{SchemaSnapshot, Table};
use crate::models::{Entity, GlossaryTerm, Relationship};

/// `schema.table(col type, ...)`, one table per line
pub fn table_outline(table: &Table) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut col = format!("{} {}", c.name, c.data_type);
            if c.is_primary_key {
                col.push_str(" pk");
            }
            col
        })
        .collect();
    format!("{}({})", table.path(), columns.join(", "))
}

pub fn schema_outline(snapshot: &SchemaSnapshot) -> String {
    let mut out = String::new();
    for table in &snapshot.tables {
        let _ = writeln!(out, "{}", table_outline(table));
    }
    for fk in &snapshot.foreign_keys {
        let _ = writeln!(
            out,
            "fk {}.{}({}) -> {}.{}({})",
            fk.source_schema,
            fk.source_table,
            fk.source_columns.join(", "),
            fk.referenced_schema,
            fk.referenced_table,
            fk.referenced_columns.join(", ")
        );
    }
    out
}

pub fn entity_prompt(entity: &Entity, table: Option<&Table>) -> String {
    let mut prompt = format!(
        "Describe the business concept \"{}\", stored in {}.\n",
        entity.name,
        entity.primary_location.table_path()
    );
    if let Some(table) = table {
        let _ = writeln!(prompt, "Table: {}", table_outline(table));
    }
    prompt.push_str(
        "Respond with {\"description\": string, \"aliases\": [string], \
\"confidence\": number between 0 and 1, \"ambiguity\": string or null}. \
Set ambiguity when the table could mean more than one thing.",
    );
    prompt
}

/// One direction of a relationship. The label reads source -> target.
pub fn relationship_prompt(row: &Relationship, source: Option<&Table>, target: Option<&Table>) -> String {
    let mut prompt = format!(
        "{} relates to {} through {} -> {} (cardinality {}).\n",
        row.source_entity,
        row.target_entity,
        row.source_location,
        row.target_location,
        serde_json::to_string(&row.cardinality).unwrap_or_default().trim_matches('"')
    );
    for table in [source, target].into_iter().flatten() {
        let _ = writeln!(prompt, "Table: {}", table_outline(table));
    }
    let _ = write!(
        prompt,
        "Name the association as a short snake_case verb phrase read from {} to {} \
(for example placed_by or places). Respond with {{\"association\": string, \
\"description\": string, \"confidence\": number between 0 and 1}}.",
        row.source_entity, row.target_entity
    );
    prompt
}

pub fn column_prompt(table: &Table) -> String {
    format!(
        "Annotate every column of {}.\n\
Respond with {{\"columns\": [{{\"name\": string, \"business_name\": string, \
\"description\": string, \"semantic_type\": string, \"confidence\": number between 0 and 1}}]}}. \
semantic_type is one of identifier, reference, name, email, currency, quantity, \
timestamp, enum, flag, text, other.",
        table_outline(table)
    )
}

pub fn glossary_discovery_prompt(snapshot: &SchemaSnapshot, entities: &[&Entity]) -> String {
    let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
    format!(
        "Schema:\n{}\nEntities: {}\n\
List the business metrics and terms an analyst would ask about (revenue, active users and similar). \
Respond with {{\"terms\": [{{\"term\": string, \"definition\": string, \"aliases\": [string]}}]}}.",
        schema_outline(snapshot),
        names.join(", ")
    )
}

const SQL_SHAPE: &str = "Respond with {\"sql\": string, \"explanation\": string}. \
The sql must be a single read-only SELECT statement using only the tables and columns above.";

/// First attempt at a glossary SQL pattern
pub fn glossary_sql_prompt(term: &GlossaryTerm, snapshot: &SchemaSnapshot) -> String {
    format!(
        "Schema:\n{}\nWrite a SQL query that computes the business term \"{}\": {}\n{}",
        schema_outline(snapshot),
        term.term,
        term.fields.definition,
        SQL_SHAPE
    )
}

/// Repair attempt: the exact error, the real columns of the tables the failed
/// statement touched, a targeted hint and the failed statement verbatim
pub fn glossary_retry_prompt(
    term: &GlossaryTerm,
    previous_sql: &str,
    error: &str,
    hint: &str,
    tables: &[&Table],
) -> String {
    let mut prompt = format!(
        "Your previous query for \"{}\" ({}) failed validation.\n\
Error: {}\n",
        term.term, term.fields.definition, error
    );
    if !tables.is_empty() {
        prompt.push_str("Actual columns of the tables involved:\n");
        for table in tables {
            let _ = writeln!(prompt, "  {}", table_outline(table));
        }
    }
    let _ = write!(
        prompt,
        "Hint: {}\nPrevious query:\n{}\nReturn a corrected query. {}",
        hint, previous_sql, SQL_SHAPE
    );
    prompt
}

pub fn finalization_prompt(entities: &[&Entity], relationships: &[&Relationship], terms: &[&GlossaryTerm]) -> String {
    let mut prompt = String::from("Summarize this domain model for a new analyst.\nEntities:\n");
    for entity in entities {
        let _ = writeln!(
            prompt,
            "- {}: {}",
            entity.name,
            entity.description.as_deref().unwrap_or("(no description)")
        );
    }
    prompt.push_str("Relationships:\n");
    for row in relationships {
        let _ = writeln!(
            prompt,
            "- {} {} {}",
            row.source_entity,
            row.association.as_deref().unwrap_or("relates_to"),
            row.target_entity
        );
    }
    prompt.push_str("Glossary:\n");
    for term in terms {
        let _ = writeln!(prompt, "- {}: {}", term.term, term.fields.definition);
    }
    prompt.push_str(
        "Respond with {\"summary\": string, \"domains\": [string]} where domains names the \
business areas covered (sales, billing and so on).",
    );
    prompt
}
