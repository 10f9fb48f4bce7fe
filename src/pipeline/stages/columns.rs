//! Column enrichment - one generation call per table

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{generate_structured, tally, Capabilities, ItemOutcome};
use crate::error::AppError;
use crate::generation::{prompts, Generator};
use crate::introspection::Table;
use crate::ledger::record_staged;
use crate::models::{ChangeDiff, ColumnFields, EnrichmentStatus, QuestionCategory, QuestionDraft, ReviewState};
use crate::pipeline::context::NodeContext;
use crate::pipeline::orchestrator::NodeExecutor;
use crate::pipeline::types::{DagNode, NodeReport};
use crate::questions::raise_in;

#[derive(Debug, Deserialize)]
struct ColumnsReply {
    columns: Vec<ColumnReply>,
}

#[derive(Debug, Deserialize)]
struct ColumnReply {
    name: String,
    #[serde(default)]
    business_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    semantic_type: Option<String>,
    #[serde(default = "full_confidence")]
    confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

pub struct ColumnEnrichmentStage {
    capabilities: Capabilities,
}

impl ColumnEnrichmentStage {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    async fn enrich(&self, ctx: &NodeContext, generator: &dyn Generator, table: &Table) -> Result<ItemOutcome, AppError> {
        let prompt = prompts::column_prompt(table);
        let reply = match generate_structured::<ColumnsReply>(ctx, generator, &prompt).await? {
            Ok(reply) => reply,
            Err(reason) => {
                // No object to mark: columns without an annotation stay pending
                debug!(table = %table.path(), %reason, "Column enrichment failed");
                return Ok(ItemOutcome::Failed);
            }
        };

        let threshold = ctx.settings.question_confidence_threshold;
        let node = ctx.node;
        ctx.store
            .commit(ctx.ontology_id, |state| {
                for column in &reply.columns {
                    let Some(actual) = table.column(column.name.trim()) else {
                        debug!(table = %table.path(), column = %column.name, "Ignoring annotation for unknown column");
                        continue;
                    };
                    let location = table.location(&actual.name);
                    let before = state.column(&location).map(|c| c.fields.clone());
                    let after = ColumnFields {
                        business_name: non_empty(&column.business_name),
                        description: non_empty(&column.description),
                        semantic_type: non_empty(&column.semantic_type).map(|t| t.to_lowercase()),
                    };
                    record_staged(
                        state,
                        ChangeDiff::AnnotateColumn {
                            location: location.clone(),
                            before,
                            after,
                        },
                        node,
                    )?;

                    if column.confidence < threshold {
                        raise_in(
                            state,
                            QuestionDraft::new(
                                format!("column:{}", location),
                                format!(
                                    "What does {} ({}) hold? The suggested meaning is {}.",
                                    location,
                                    actual.data_type,
                                    non_empty(&column.description).unwrap_or_else(|| "unclear".to_string())
                                ),
                                QuestionCategory::Terminology,
                            )
                            .priority(4)
                            .raised_by(node),
                        )?;
                    }
                }
                Ok(ItemOutcome::Enriched)
            })
            .await
    }
}

#[async_trait]
impl NodeExecutor for ColumnEnrichmentStage {
    fn node(&self) -> DagNode {
        DagNode::ColumnEnrichment
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let generator: Arc<dyn Generator> = self.capabilities.generator()?;
        let snapshot = ctx.snapshot().await?;

        // Tables with at least one column that has no live or staged annotation
        let tables: Vec<Table> = ctx
            .store
            .read(ctx.ontology_id, |state| {
                snapshot
                    .tables
                    .iter()
                    .filter(|table| {
                        table.columns.iter().any(|c| {
                            state.column(&table.location(&c.name)).map_or(true, |a| {
                                a.enrichment != EnrichmentStatus::Enriched && a.review != ReviewState::Rejected
                            })
                        })
                    })
                    .cloned()
                    .collect()
            })
            .await?;

        let results = ctx
            .for_each_bounded(tables, |table| {
                let generator = generator.clone();
                async move { self.enrich(ctx, generator.as_ref(), &table).await }
            })
            .await?;
        tally(ctx, "tables", results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{node_context, orders_users_schema, seeded_store, ScriptedGenerator};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_columns_are_staged_and_unknown_names_ignored() {
        let (store, id) = seeded_store(Some(orders_users_schema())).await;
        let generator = ScriptedGenerator::new()
            .on(
                "public.orders",
                r#"{"columns": [
                    {"name": "total", "business_name": "Order Total", "description": "Amount", "semantic_type": "Currency", "confidence": 0.9},
                    {"name": "discount", "business_name": "Discount", "confidence": 0.9},
                    {"name": "status", "business_name": "Status", "description": "Lifecycle", "semantic_type": "enum", "confidence": 0.3}
                ]}"#,
            )
            .fail_on("public.users", "upstream timeout");
        let stage = ColumnEnrichmentStage::new(Capabilities {
            generator: Some(Arc::new(generator)),
            ..Default::default()
        });

        // One of two tables failed: over the default ratio
        let err = stage
            .execute(&node_context(store.clone(), id, DagNode::ColumnEnrichment))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Generation(_)));

        store
            .read(id, |state| {
                let mut annotated: Vec<String> = state.columns().map(|c| c.location.to_string()).collect();
                annotated.sort();
                assert_eq!(annotated, vec!["public.orders.status", "public.orders.total"]);

                let total = state.columns().find(|c| c.location.column == "total").unwrap();
                assert_eq!(total.fields.semantic_type.as_deref(), Some("currency"));
                assert_eq!(total.review, ReviewState::Staged);

                let questions: Vec<&str> = state.questions().map(|q| q.source.as_str()).collect();
                assert_eq!(questions, vec!["column:public.orders.status"]);
            })
            .await
            .unwrap();
    }
}
