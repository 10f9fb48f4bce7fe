//! Glossary discovery and SQL enrichment

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::{tally, Capabilities, ItemOutcome};
use crate::error::AppError;
use crate::generation::{parse_structured, prompts, Generator};
use crate::introspection::SchemaSnapshot;
use crate::ledger::record_staged;
use crate::models::{ChangeDiff, EnrichmentStatus, Entity, GlossaryFields, GlossaryTerm};
use crate::pipeline::context::NodeContext;
use crate::pipeline::orchestrator::NodeExecutor;
use crate::pipeline::types::{DagNode, NodeReport};
use crate::simulation::{RepairOutcome, SqlRepairLoop};

#[derive(Debug, Deserialize)]
struct TermsReply {
    terms: Vec<TermReply>,
}

#[derive(Debug, Deserialize)]
struct TermReply {
    term: String,
    definition: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Proposes business terms from the schema and the discovered entities
pub struct GlossaryDiscoveryStage {
    capabilities: Capabilities,
}

impl GlossaryDiscoveryStage {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }
}

#[async_trait]
impl NodeExecutor for GlossaryDiscoveryStage {
    fn node(&self) -> DagNode {
        DagNode::GlossaryDiscovery
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let generator = self.capabilities.generator()?;
        let snapshot = ctx.snapshot().await?;
        let entities: Vec<Entity> = ctx
            .store
            .read(ctx.ontology_id, |state| state.entities().filter(|e| e.is_active()).cloned().collect())
            .await?;
        let entity_refs: Vec<&Entity> = entities.iter().collect();

        // A single call: its failure is the node's failure
        let prompt = prompts::glossary_discovery_prompt(&snapshot, &entity_refs);
        let raw = ctx.generate(generator.as_ref(), &prompt).await?;
        let reply: TermsReply = parse_structured(&raw)?;

        let node = ctx.node;
        let report = ctx
            .store
            .commit(ctx.ontology_id, |state| {
                let mut report = NodeReport::default();
                for proposed in &reply.terms {
                    let term = proposed.term.trim();
                    if term.is_empty() || proposed.definition.trim().is_empty() {
                        report.skipped += 1;
                        continue;
                    }
                    // Existing terms, including rejected ones, are left alone
                    if state.glossary_term(term).is_some() {
                        report.skipped += 1;
                        continue;
                    }
                    let diff = ChangeDiff::UpsertGlossaryTerm {
                        term: term.to_string(),
                        before: None,
                        after: GlossaryFields {
                            definition: proposed.definition.trim().to_string(),
                            aliases: proposed.aliases.clone(),
                            sql_pattern: None,
                        },
                    };
                    if record_staged(state, diff, node)?.is_some() {
                        report.processed += 1;
                    }
                }
                Ok(report)
            })
            .await?;

        info!(ontology_id = %ctx.ontology_id, terms = report.processed, "Glossary discovery finished");
        Ok(NodeReport {
            message: format!("{} glossary terms proposed", report.processed),
            ..report
        })
    }
}

/// Validated SQL for every term that lacks it, via the repair loop
pub struct GlossaryEnrichmentStage {
    capabilities: Capabilities,
}

impl GlossaryEnrichmentStage {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    async fn enrich(
        &self,
        ctx: &NodeContext,
        repair: &SqlRepairLoop,
        snapshot: &SchemaSnapshot,
        term: GlossaryTerm,
    ) -> Result<ItemOutcome, AppError> {
        let outcome = repair.run(&term, snapshot, &ctx.cancel).await?;
        let node = ctx.node;

        ctx.store
            .commit(ctx.ontology_id, |state| {
                let Some(current) = state.glossary_term(&term.term).cloned() else {
                    return Ok(ItemOutcome::Failed);
                };
                match &outcome {
                    RepairOutcome::Valid { sql, attempts } => {
                        if let Some(record) = state.glossary_term_mut(&term.term) {
                            record.attempt_count = *attempts;
                            record.last_error = None;
                        }
                        let after = GlossaryFields {
                            sql_pattern: Some(sql.clone()),
                            ..current.fields.clone()
                        };
                        record_staged(
                            state,
                            ChangeDiff::UpsertGlossaryTerm {
                                term: current.term.clone(),
                                before: Some(current.fields.clone()),
                                after,
                            },
                            node,
                        )?;
                        Ok(ItemOutcome::Enriched)
                    }
                    RepairOutcome::Exhausted {
                        attempts, last_error, ..
                    } => {
                        warn!(term = %current.term, attempts, error = %last_error, "Glossary SQL exhausted its attempts");
                        if let Some(record) = state.glossary_term_mut(&term.term) {
                            record.enrichment = EnrichmentStatus::Failed;
                            record.attempt_count = *attempts;
                            record.last_error = Some(last_error.clone());
                            record.updated_at = Utc::now();
                        }
                        Ok(ItemOutcome::Failed)
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl NodeExecutor for GlossaryEnrichmentStage {
    fn node(&self) -> DagNode {
        DagNode::GlossaryEnrichment
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let generator: Arc<dyn Generator> = self.capabilities.generator()?;
        let validator = self.capabilities.validator()?;
        let snapshot = ctx.snapshot().await?;
        let repair = SqlRepairLoop::new(
            generator,
            validator,
            ctx.settings.glossary_max_attempts,
            ctx.generation_timeout(),
        );

        let pending: Vec<GlossaryTerm> = ctx
            .store
            .read(ctx.ontology_id, |state| {
                state
                    .glossary()
                    .filter(|t| t.is_active() && t.enrichment != EnrichmentStatus::Enriched)
                    .cloned()
                    .collect()
            })
            .await?;

        let results = ctx
            .for_each_bounded(pending, |term| self.enrich(ctx, &repair, &snapshot, term))
            .await?;
        tally(ctx, "glossary terms", results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::ledger::ChangeLedger;
    use crate::models::ChangeStatus;
    use crate::simulation::StaticAnalyzer;
    use crate::testing::{node_context, orders_users_schema, seeded_store, ScriptedGenerator};
    use pretty_assertions::assert_eq;

    fn capabilities(generator: ScriptedGenerator) -> Capabilities {
        Capabilities {
            generator: Some(Arc::new(generator)),
            validator: Some(Arc::new(StaticAnalyzer::new())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_discovery_stages_new_terms_once() {
        let (store, id) = seeded_store(Some(orders_users_schema())).await;
        let generator = ScriptedGenerator::new().on(
            "List the business metrics",
            r#"{"terms": [
                {"term": "Revenue", "definition": "Sum of order totals", "aliases": ["sales"]},
                {"term": "revenue ", "definition": "Duplicate in another case"},
                {"term": "", "definition": "blank"}
            ]}"#,
        );
        let stage = GlossaryDiscoveryStage::new(capabilities(generator));
        let ctx = node_context(store.clone(), id, DagNode::GlossaryDiscovery);
        let report = stage.execute(&ctx).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 2);

        let again = stage.execute(&ctx).await.unwrap();
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_term_is_failed_with_last_error() {
        let (store, id) = seeded_store(Some(orders_users_schema())).await;
        store
            .commit(id, |state| {
                let fields = GlossaryFields {
                    definition: "Sum of order totals".to_string(),
                    ..Default::default()
                };
                state.put_glossary_term(GlossaryTerm::new(id, "Revenue", fields));
                Ok(())
            })
            .await
            .unwrap();

        let generator = ScriptedGenerator::new().on("Revenue", r#"{"sql": "SELECT SUM(amount) FROM orders"}"#);
        let stage = GlossaryEnrichmentStage::new(capabilities(generator));
        let mut ctx = node_context(store.clone(), id, DagNode::GlossaryEnrichment);
        ctx.settings = PipelineConfig {
            max_item_failure_ratio: 1.0,
            ..Default::default()
        };

        let report = stage.execute(&ctx).await.unwrap();
        assert_eq!(report.failed, 1);

        store
            .read(id, |state| {
                let term = state.glossary_term("Revenue").unwrap();
                assert_eq!(term.enrichment, EnrichmentStatus::Failed);
                assert_eq!(term.attempt_count, 3);
                assert!(term.last_error.as_deref().unwrap_or_default().contains("amount"));
                assert!(term.fields.sql_pattern.is_none());
                assert!(state.changes().is_empty());
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_sql_returns_term_to_the_queue() {
        let (store, id) = seeded_store(Some(orders_users_schema())).await;
        store
            .commit(id, |state| {
                let fields = GlossaryFields {
                    definition: "Sum of order totals".to_string(),
                    ..Default::default()
                };
                state.put_glossary_term(GlossaryTerm::new(id, "Revenue", fields));
                Ok(())
            })
            .await
            .unwrap();

        let generator = ScriptedGenerator::new().on("Revenue", r#"{"sql": "SELECT SUM(total) FROM orders"}"#);
        let stage = GlossaryEnrichmentStage::new(capabilities(generator));
        let ctx = node_context(store.clone(), id, DagNode::GlossaryEnrichment);
        assert_eq!(stage.execute(&ctx).await.unwrap().processed, 1);

        let ledger = ChangeLedger::new(store.clone());
        let staged = ledger.list(id, Some(ChangeStatus::Pending)).await.unwrap();
        assert_eq!(staged.len(), 1);
        ledger.reject(id, staged[0].id, None).await.unwrap();

        let (enrichment, sql) = store
            .read(id, |state| {
                let term = state.glossary_term("Revenue").unwrap();
                (term.enrichment, term.fields.sql_pattern.clone())
            })
            .await
            .unwrap();
        assert_eq!(enrichment, EnrichmentStatus::Pending);
        assert!(sql.is_none());

        let rerun = stage.execute(&ctx).await.unwrap();
        assert_eq!(rerun.processed, 1);
    }

    #[tokio::test]
    async fn test_missing_validator_is_config_error() {
        let (store, id) = seeded_store(Some(orders_users_schema())).await;
        let stage = GlossaryEnrichmentStage::new(Capabilities {
            generator: Some(Arc::new(ScriptedGenerator::new())),
            ..Default::default()
        });
        let err = stage
            .execute(&node_context(store, id, DagNode::GlossaryEnrichment))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
