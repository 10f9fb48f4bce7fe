//! Finalization - domain summary over the enriched model

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::Capabilities;
use crate::error::AppError;
use crate::generation::{parse_structured, prompts};
use crate::ledger::record_staged;
use crate::models::{ChangeDiff, DomainSummary, Entity, GlossaryTerm, Relationship};
use crate::pipeline::context::NodeContext;
use crate::pipeline::orchestrator::NodeExecutor;
use crate::pipeline::types::{DagNode, NodeReport};

#[derive(Debug, Deserialize)]
struct SummaryReply {
    summary: String,
    #[serde(default)]
    domains: Vec<String>,
}

pub struct FinalizationStage {
    capabilities: Capabilities,
}

impl FinalizationStage {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }
}

#[async_trait]
impl NodeExecutor for FinalizationStage {
    fn node(&self) -> DagNode {
        DagNode::Finalization
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let generator = self.capabilities.generator()?;
        let (entities, relationships, terms): (Vec<Entity>, Vec<Relationship>, Vec<GlossaryTerm>) = ctx
            .store
            .read(ctx.ontology_id, |state| {
                (
                    state.entities().filter(|e| e.is_active()).cloned().collect(),
                    state.relationships().filter(|r| r.is_active()).cloned().collect(),
                    state.glossary().filter(|t| t.is_active()).cloned().collect(),
                )
            })
            .await?;

        let prompt = prompts::finalization_prompt(
            &entities.iter().collect::<Vec<_>>(),
            &relationships.iter().collect::<Vec<_>>(),
            &terms.iter().collect::<Vec<_>>(),
        );
        let raw = ctx.generate(generator.as_ref(), &prompt).await?;
        let reply: SummaryReply = parse_structured(&raw)?;
        if reply.summary.trim().is_empty() {
            return Err(AppError::Generation("empty domain summary".to_string()));
        }

        let after = DomainSummary {
            summary: reply.summary.trim().to_string(),
            domains: reply.domains,
            entity_count: entities.len(),
            relationship_count: relationships.len(),
            glossary_count: terms.len(),
        };
        let node = ctx.node;
        ctx.store
            .commit(ctx.ontology_id, |state| {
                let before = state.ontology().domain_summary.clone();
                record_staged(state, ChangeDiff::SetDomainSummary { before, after }, node)?;
                Ok(())
            })
            .await?;

        info!(
            ontology_id = %ctx.ontology_id,
            entities = entities.len(),
            relationships = relationships.len(),
            terms = terms.len(),
            "Domain summary staged"
        );
        Ok(NodeReport {
            processed: 1,
            message: format!(
                "summarized {} entities, {} relationship rows and {} glossary terms",
                entities.len(),
                relationships.len(),
                terms.len()
            ),
            ..Default::default()
        })
    }
}
