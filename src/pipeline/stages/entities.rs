//! Entity discovery and enrichment

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{generate_structured, tally, Capabilities, ItemOutcome};
use crate::error::AppError;
use crate::generation::{prompts, Generator};
use crate::introspection::{SchemaSnapshot, Table};
use crate::ledger::record_staged;
use crate::models::{
    entity_name_for_table, pascal_case, ChangeDiff, EnrichmentStatus, Entity, EntityFields, QuestionCategory, QuestionDraft,
};
use crate::pipeline::context::NodeContext;
use crate::pipeline::orchestrator::NodeExecutor;
use crate::pipeline::types::{DagNode, NodeReport};
use crate::questions::raise_in;

/// Confidence for an entity anchored on an `id` column that is not a declared key
const UNDECLARED_KEY_CONFIDENCE: f64 = 0.6;

/// What a table contributes to discovery
#[derive(Debug)]
enum TableShape<'a> {
    Keyed { column: &'a str, confidence: f64 },
    Junction,
    CompositeKey(Vec<&'a str>),
    NoKey,
}

fn table_shape<'a>(snapshot: &SchemaSnapshot, table: &'a Table) -> TableShape<'a> {
    let key = table.primary_key_columns();
    match key.as_slice() {
        [single] => TableShape::Keyed {
            column: single.name.as_str(),
            confidence: 1.0,
        },
        [] => match table.column("id") {
            Some(id) => TableShape::Keyed {
                column: id.name.as_str(),
                confidence: UNDECLARED_KEY_CONFIDENCE,
            },
            None => TableShape::NoKey,
        },
        columns => {
            let fk_columns: HashSet<&str> = snapshot
                .foreign_keys_from(&table.schema, &table.name)
                .flat_map(|fk| fk.source_columns.iter().map(String::as_str))
                .collect();
            if columns.iter().all(|c| fk_columns.contains(c.name.as_str())) {
                TableShape::Junction
            } else {
                TableShape::CompositeKey(columns.iter().map(|c| c.name.as_str()).collect())
            }
        }
    }
}

/// Rungs tried in order until a table's entity name is unique
const NAMING_RUNGS: usize = 3;

fn name_candidate(table: &Table, rung: usize, index: usize) -> String {
    let qualified = format!("{}_{}", table.schema, table.name);
    match rung {
        0 => entity_name_for_table(&table.name),
        1 => entity_name_for_table(&qualified),
        2 => pascal_case(&qualified),
        _ => format!("{}{}", pascal_case(&qualified), index + 1),
    }
}

/// Unique entity names for `tables`, in order. A name shared by several
/// tables, or `occupied` by an entity anchored elsewhere, moves every table
/// holding it one rung down the ladder.
fn plan_entity_names(tables: &[&Table], occupied: impl Fn(&str) -> bool) -> Vec<String> {
    let mut rungs = vec![0usize; tables.len()];
    let mut names: Vec<String> = tables.iter().map(|t| name_candidate(t, 0, 0)).collect();
    loop {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for name in &names {
            *counts.entry(name.as_str()).or_default() += 1;
        }
        let clashing: Vec<usize> = (0..tables.len())
            .filter(|&i| rungs[i] < NAMING_RUNGS && (counts[names[i].as_str()] > 1 || occupied(&names[i])))
            .collect();
        if clashing.is_empty() {
            return names;
        }
        for i in clashing {
            rungs[i] += 1;
            names[i] = name_candidate(tables[i], rungs[i], i);
        }
    }
}

/// One entity per keyed table. Deterministic; no generation.
pub struct EntityDiscoveryStage;

#[async_trait]
impl NodeExecutor for EntityDiscoveryStage {
    fn node(&self) -> DagNode {
        DagNode::EntityDiscovery
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let snapshot = ctx.snapshot().await?;
        let node = self.node();

        let report = ctx
            .store
            .commit(ctx.ontology_id, |state| {
                let mut report = NodeReport::default();
                let mut keyed: Vec<(&Table, &str, f64)> = Vec::new();

                for table in &snapshot.tables {
                    match table_shape(&snapshot, table) {
                        TableShape::Keyed { column, confidence } => {
                            // Any entity on this table, rejected ones included, settles it
                            let anchored = state.entities().any(|e| {
                                e.primary_location.schema == table.schema && e.primary_location.table == table.name
                            });
                            if anchored {
                                report.skipped += 1;
                            } else {
                                keyed.push((table, column, confidence));
                            }
                        }
                        TableShape::Junction => {
                            debug!(table = %table.path(), "Junction table, no entity");
                            report.skipped += 1;
                        }
                        TableShape::CompositeKey(columns) => {
                            raise_in(
                                state,
                                QuestionDraft::new(
                                    format!("table:{}", table.path()),
                                    format!(
                                        "Table {} has a composite key ({}). Which business concept does one row represent?",
                                        table.path(),
                                        columns.join(", ")
                                    ),
                                    QuestionCategory::Terminology,
                                )
                                .priority(2)
                                .raised_by(node),
                            )?;
                            report.skipped += 1;
                        }
                        TableShape::NoKey => {
                            debug!(table = %table.path(), "Table has no usable key");
                            report.skipped += 1;
                        }
                    }
                }

                let tables: Vec<&Table> = keyed.iter().map(|(table, _, _)| *table).collect();
                let names = plan_entity_names(&tables, |name| state.entity(name).is_some());

                for ((table, column, confidence), name) in keyed.iter().zip(names) {
                    let source = format!("table:{}", table.path());
                    let base = entity_name_for_table(&table.name);
                    if name != base {
                        let sharing: Vec<String> = tables
                            .iter()
                            .filter(|other| entity_name_for_table(&other.name) == base)
                            .map(|other| other.path())
                            .collect();
                        let reason = if sharing.len() > 1 {
                            format!("Tables {} all map to {}", sharing.join(", "), base)
                        } else {
                            format!("Another entity is already named {}", base)
                        };
                        raise_in(
                            state,
                            QuestionDraft::new(
                                source.clone(),
                                format!("{}; {} was named {}. Is that the right name?", reason, table.path(), name),
                                QuestionCategory::Terminology,
                            )
                            .raised_by(node),
                        )?;
                    }
                    if *confidence < 1.0 {
                        raise_in(
                            state,
                            QuestionDraft::new(
                                source,
                                format!(
                                    "Table {} declares no primary key. Does {} uniquely identify each row?",
                                    table.path(),
                                    column
                                ),
                                QuestionCategory::DataQuality,
                            )
                            .priority(2)
                            .raised_by(node),
                        )?;
                    }

                    let entity = Entity::new(ctx.ontology_id, name, table.location(column)).with_confidence(*confidence);
                    if record_staged(state, ChangeDiff::CreateEntity { entity }, node)?.is_some() {
                        report.processed += 1;
                    }
                }
                Ok(report)
            })
            .await?;

        info!(
            ontology_id = %ctx.ontology_id,
            created = report.processed,
            skipped = report.skipped,
            "Entity discovery finished"
        );
        Ok(NodeReport {
            message: format!("{} entities discovered, {} tables skipped", report.processed, report.skipped),
            ..report
        })
    }
}

#[derive(Debug, Deserialize)]
struct EntityReply {
    description: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default = "full_confidence")]
    confidence: f64,
    #[serde(default)]
    ambiguity: Option<String>,
}

fn full_confidence() -> f64 {
    1.0
}

/// Description and aliases for each entity not yet enriched
pub struct EntityEnrichmentStage {
    capabilities: Capabilities,
}

impl EntityEnrichmentStage {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    async fn enrich(
        &self,
        ctx: &NodeContext,
        generator: &dyn Generator,
        snapshot: &SchemaSnapshot,
        entity: Entity,
    ) -> Result<ItemOutcome, AppError> {
        let location = &entity.primary_location;
        let table = snapshot.table(&location.schema, &location.table);
        let prompt = prompts::entity_prompt(&entity, table);

        let reply = match generate_structured::<EntityReply>(ctx, generator, &prompt).await? {
            Ok(reply) => reply,
            Err(reason) => {
                debug!(entity = %entity.name, %reason, "Entity enrichment failed");
                ctx.store
                    .commit(ctx.ontology_id, |state| {
                        if let Some(current) = state.entity_mut(&entity.name) {
                            current.enrichment = EnrichmentStatus::Failed;
                        }
                        Ok(())
                    })
                    .await?;
                return Ok(ItemOutcome::Failed);
            }
        };

        let threshold = ctx.settings.question_confidence_threshold;
        let node = ctx.node;
        ctx.store
            .commit(ctx.ontology_id, |state| {
                let Some(current) = state.entity(&entity.name).cloned() else {
                    return Ok(ItemOutcome::Failed);
                };
                snapshot.require_location(&current.primary_location)?;

                let before = current.fields();
                let after = EntityFields {
                    description: Some(reply.description.trim().to_string()),
                    aliases: reply.aliases.clone(),
                    primary_location: before.primary_location.clone(),
                };
                let recorded = record_staged(
                    state,
                    ChangeDiff::UpdateEntity {
                        name: current.name.clone(),
                        before: Some(before),
                        after,
                    },
                    node,
                )?;
                if recorded.is_none() {
                    if let Some(entity) = state.entity_mut(&current.name) {
                        entity.enrichment = EnrichmentStatus::Enriched;
                    }
                }

                let doubt = reply.ambiguity.as_deref().map(str::trim).filter(|a| !a.is_empty());
                if doubt.is_some() || reply.confidence < threshold {
                    let prompt = match doubt {
                        Some(ambiguity) => format!("{}: {}", current.name, ambiguity),
                        None => format!(
                            "Is {} correctly described as \"{}\"?",
                            current.name,
                            reply.description.trim()
                        ),
                    };
                    raise_in(
                        state,
                        QuestionDraft::new(format!("entity:{}", current.name), prompt, QuestionCategory::Terminology)
                            .raised_by(node),
                    )?;
                }
                Ok(ItemOutcome::Enriched)
            })
            .await
    }
}

#[async_trait]
impl NodeExecutor for EntityEnrichmentStage {
    fn node(&self) -> DagNode {
        DagNode::EntityEnrichment
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let generator: Arc<dyn Generator> = self.capabilities.generator()?;
        let snapshot = ctx.snapshot().await?;
        let pending: Vec<Entity> = ctx
            .store
            .read(ctx.ontology_id, |state| {
                state
                    .entities()
                    .filter(|e| e.is_active() && e.enrichment != EnrichmentStatus::Enriched)
                    .cloned()
                    .collect()
            })
            .await?;

        let results = ctx
            .for_each_bounded(pending, |entity| self.enrich(ctx, generator.as_ref(), &snapshot, entity))
            .await?;
        tally(ctx, "entities", results)
    }
}
