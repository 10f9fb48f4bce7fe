//! Relationship discovery and enrichment
//!
//! Every candidate is written as a forward row plus its mirror. Labels are
//! generated per direction, so `Order -> User` and `User -> Order` can read
//! `placed_by` and `places`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{generate_structured, tally, Capabilities, ItemOutcome};
use crate::error::AppError;
use crate::generation::{prompts, Generator};
use crate::introspection::SchemaSnapshot;
use crate::ledger::record_staged;
use crate::models::{
    entity_name_for_table, snake_case, Cardinality, ChangeDiff, ColumnLocation, DiscoveryMethod, EnrichmentStatus,
    Entity, QuestionCategory, QuestionDraft, Relationship, RelationshipAnnotation,
};
use crate::pipeline::context::NodeContext;
use crate::pipeline::orchestrator::NodeExecutor;
use crate::pipeline::types::{DagNode, NodeReport};
use crate::questions::raise_in;
use crate::store::OntologyState;

/// Confidence for a relationship inferred from a `<stem>_id` column name
const NAME_MATCH_CONFIDENCE: f64 = 0.7;

/// A proposed forward row
struct Candidate {
    source: String,
    target: String,
    source_location: ColumnLocation,
    target_location: ColumnLocation,
    cardinality: Cardinality,
    method: DiscoveryMethod,
    confidence: f64,
}

/// Unresolved finding that becomes a question
struct Doubt {
    source: String,
    prompt: String,
}

fn foreign_key_candidates(
    state: &OntologyState,
    snapshot: &SchemaSnapshot,
    candidates: &mut Vec<Candidate>,
    doubts: &mut Vec<Doubt>,
) {
    for fk in &snapshot.foreign_keys {
        if fk.source_columns.len() != 1 || fk.referenced_columns.len() != 1 {
            doubts.push(Doubt {
                source: format!("constraint:{}.{}", fk.source_schema, fk.constraint_name),
                prompt: format!(
                    "{}.{}({}) references {}.{}({}) through a composite key. Which business relationship does it express?",
                    fk.source_schema,
                    fk.source_table,
                    fk.source_columns.join(", "),
                    fk.referenced_schema,
                    fk.referenced_table,
                    fk.referenced_columns.join(", ")
                ),
            });
            continue;
        }

        let (Some(source), Some(target)) = (
            state.entity_for_table(&fk.source_schema, &fk.source_table),
            state.entity_for_table(&fk.referenced_schema, &fk.referenced_table),
        ) else {
            debug!(constraint = %fk.constraint_name, "Foreign key between tables without entities");
            continue;
        };

        let column = &fk.source_columns[0];
        let unique = snapshot
            .table(&fk.source_schema, &fk.source_table)
            .and_then(|t| t.column(column))
            .is_some_and(|c| c.is_unique || c.is_primary_key);

        candidates.push(Candidate {
            source: source.name.clone(),
            target: target.name.clone(),
            source_location: ColumnLocation::new(&fk.source_schema, &fk.source_table, column),
            target_location: ColumnLocation::new(&fk.referenced_schema, &fk.referenced_table, &fk.referenced_columns[0]),
            cardinality: if unique { Cardinality::OneToOne } else { Cardinality::ManyToOne },
            method: DiscoveryMethod::ForeignKey,
            confidence: 1.0,
        });
    }
}

/// `<stem>_id` columns not covered by a declared foreign key
fn name_match_candidates(
    state: &OntologyState,
    snapshot: &SchemaSnapshot,
    candidates: &mut Vec<Candidate>,
    doubts: &mut Vec<Doubt>,
) {
    let covered: HashSet<ColumnLocation> = candidates.iter().map(|c| c.source_location.clone()).collect();
    let entities: Vec<&Entity> = state.entities().filter(|e| e.is_active()).collect();

    for table in &snapshot.tables {
        let Some(owner) = state.entity_for_table(&table.schema, &table.name) else {
            continue;
        };
        for column in &table.columns {
            let location = table.location(&column.name);
            if column.is_primary_key || covered.contains(&location) {
                continue;
            }
            let lowered = column.name.to_lowercase();
            let Some(stem) = lowered.strip_suffix("_id").filter(|s| !s.is_empty()) else {
                continue;
            };

            let stem_entity = entity_name_for_table(stem);
            let matches: Vec<&&Entity> = entities
                .iter()
                .filter(|e| e.name == stem_entity || e.primary_location.table.eq_ignore_ascii_case(stem))
                .collect();

            match matches.as_slice() {
                [] => {}
                [target] => {
                    let Some(target_column) = snapshot.column(&target.primary_location) else {
                        continue;
                    };
                    if target_column.type_family() != column.type_family() {
                        doubts.push(Doubt {
                            source: format!("column:{}", location),
                            prompt: format!(
                                "{} ({}) looks like a reference to {} but {} is {}. Is it a relationship?",
                                location, column.data_type, target.name, target.primary_location, target_column.data_type
                            ),
                        });
                        continue;
                    }
                    candidates.push(Candidate {
                        source: owner.name.clone(),
                        target: target.name.clone(),
                        source_location: location,
                        target_location: target.primary_location.clone(),
                        cardinality: Cardinality::ManyToOne,
                        method: DiscoveryMethod::NameMatch,
                        confidence: NAME_MATCH_CONFIDENCE,
                    });
                }
                several => {
                    let names: Vec<&str> = several.iter().map(|e| e.name.as_str()).collect();
                    doubts.push(Doubt {
                        source: format!("column:{}", location),
                        prompt: format!("Which entity does {} refer to: {}?", location, names.join(" or ")),
                    });
                }
            }
        }
    }
}

/// Foreign keys and name-matched reference columns between entity tables.
/// Deterministic; no generation.
pub struct RelationshipDiscoveryStage;

#[async_trait]
impl NodeExecutor for RelationshipDiscoveryStage {
    fn node(&self) -> DagNode {
        DagNode::RelationshipDiscovery
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let snapshot = ctx.snapshot().await?;
        let node = self.node();

        let report = ctx
            .store
            .commit(ctx.ontology_id, |state| {
                let mut candidates = Vec::new();
                let mut doubts = Vec::new();
                foreign_key_candidates(state, &snapshot, &mut candidates, &mut doubts);
                name_match_candidates(state, &snapshot, &mut candidates, &mut doubts);

                for doubt in doubts {
                    raise_in(
                        state,
                        QuestionDraft::new(doubt.source, doubt.prompt, QuestionCategory::Relationship)
                            .priority(2)
                            .raised_by(node),
                    )?;
                }

                let mut report = NodeReport::default();
                for candidate in candidates {
                    let forward = Relationship::new(
                        ctx.ontology_id,
                        candidate.source,
                        candidate.target,
                        candidate.source_location,
                        candidate.target_location,
                        candidate.cardinality,
                        candidate.method,
                    )
                    .with_confidence(candidate.confidence);
                    let key = forward.key();

                    // Complete a half-written pair instead of duplicating it
                    let existing_forward = state.relationship(&key).cloned();
                    let existing_reverse = state.relationship(&key.reversed()).cloned();
                    if existing_forward.is_some() && existing_reverse.is_some() {
                        report.skipped += 1;
                        continue;
                    }
                    let forward = existing_forward.unwrap_or(forward);
                    let reverse = existing_reverse.unwrap_or_else(|| forward.mirror());

                    let self_reference = forward.is_self_reference();
                    if record_staged(state, ChangeDiff::CreateRelationshipPair { forward, reverse }, node)?.is_some() {
                        debug!(pair = %key, self_reference, "Relationship pair staged");
                        report.processed += 1;
                    }
                }
                Ok(report)
            })
            .await?;

        info!(
            ontology_id = %ctx.ontology_id,
            pairs = report.processed,
            skipped = report.skipped,
            "Relationship discovery finished"
        );
        Ok(NodeReport {
            message: format!("{} relationship pairs discovered", report.processed),
            ..report
        })
    }
}

#[derive(Debug, Deserialize)]
struct RelationshipReply {
    association: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "full_confidence")]
    confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

/// Association label and description per row and direction
pub struct RelationshipEnrichmentStage {
    capabilities: Capabilities,
}

impl RelationshipEnrichmentStage {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    async fn enrich(
        &self,
        ctx: &NodeContext,
        generator: &dyn Generator,
        snapshot: &SchemaSnapshot,
        row: Relationship,
    ) -> Result<ItemOutcome, AppError> {
        let source = snapshot.table(&row.source_location.schema, &row.source_location.table);
        let target = snapshot.table(&row.target_location.schema, &row.target_location.table);
        let prompt = prompts::relationship_prompt(&row, source, target);
        let key = row.key();

        let reply = match generate_structured::<RelationshipReply>(ctx, generator, &prompt).await? {
            Ok(reply) => reply,
            Err(reason) => {
                debug!(relationship = %key, %reason, "Relationship enrichment failed");
                ctx.store
                    .commit(ctx.ontology_id, |state| {
                        if let Some(current) = state.relationship_mut(&key) {
                            current.enrichment = EnrichmentStatus::Failed;
                        }
                        Ok(())
                    })
                    .await?;
                return Ok(ItemOutcome::Failed);
            }
        };

        let association = snake_case(reply.association.trim()).replace([' ', '-'], "_");
        let threshold = ctx.settings.question_confidence_threshold;
        let node = ctx.node;
        ctx.store
            .commit(ctx.ontology_id, |state| {
                let Some(current) = state.relationship(&key).cloned() else {
                    return Ok(ItemOutcome::Failed);
                };
                snapshot.require_location(&current.source_location)?;
                snapshot.require_location(&current.target_location)?;

                let after = RelationshipAnnotation {
                    association: Some(association.clone()),
                    description: reply.description.clone(),
                };
                let recorded = record_staged(
                    state,
                    ChangeDiff::AnnotateRelationship {
                        key: key.clone(),
                        before: Some(current.annotation()),
                        after,
                    },
                    node,
                )?;
                if recorded.is_none() {
                    if let Some(row) = state.relationship_mut(&key) {
                        row.enrichment = EnrichmentStatus::Enriched;
                    }
                }

                if reply.confidence < threshold {
                    raise_in(
                        state,
                        QuestionDraft::new(
                            format!("relationship:{}", key),
                            format!(
                                "Does {} {} {} (via {})?",
                                current.source_entity, association, current.target_entity, current.source_location
                            ),
                            QuestionCategory::Relationship,
                        )
                        .raised_by(node),
                    )?;
                }
                Ok(ItemOutcome::Enriched)
            })
            .await
    }
}

#[async_trait]
impl NodeExecutor for RelationshipEnrichmentStage {
    fn node(&self) -> DagNode {
        DagNode::RelationshipEnrichment
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let generator: Arc<dyn Generator> = self.capabilities.generator()?;
        let snapshot = ctx.snapshot().await?;
        let pending: Vec<Relationship> = ctx
            .store
            .read(ctx.ontology_id, |state| {
                state
                    .relationships()
                    .filter(|r| r.is_active() && r.enrichment != EnrichmentStatus::Enriched)
                    .cloned()
                    .collect()
            })
            .await?;

        let results = ctx
            .for_each_bounded(pending, |row| self.enrich(ctx, generator.as_ref(), &snapshot, row))
            .await?;
        tally(ctx, "relationship rows", results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{ForeignKey, Table};
    use crate::ledger::ChangeLedger;
    use crate::models::{ChangeStatus, ReviewState};
    use crate::occurrence::{occurrences_for, OccurrenceKind};
    use crate::pipeline::stages::EntityDiscoveryStage;
    use crate::store::OntologyStore;
    use crate::testing::{column, foreign_key, node_context, orders_users_schema, seeded_store, table, ScriptedGenerator};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    async fn discovered(tables: Vec<Table>, fks: Vec<ForeignKey>) -> (Arc<OntologyStore>, Uuid) {
        let (store, id) = seeded_store(Some((tables, fks))).await;
        EntityDiscoveryStage
            .execute(&node_context(store.clone(), id, DagNode::EntityDiscovery))
            .await
            .unwrap();
        RelationshipDiscoveryStage
            .execute(&node_context(store.clone(), id, DagNode::RelationshipDiscovery))
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_foreign_key_produces_mirrored_pair() {
        let (tables, fks) = orders_users_schema();
        let (store, id) = discovered(tables, fks).await;

        store
            .read(id, |state| {
                let rows: Vec<&Relationship> = state.relationships().collect();
                assert_eq!(rows.len(), 2);
                let forward = rows.iter().find(|r| r.source_entity == "Order").unwrap();
                assert_eq!(forward.cardinality, Cardinality::ManyToOne);
                assert_eq!(forward.source_location.to_string(), "public.orders.user_id");
                assert_eq!(forward.association, None);
                let pair = state.pair(&forward.key());
                assert!(pair.is_complete());
                assert_eq!(pair.reverse.unwrap().cardinality, Cardinality::OneToMany);
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_occurrences_exist_before_enrichment() {
        let (tables, fks) = orders_users_schema();
        let (store, id) = discovered(tables, fks).await;

        store
            .read(id, |state| {
                let users = occurrences_for(state, "User").unwrap();
                assert_eq!(users.len(), 2);
                assert_eq!(users[0].kind, OccurrenceKind::Primary);
                assert_eq!(users[0].location.to_string(), "public.users.id");
                assert_eq!(users[1].kind, OccurrenceKind::Reference);
                assert_eq!(users[1].location.to_string(), "public.orders.user_id");
                assert_eq!(users[1].role, None);
                assert_eq!(users[1].review, ReviewState::Staged);

                let orders = occurrences_for(state, "Order").unwrap();
                assert_eq!(orders.len(), 2);
                assert_eq!(orders[1].location.to_string(), "public.users.id");
                assert_eq!(orders[1].role, None);
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_half_written_pair_is_completed() {
        let (tables, fks) = orders_users_schema();
        let (store, id) = discovered(tables, fks).await;

        let reverse_key = store
            .commit(id, |state| {
                let reverse = state.relationships().find(|r| r.source_entity == "User").unwrap().key();
                state.remove_relationship(&reverse);
                Ok(reverse)
            })
            .await
            .unwrap();

        RelationshipDiscoveryStage
            .execute(&node_context(store.clone(), id, DagNode::RelationshipDiscovery))
            .await
            .unwrap();

        let rows = store
            .read(id, |state| {
                assert!(state.relationship(&reverse_key).is_some());
                state.relationships().count()
            })
            .await
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_self_reference_is_one_pair() {
        let tables = vec![table(
            "employees",
            vec![column("id", "integer", true), column("manager_id", "integer", false)],
        )];
        let fks = vec![foreign_key("employees", "manager_id", "employees", "id")];
        let (store, id) = discovered(tables, fks).await;

        let rows = store.read(id, |state| state.relationships().count()).await.unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_name_match_and_type_mismatch() {
        let tables = vec![
            table("customers", vec![column("id", "integer", true)]),
            table("products", vec![column("id", "uuid", true)]),
            table(
                "invoices",
                vec![
                    column("id", "integer", true),
                    column("customer_id", "integer", false),
                    column("product_id", "integer", false),
                ],
            ),
        ];
        let (store, id) = discovered(tables, Vec::new()).await;

        store
            .read(id, |state| {
                let forward = state
                    .relationships()
                    .find(|r| r.source_entity == "Invoice")
                    .unwrap();
                assert_eq!(forward.target_entity, "Customer");
                assert_eq!(forward.method, DiscoveryMethod::NameMatch);
                assert_eq!(forward.confidence, NAME_MATCH_CONFIDENCE);
                assert_eq!(state.relationships().count(), 2);

                let questions: Vec<&str> = state.questions().map(|q| q.source.as_str()).collect();
                assert_eq!(questions, vec!["column:public.invoices.product_id"]);
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enrichment_labels_each_direction() {
        let (tables, fks) = orders_users_schema();
        let (store, id) = discovered(tables, fks).await;

        let generator = ScriptedGenerator::new()
            .on("Order relates to User", r#"{"association": "placed by", "description": "Buyer", "confidence": 0.9}"#)
            .on("User relates to Order", r#"{"association": "places", "confidence": 0.3}"#);
        let stage = RelationshipEnrichmentStage::new(Capabilities {
            generator: Some(Arc::new(generator)),
            ..Default::default()
        });
        let report = stage
            .execute(&node_context(store.clone(), id, DagNode::RelationshipEnrichment))
            .await
            .unwrap();
        assert_eq!(report.processed, 2);

        store
            .read(id, |state| {
                let labels: Vec<(String, Option<String>)> = {
                    let mut rows: Vec<_> = state
                        .relationships()
                        .map(|r| (r.source_entity.clone(), r.association.clone()))
                        .collect();
                    rows.sort();
                    rows
                };
                assert_eq!(
                    labels,
                    vec![
                        ("Order".to_string(), Some("placed_by".to_string())),
                        ("User".to_string(), Some("places".to_string())),
                    ]
                );
                assert_eq!(state.questions().count(), 1);
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_label_returns_row_to_the_queue() {
        let (tables, fks) = orders_users_schema();
        let (store, id) = discovered(tables, fks).await;

        let generator = ScriptedGenerator::new()
            .on("Order relates to User", r#"{"association": "placed by", "confidence": 0.9}"#)
            .on("User relates to Order", r#"{"association": "places", "confidence": 0.9}"#);
        let stage = RelationshipEnrichmentStage::new(Capabilities {
            generator: Some(Arc::new(generator)),
            ..Default::default()
        });
        stage
            .execute(&node_context(store.clone(), id, DagNode::RelationshipEnrichment))
            .await
            .unwrap();

        let ledger = ChangeLedger::new(store.clone());
        let pending = ledger.list(id, Some(ChangeStatus::Pending)).await.unwrap();
        let (change_id, key) = pending
            .iter()
            .find_map(|c| match &c.diff {
                ChangeDiff::AnnotateRelationship { key, .. } if key.source_entity == "Order" => {
                    Some((c.id, key.clone()))
                }
                _ => None,
            })
            .unwrap();
        ledger.reject(id, change_id, None).await.unwrap();

        store
            .read(id, |state| {
                let row = state.relationship(&key).unwrap();
                assert_eq!(row.association, None);
                assert_eq!(row.enrichment, EnrichmentStatus::Pending);
                let reverse = state.relationship(&key.reversed()).unwrap();
                assert_eq!(reverse.association.as_deref(), Some("places"));
            })
            .await
            .unwrap();
    }
}
