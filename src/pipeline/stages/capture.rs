//! Schema capture

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::Capabilities;
use crate::error::AppError;
use crate::introspection::detect_drift;
use crate::models::{QuestionCategory, QuestionDraft};
use crate::pipeline::context::NodeContext;
use crate::pipeline::orchestrator::NodeExecutor;
use crate::pipeline::types::{DagNode, NodeReport};
use crate::questions::raise_in;

pub struct SchemaCaptureStage {
    capabilities: Capabilities,
}

impl SchemaCaptureStage {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }
}

#[async_trait]
impl NodeExecutor for SchemaCaptureStage {
    fn node(&self) -> DagNode {
        DagNode::SchemaCapture
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError> {
        let source = self.capabilities.schema_source()?;
        let snapshot = source.capture(ctx.ontology_id).await?;
        ctx.check_cancelled()?;

        let tables = snapshot.tables.len();
        let foreign_keys = snapshot.foreign_keys.len();
        let checksum = snapshot.checksum.clone();

        // The snapshot is bookkeeping, written directly
        let drift = ctx
            .store
            .commit(ctx.ontology_id, |state| {
                let drift = state
                    .ontology()
                    .snapshot
                    .as_ref()
                    .map(|previous| detect_drift(previous, &snapshot));

                if let Some(drift) = &drift {
                    for path in &drift.removed_tables {
                        let orphaned: Vec<String> = state
                            .entities()
                            .filter(|e| e.is_active() && &e.primary_location.table_path() == path)
                            .map(|e| e.name.clone())
                            .collect();
                        for name in orphaned {
                            raise_in(
                                state,
                                QuestionDraft::new(
                                    format!("entity:{}", name),
                                    format!(
                                        "Table {} backing entity {} no longer exists. Should {} be deleted?",
                                        path, name, name
                                    ),
                                    QuestionCategory::DataQuality,
                                )
                                .priority(1)
                                .required()
                                .raised_by(DagNode::SchemaCapture),
                            )?;
                        }
                    }
                }

                let ontology = state.ontology_mut();
                ontology.snapshot = Some(snapshot);
                ontology.updated_at = Utc::now();
                Ok(drift)
            })
            .await?;

        if let Some(drift) = drift.filter(|d| d.has_drift) {
            warn!(
                ontology_id = %ctx.ontology_id,
                added_tables = drift.added_tables.len(),
                removed_tables = drift.removed_tables.len(),
                added_columns = drift.added_columns.len(),
                removed_columns = drift.removed_columns.len(),
                modified_columns = drift.modified_columns.len(),
                "Schema drifted since the last capture"
            );
        }

        info!(ontology_id = %ctx.ontology_id, tables, foreign_keys, %checksum, "Schema captured");
        Ok(NodeReport {
            processed: tables,
            message: format!("captured {} tables and {} foreign keys", tables, foreign_keys),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::introspection::{StaticSchemaSource, Table};
    use crate::models::{ColumnLocation, Entity};
    use crate::testing::{column, node_context, orders_users_schema, seeded_store, table};

    fn stage(tables: Vec<Table>) -> SchemaCaptureStage {
        SchemaCaptureStage::new(Capabilities {
            schema_source: Some(Arc::new(StaticSchemaSource::new(tables, Vec::new()))),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_capture_stores_snapshot() {
        let (store, id) = seeded_store(None).await;
        let (tables, _) = orders_users_schema();

        let ctx = node_context(store.clone(), id, DagNode::SchemaCapture);
        let report = stage(tables).execute(&ctx).await.unwrap();
        assert_eq!(report.processed, 2);

        let captured = store
            .read(id, |state| state.ontology().snapshot.as_ref().map(|s| s.tables.len()))
            .await
            .unwrap();
        assert_eq!(captured, Some(2));
    }

    #[tokio::test]
    async fn test_removed_table_raises_question_for_its_entity() {
        let (store, id) = seeded_store(None).await;
        let ctx = node_context(store.clone(), id, DagNode::SchemaCapture);
        let (tables, _) = orders_users_schema();
        stage(tables).execute(&ctx).await.unwrap();
        store
            .commit(id, |state| {
                state.put_entity(Entity::new(id, "Order", ColumnLocation::new("public", "orders", "id")));
                Ok(())
            })
            .await
            .unwrap();

        let users_only = vec![table("users", vec![column("id", "integer", true)])];
        stage(users_only).execute(&ctx).await.unwrap();

        let sources: Vec<String> = store
            .read(id, |state| state.questions().map(|q| q.source.clone()).collect())
            .await
            .unwrap();
        assert_eq!(sources, vec!["entity:Order".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_schema_source_is_config_error() {
        let (store, id) = seeded_store(None).await;
        let err = SchemaCaptureStage::new(Capabilities::default())
            .execute(&node_context(store, id, DagNode::SchemaCapture))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
