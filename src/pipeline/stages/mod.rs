//! Node executors for the extraction DAG
//!
//! Discovery stages are deterministic passes over the captured schema.
//! Enrichment stages fan generation calls out under the node's worker pool and
//! record every result through the change ledger.

mod capture;
mod columns;
mod entities;
mod finalize;
mod glossary;
mod relationships;

pub use capture::SchemaCaptureStage;
pub use columns::ColumnEnrichmentStage;
pub use entities::{EntityDiscoveryStage, EntityEnrichmentStage};
pub use finalize::FinalizationStage;
pub use glossary::{GlossaryDiscoveryStage, GlossaryEnrichmentStage};
pub use relationships::{RelationshipDiscoveryStage, RelationshipEnrichmentStage};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::AppError;
use crate::generation::{parse_structured, Generator};
use crate::introspection::SchemaSource;
use crate::pipeline::context::NodeContext;
use crate::pipeline::orchestrator::ExecutorRegistry;
use crate::pipeline::types::NodeReport;
use crate::simulation::SqlValidator;

/// External collaborators the stages call. Any of them may be unconfigured;
/// the stages that need a missing one fail with a configuration error.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub schema_source: Option<Arc<dyn SchemaSource>>,
    pub generator: Option<Arc<dyn Generator>>,
    pub validator: Option<Arc<dyn SqlValidator>>,
}

fn require<T: ?Sized>(capability: &Option<Arc<T>>, name: &str) -> Result<Arc<T>, AppError> {
    capability
        .clone()
        .ok_or_else(|| AppError::Config(format!("{} is not configured", name)))
}

impl Capabilities {
    pub fn schema_source(&self) -> Result<Arc<dyn SchemaSource>, AppError> {
        require(&self.schema_source, "schema source")
    }

    pub fn generator(&self) -> Result<Arc<dyn Generator>, AppError> {
        require(&self.generator, "generator")
    }

    pub fn validator(&self) -> Result<Arc<dyn SqlValidator>, AppError> {
        require(&self.validator, "SQL validator")
    }
}

/// Every node bound to its stage
pub fn default_registry(capabilities: &Capabilities) -> ExecutorRegistry {
    ExecutorRegistry::new()
        .register(Arc::new(SchemaCaptureStage::new(capabilities.clone())))
        .register(Arc::new(EntityDiscoveryStage))
        .register(Arc::new(EntityEnrichmentStage::new(capabilities.clone())))
        .register(Arc::new(RelationshipDiscoveryStage))
        .register(Arc::new(RelationshipEnrichmentStage::new(capabilities.clone())))
        .register(Arc::new(ColumnEnrichmentStage::new(capabilities.clone())))
        .register(Arc::new(GlossaryDiscoveryStage::new(capabilities.clone())))
        .register(Arc::new(GlossaryEnrichmentStage::new(capabilities.clone())))
        .register(Arc::new(FinalizationStage::new(capabilities.clone())))
}

/// Result of enriching one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Enriched,
    Failed,
}

/// Generate and decode one structured reply. Generation failures come back as
/// `Ok(Err(reason))` so the caller can mark the item failed; cancellation and
/// everything else propagate.
async fn generate_structured<T: DeserializeOwned>(
    ctx: &NodeContext,
    generator: &dyn Generator,
    prompt: &str,
) -> Result<Result<T, String>, AppError> {
    let outcome = match ctx.generate(generator, prompt).await {
        Ok(raw) => parse_structured::<T>(&raw),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(reply) => Ok(Ok(reply)),
        Err(AppError::Generation(reason)) => Ok(Err(reason)),
        Err(e) => Err(e),
    }
}

/// Fold per-item results into a report, failing the node on non-generation
/// errors or too many item failures
fn tally(ctx: &NodeContext, noun: &str, results: Vec<Result<ItemOutcome, AppError>>) -> Result<NodeReport, AppError> {
    let total = results.len();
    let mut report = NodeReport::default();
    let mut mismatches = 0usize;

    for result in results {
        match result {
            Ok(ItemOutcome::Enriched) => report.processed += 1,
            Ok(ItemOutcome::Failed) => report.failed += 1,
            Err(AppError::SchemaMismatch(reason)) => {
                mismatches += 1;
                report.failed += 1;
                warn!(node = %ctx.node, %reason, "Object refers to a location missing from the snapshot");
            }
            Err(e) => return Err(e),
        }
    }

    if mismatches > 1 {
        warn!(
            node = %ctx.node,
            mismatches,
            "Repeated schema mismatches; the captured snapshot is probably stale"
        );
    }

    ctx.check_failure_ratio(report.failed, total)?;
    report.message = format!("{} {} enriched, {} failed", report.processed, noun, report.failed);
    Ok(report)
}
