//! Execution context handed to node executors
//!
//! Carries the store, tuning, the cancellation signal and the progress
//! channel. Also hosts the bounded worker pool that fans generation calls out
//! inside a node.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::generation::Generator;
use crate::introspection::SchemaSnapshot;
use crate::pipeline::types::{DagNode, ProgressEvent};
use crate::store::OntologyStore;

/// Receiving side of a run's cancellation flag
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side, held by the orchestrator
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (handle, signal) = cancel_pair();
        std::mem::forget(handle.tx);
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling: never fires
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One generation call, bounded by a timeout and abandoned on cancellation
pub async fn generate_bounded(
    generator: &dyn Generator,
    prompt: &str,
    timeout: Duration,
    cancel: &CancelSignal,
) -> Result<String, AppError> {
    let mut cancel = cancel.clone();
    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled("run cancelled during generation".to_string())),
        result = tokio::time::timeout(timeout, generator.generate(prompt)) => match result {
            Ok(output) => output,
            Err(_) => Err(AppError::Generation(format!(
                "generation timed out after {}s",
                timeout.as_secs()
            ))),
        },
    }
}

pub struct NodeContext {
    pub ontology_id: Uuid,
    pub node: DagNode,
    pub store: Arc<OntologyStore>,
    pub settings: PipelineConfig,
    pub cancel: CancelSignal,
    pub events: broadcast::Sender<ProgressEvent>,
}

impl NodeContext {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.generation_timeout_secs)
    }

    pub fn check_cancelled(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled(format!("run cancelled before {}", self.node)));
        }
        Ok(())
    }

    pub fn progress(&self, done: usize, total: usize) {
        debug!(ontology_id = %self.ontology_id, node = %self.node, done, total, "Node progress");
        let _ = self.events.send(ProgressEvent::NodeProgress {
            ontology_id: self.ontology_id,
            node: self.node,
            done,
            total,
        });
    }

    /// The captured schema; stages after capture cannot run without it
    pub async fn snapshot(&self) -> Result<SchemaSnapshot, AppError> {
        self.store
            .read(self.ontology_id, |state| state.ontology().snapshot.clone())
            .await?
            .ok_or_else(|| AppError::Validation("schema has not been captured".to_string()))
    }

    pub async fn generate(&self, generator: &dyn Generator, prompt: &str) -> Result<String, AppError> {
        generate_bounded(generator, prompt, self.generation_timeout(), &self.cancel).await
    }

    /// Run `work` over `items` with at most `max_concurrency` in flight.
    /// Stops taking new items once cancelled; in-flight work is abandoned by
    /// its own select on the signal.
    pub async fn for_each_bounded<T, R, F, Fut>(&self, items: Vec<T>, work: F) -> Result<Vec<R>, AppError>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let total = items.len();
        let cancel = self.cancel.clone();
        let mut results = Vec::with_capacity(total);
        let mut pool = stream::iter(items)
            .take_while(move |_| futures::future::ready(!cancel.is_cancelled()))
            .map(work)
            .buffer_unordered(self.settings.max_concurrency.max(1));

        while let Some(result) = pool.next().await {
            results.push(result);
            self.progress(results.len(), total);
        }

        self.check_cancelled()?;
        Ok(results)
    }

    /// Fail the node when too many items failed
    pub fn check_failure_ratio(&self, failed: usize, total: usize) -> Result<(), AppError> {
        if total == 0 || failed == 0 {
            return Ok(());
        }
        let ratio = failed as f64 / total as f64;
        if ratio > self.settings.max_item_failure_ratio {
            return Err(AppError::Generation(format!(
                "{} of {} items failed (limit {:.0}%)",
                failed,
                total,
                self.settings.max_item_failure_ratio * 100.0
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnLocation, Entity, Ontology};
    use crate::testing::ScriptedGenerator;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Never answers
    struct StalledGenerator;

    #[async_trait]
    impl Generator for StalledGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, AppError> {
            std::future::pending().await
        }

        fn model_id(&self) -> &str {
            "stalled"
        }
    }

    async fn context(cancel: CancelSignal) -> NodeContext {
        let store = Arc::new(OntologyStore::in_memory());
        let ontology = store.create(Ontology::new("shop")).await.unwrap();
        let (events, _) = broadcast::channel(16);
        NodeContext {
            ontology_id: ontology.id,
            node: DagNode::EntityEnrichment,
            store,
            settings: PipelineConfig::default(),
            cancel,
            events,
        }
    }

    #[tokio::test]
    async fn test_worker_pool_processes_every_item() {
        let ctx = context(CancelSignal::never()).await;
        let results = ctx
            .for_each_bounded((1..=20).collect(), |n: u32| async move { n * 2 })
            .await
            .unwrap();
        assert_eq!(results.len(), 20);
        assert_eq!(results.iter().sum::<u32>(), 420);
    }

    #[tokio::test]
    async fn test_cancelled_pool_returns_cancelled() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let ctx = context(signal).await;
        let err = ctx
            .for_each_bounded(vec![1, 2, 3], |n: u32| async move { n })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_failure_ratio() {
        let ctx = context(CancelSignal::never()).await;
        assert!(ctx.check_failure_ratio(1, 4).is_ok());
        assert!(ctx.check_failure_ratio(2, 4).is_err());
        assert!(ctx.check_failure_ratio(0, 0).is_ok());
    }

    #[tokio::test]
    async fn test_generate_bounded_maps_missing_reply_to_generation_error() {
        let generator = ScriptedGenerator::new();
        let err = generate_bounded(&generator, "hello", Duration::from_secs(1), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Generation(_)));
    }

    #[tokio::test]
    async fn test_stalled_generation_times_out() {
        let err = generate_bounded(
            &StalledGenerator,
            "hello",
            Duration::from_millis(50),
            &CancelSignal::never(),
        )
        .await
        .unwrap_err();
        match err {
            AppError::Generation(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_abandons_stalled_generation() {
        let (handle, signal) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let err = generate_bounded(&StalledGenerator, "hello", Duration::from_secs(60), &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_cancel_mid_pool_keeps_finished_items() {
        let (handle, signal) = cancel_pair();
        let mut ctx = context(signal).await;
        ctx.settings.max_concurrency = 1;

        let ctx = &ctx;
        let handle = &handle;
        let err = ctx
            .for_each_bounded((1..=10).collect(), |n: u32| async move {
                ctx.store
                    .commit(ctx.ontology_id, |state| {
                        state.put_entity(Entity::new(
                            ctx.ontology_id,
                            format!("Item{}", n),
                            ColumnLocation::new("public", format!("item_{}", n), "id"),
                        ));
                        Ok(())
                    })
                    .await
                    .unwrap();
                if n == 3 {
                    handle.cancel();
                }
                n
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));

        let mut kept: Vec<String> = ctx
            .store
            .read(ctx.ontology_id, |state| state.entities().map(|e| e.name.clone()).collect())
            .await
            .unwrap();
        kept.sort();
        assert_eq!(kept, vec!["Item1", "Item2", "Item3"]);
    }
}
