//! DAG orchestrator - sequential, resumable execution of the extraction nodes

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{conflict_error, AppError};
use crate::pipeline::context::{cancel_pair, CancelHandle, CancelSignal, NodeContext};
use crate::pipeline::types::{DagNode, DagNodeStatus, NodeReport, NodeStatus, ProgressEvent, RunReport};
use crate::store::OntologyStore;

/// Work bound to one DAG node
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn node(&self) -> DagNode;

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeReport, AppError>;
}

/// Node to executor bindings, fixed at startup
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<DagNode, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executors.insert(executor.node(), executor);
        self
    }

    pub fn get(&self, node: DagNode) -> Option<&Arc<dyn NodeExecutor>> {
        self.executors.get(&node)
    }
}

type ActiveRuns = Arc<Mutex<HashMap<Uuid, CancelHandle>>>;

/// Held for the duration of a run; releases the ontology on drop
struct RunPermit {
    ontology_id: Uuid,
    active: ActiveRuns,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.ontology_id);
        }
    }
}

/// Node rows in execution order plus whether a run is active
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DagStatus {
    pub ontology_id: Uuid,
    pub running: bool,
    pub nodes: Vec<DagNodeStatus>,
}

pub struct DagOrchestrator {
    store: Arc<OntologyStore>,
    registry: ExecutorRegistry,
    settings: PipelineConfig,
    active: ActiveRuns,
    events: broadcast::Sender<ProgressEvent>,
}

impl DagOrchestrator {
    pub fn new(store: Arc<OntologyStore>, registry: ExecutorRegistry, settings: PipelineConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            registry,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Progress events for every run on this orchestrator
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self, ontology_id: Uuid) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(&ontology_id))
            .unwrap_or(false)
    }

    fn acquire(&self, ontology_id: Uuid) -> Result<(RunPermit, CancelSignal), AppError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| AppError::Internal("run registry poisoned".to_string()))?;
        if active.contains_key(&ontology_id) {
            return Err(conflict_error(format!(
                "An extraction is already running for ontology {}",
                ontology_id
            )));
        }
        let (handle, signal) = cancel_pair();
        active.insert(ontology_id, handle);
        Ok((
            RunPermit {
                ontology_id,
                active: self.active.clone(),
            },
            signal,
        ))
    }

    /// Run to completion, resuming at the first node that has not succeeded
    pub async fn run(&self, ontology_id: Uuid) -> Result<RunReport, AppError> {
        self.store.read(ontology_id, |_| ()).await?;
        let (permit, signal) = self.acquire(ontology_id)?;
        let result = self.run_nodes(ontology_id, signal).await;
        drop(permit);
        result
    }

    /// Start a run in the background. Conflicts and unknown ontologies are
    /// reported here; node failures land in the DAG rows.
    pub async fn begin(self: &Arc<Self>, ontology_id: Uuid) -> Result<(), AppError> {
        self.store.read(ontology_id, |_| ()).await?;
        let (permit, signal) = self.acquire(ontology_id)?;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = orchestrator.run_nodes(ontology_id, signal).await {
                warn!(%ontology_id, error = %e, "Background extraction stopped");
            }
        });
        Ok(())
    }

    /// Signal the active run to stop
    pub fn cancel(&self, ontology_id: Uuid) -> Result<(), AppError> {
        let active = self
            .active
            .lock()
            .map_err(|_| AppError::Internal("run registry poisoned".to_string()))?;
        match active.get(&ontology_id) {
            Some(handle) => {
                info!(%ontology_id, "Cancelling extraction");
                handle.cancel();
                Ok(())
            }
            None => Err(conflict_error(format!("No extraction is running for ontology {}", ontology_id))),
        }
    }

    /// Mark `from` and every later node pending so the next run re-executes them
    pub async fn reset(&self, ontology_id: Uuid, from: DagNode) -> Result<DagStatus, AppError> {
        if self.is_running(ontology_id) {
            return Err(conflict_error("Cannot reset while an extraction is running"));
        }
        self.store
            .commit(ontology_id, |state| {
                for node in DagNode::ALL.into_iter().filter(|n| *n >= from) {
                    let mut row = state
                        .dag_node(node)
                        .cloned()
                        .unwrap_or_else(|| DagNodeStatus::pending(ontology_id, node));
                    row.status = NodeStatus::Pending;
                    row.error = None;
                    row.progress = None;
                    row.finished_at = None;
                    row.updated_at = Utc::now();
                    state.put_dag_node(row);
                }
                Ok(())
            })
            .await?;
        info!(%ontology_id, from = %from, "DAG reset");
        self.status(ontology_id).await
    }

    pub async fn status(&self, ontology_id: Uuid) -> Result<DagStatus, AppError> {
        let nodes = self
            .store
            .read(ontology_id, |state| {
                DagNode::ALL
                    .into_iter()
                    .map(|node| {
                        state
                            .dag_node(node)
                            .cloned()
                            .unwrap_or_else(|| DagNodeStatus::pending(ontology_id, node))
                    })
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(DagStatus {
            ontology_id,
            running: self.is_running(ontology_id),
            nodes,
        })
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run_nodes(&self, ontology_id: Uuid, cancel: CancelSignal) -> Result<RunReport, AppError> {
        self.store
            .commit(ontology_id, |state| {
                for node in DagNode::ALL {
                    if state.dag_node(node).is_none() {
                        state.put_dag_node(DagNodeStatus::pending(ontology_id, node));
                    }
                }
                Ok(())
            })
            .await?;

        info!(%ontology_id, "Extraction run started");
        self.emit(ProgressEvent::RunStarted { ontology_id });

        let mut executed = Vec::new();
        let mut skipped = Vec::new();

        for node in DagNode::ALL {
            let status = self
                .store
                .read(ontology_id, |state| state.dag_node(node).map(|row| row.status))
                .await?;
            // A stale `running` row from a crashed process is re-executed
            if status == Some(NodeStatus::Succeeded) {
                skipped.push(node);
                self.emit(ProgressEvent::NodeSkipped { ontology_id, node });
                continue;
            }

            if cancel.is_cancelled() {
                return Err(AppError::Cancelled(format!("run cancelled before {}", node)));
            }

            self.mark_running(ontology_id, node).await?;
            self.emit(ProgressEvent::NodeStarted { ontology_id, node });
            info!(%ontology_id, node = %node, "Node started");

            let result = match self.registry.get(node) {
                Some(executor) => {
                    let ctx = NodeContext {
                        ontology_id,
                        node,
                        store: self.store.clone(),
                        settings: self.settings.clone(),
                        cancel: cancel.clone(),
                        events: self.events.clone(),
                    };
                    executor.execute(&ctx).await
                }
                None => Err(AppError::Config(format!("no executor registered for {}", node))),
            };

            match result {
                Ok(report) => {
                    self.mark_finished(ontology_id, node, Ok(&report)).await?;
                    info!(
                        %ontology_id,
                        node = %node,
                        processed = report.processed,
                        failed = report.failed,
                        "Node succeeded"
                    );
                    self.emit(ProgressEvent::NodeSucceeded { ontology_id, node, report });
                    executed.push(node);
                }
                Err(e) => {
                    let cause = e.to_string();
                    self.mark_finished(ontology_id, node, Err(&cause)).await?;
                    error!(%ontology_id, node = %node, error = %cause, "Node failed");
                    self.emit(ProgressEvent::NodeFailed {
                        ontology_id,
                        node,
                        error: cause.clone(),
                    });
                    return Err(match e {
                        AppError::Cancelled(reason) => AppError::Cancelled(reason),
                        _ => AppError::NodeExecution { node, cause },
                    });
                }
            }
        }

        info!(%ontology_id, executed = executed.len(), skipped = skipped.len(), "Extraction run finished");
        self.emit(ProgressEvent::RunFinished { ontology_id });
        Ok(RunReport {
            ontology_id,
            executed,
            skipped,
            finished_at: Utc::now(),
        })
    }

    async fn mark_running(&self, ontology_id: Uuid, node: DagNode) -> Result<(), AppError> {
        self.store
            .commit(ontology_id, |state| {
                let mut row = state
                    .dag_node(node)
                    .cloned()
                    .unwrap_or_else(|| DagNodeStatus::pending(ontology_id, node));
                let now = Utc::now();
                row.status = NodeStatus::Running;
                row.attempts += 1;
                row.started_at = Some(now);
                row.finished_at = None;
                row.error = None;
                row.updated_at = now;
                state.put_dag_node(row);
                Ok(())
            })
            .await
    }

    async fn mark_finished(
        &self,
        ontology_id: Uuid,
        node: DagNode,
        outcome: Result<&NodeReport, &str>,
    ) -> Result<(), AppError> {
        self.store
            .commit(ontology_id, |state| {
                let mut row = state
                    .dag_node(node)
                    .cloned()
                    .unwrap_or_else(|| DagNodeStatus::pending(ontology_id, node));
                let now = Utc::now();
                match outcome {
                    Ok(report) => {
                        row.status = NodeStatus::Succeeded;
                        row.progress = Some(report.message.clone());
                        row.error = None;
                    }
                    Err(cause) => {
                        row.status = NodeStatus::Failed;
                        row.error = Some(cause.to_string());
                    }
                }
                row.finished_at = Some(now);
                row.updated_at = now;
                state.put_dag_node(row);
                Ok(())
            })
            .await
    }
}
