//! Ontology store
//!
//! In-memory state per ontology, persisted through a [`Journal`]. Every
//! mutation goes through [`OntologyStore::commit`]: the closure runs against
//! the live state while the first touch of each record saves its prior value,
//! the touched records are written to the journal as one batch, and a failed
//! closure or journal write restores the saved values. Cost is proportional to
//! what a commit touches, not to the size of the ontology.

pub mod journal;

pub use journal::{Journal, JournalEntry, MemoryJournal, PgJournal, RecordKind};

use crate::error::{not_found_error, AppError};
use crate::models::{
    glossary_key, ChangeStatus, ColumnAnnotation, ColumnLocation, Entity, GlossaryTerm, Ontology,
    OntologySummary, PendingChange, Question, QuestionStatus, Relationship, RelationshipKey,
    RelationshipPair, TargetRef,
};
use chrono::{DateTime, Utc};
use crate::pipeline::types::{DagNode, DagNodeStatus};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Identity of one persisted record inside an ontology
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordKey {
    Ontology,
    Entity(String),
    Relationship(RelationshipKey),
    Column(ColumnLocation),
    Glossary(String),
    Question(Uuid),
    Change(Uuid),
    DagNode(DagNode),
}

impl RecordKey {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordKey::Ontology => RecordKind::Ontology,
            RecordKey::Entity(_) => RecordKind::Entity,
            RecordKey::Relationship(_) => RecordKind::Relationship,
            RecordKey::Column(_) => RecordKind::Column,
            RecordKey::Glossary(_) => RecordKind::Glossary,
            RecordKey::Question(_) => RecordKind::Question,
            RecordKey::Change(_) => RecordKind::Change,
            RecordKey::DagNode(_) => RecordKind::DagNode,
        }
    }

    /// Stable text form used as the journal row key
    pub fn as_key_string(&self) -> String {
        match self {
            RecordKey::Ontology => "ontology".to_string(),
            RecordKey::Entity(name) => name.clone(),
            RecordKey::Relationship(key) => format!(
                "{}|{}|{}|{}",
                key.source_entity, key.target_entity, key.source_location, key.target_location
            ),
            RecordKey::Column(location) => location.to_string(),
            RecordKey::Glossary(term) => term.clone(),
            RecordKey::Question(id) | RecordKey::Change(id) => id.to_string(),
            RecordKey::DagNode(node) => node.as_str().to_string(),
        }
    }
}

/// Value of one record before the running commit touched it
#[derive(Debug, Clone)]
enum Prior {
    Ontology(Box<Ontology>),
    Entity(Option<Entity>),
    Relationship(Option<Relationship>),
    Column(Option<ColumnAnnotation>),
    Glossary(Option<GlossaryTerm>),
    Question(Option<Question>),
    Change(Option<PendingChange>),
    DagNode(Option<DagNodeStatus>),
}

/// All records owned by one ontology
#[derive(Debug, Clone)]
pub struct OntologyState {
    ontology: Ontology,
    entities: BTreeMap<String, Entity>,
    relationships: BTreeMap<RelationshipKey, Relationship>,
    /// target entity -> keys of rows pointing at it
    by_target: HashMap<String, BTreeSet<RelationshipKey>>,
    columns: BTreeMap<ColumnLocation, ColumnAnnotation>,
    glossary: BTreeMap<String, GlossaryTerm>,
    questions: BTreeMap<Uuid, Question>,
    changes: BTreeMap<Uuid, PendingChange>,
    /// target -> pending changes on it, oldest first
    pending: HashMap<TargetRef, BTreeSet<(DateTime<Utc>, Uuid)>>,
    dag: BTreeMap<DagNode, DagNodeStatus>,
    dirty: BTreeSet<RecordKey>,
    undo: BTreeMap<RecordKey, Prior>,
}

impl OntologyState {
    pub fn new(ontology: Ontology) -> Self {
        Self {
            ontology,
            entities: BTreeMap::new(),
            relationships: BTreeMap::new(),
            by_target: HashMap::new(),
            columns: BTreeMap::new(),
            glossary: BTreeMap::new(),
            questions: BTreeMap::new(),
            changes: BTreeMap::new(),
            pending: HashMap::new(),
            dag: BTreeMap::new(),
            dirty: BTreeSet::new(),
            undo: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Ontology header
    // ========================================================================

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    pub fn ontology_mut(&mut self) -> &mut Ontology {
        self.touch(RecordKey::Ontology);
        self.ontology.updated_at = chrono::Utc::now();
        &mut self.ontology
    }

    pub fn summary(&self) -> OntologySummary {
        OntologySummary {
            id: self.ontology.id,
            name: self.ontology.name.clone(),
            snapshot_checksum: self.ontology.snapshot.as_ref().map(|s| s.checksum.clone()),
            entity_count: self.entities().filter(|e| e.is_active()).count(),
            relationship_count: self.relationships().filter(|r| r.is_active()).count(),
            pending_changes: self.pending.values().map(BTreeSet::len).sum(),
            open_questions: self
                .questions
                .values()
                .filter(|q| q.status == QuestionStatus::Open)
                .count(),
            updated_at: self.ontology.updated_at,
        }
    }

    // ========================================================================
    // Entities
    // ========================================================================

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn entity_mut(&mut self, name: &str) -> Option<&mut Entity> {
        if !self.entities.contains_key(name) {
            return None;
        }
        self.touch(RecordKey::Entity(name.to_string()));
        self.entities.get_mut(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entity whose primary location sits in `schema.table`
    pub fn entity_for_table(&self, schema: &str, table: &str) -> Option<&Entity> {
        self.entities.values().find(|e| {
            e.is_active() && e.primary_location.schema == schema && e.primary_location.table == table
        })
    }

    pub fn put_entity(&mut self, entity: Entity) {
        self.touch(RecordKey::Entity(entity.name.clone()));
        self.entities.insert(entity.name.clone(), entity);
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    pub fn relationship(&self, key: &RelationshipKey) -> Option<&Relationship> {
        self.relationships.get(key)
    }

    pub fn relationship_mut(&mut self, key: &RelationshipKey) -> Option<&mut Relationship> {
        if !self.relationships.contains_key(key) {
            return None;
        }
        self.touch(RecordKey::Relationship(key.clone()));
        self.relationships.get_mut(key)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    pub fn put_relationship(&mut self, row: Relationship) {
        let key = row.key();
        self.touch(RecordKey::Relationship(key.clone()));
        self.set_relationship(&key, Some(row));
    }

    pub fn remove_relationship(&mut self, key: &RelationshipKey) -> Option<Relationship> {
        if !self.relationships.contains_key(key) {
            return None;
        }
        self.touch(RecordKey::Relationship(key.clone()));
        self.set_relationship(key, None)
    }

    /// Write or clear one row and keep the per-target index in step
    fn set_relationship(&mut self, key: &RelationshipKey, row: Option<Relationship>) -> Option<Relationship> {
        match row {
            Some(row) => {
                self.by_target
                    .entry(key.target_entity.clone())
                    .or_default()
                    .insert(key.clone());
                self.relationships.insert(key.clone(), row)
            }
            None => {
                if let Some(keys) = self.by_target.get_mut(&key.target_entity) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.by_target.remove(&key.target_entity);
                    }
                }
                self.relationships.remove(key)
            }
        }
    }

    /// Rows whose target is `entity`, via the per-target index
    pub fn inbound(&self, entity: &str) -> impl Iterator<Item = &Relationship> {
        self.by_target
            .get(entity)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|key| self.relationships.get(key))
    }

    /// Both directions for the pair that contains `key`
    pub fn pair(&self, key: &RelationshipKey) -> RelationshipPair {
        RelationshipPair {
            forward: self.relationships.get(key).cloned(),
            reverse: self.relationships.get(&key.reversed()).cloned(),
        }
    }

    // ========================================================================
    // Columns, glossary
    // ========================================================================

    pub fn column(&self, location: &ColumnLocation) -> Option<&ColumnAnnotation> {
        self.columns.get(location)
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnAnnotation> {
        self.columns.values()
    }

    pub fn put_column(&mut self, annotation: ColumnAnnotation) {
        self.touch(RecordKey::Column(annotation.location.clone()));
        self.columns.insert(annotation.location.clone(), annotation);
    }

    pub fn glossary_term(&self, term: &str) -> Option<&GlossaryTerm> {
        self.glossary.get(&glossary_key(term))
    }

    pub fn glossary_term_mut(&mut self, term: &str) -> Option<&mut GlossaryTerm> {
        let key = glossary_key(term);
        if !self.glossary.contains_key(&key) {
            return None;
        }
        self.touch(RecordKey::Glossary(key.clone()));
        self.glossary.get_mut(&key)
    }

    pub fn glossary(&self) -> impl Iterator<Item = &GlossaryTerm> {
        self.glossary.values()
    }

    pub fn put_glossary_term(&mut self, term: GlossaryTerm) {
        let key = glossary_key(&term.term);
        self.touch(RecordKey::Glossary(key.clone()));
        self.glossary.insert(key, term);
    }

    // ========================================================================
    // Questions, changes
    // ========================================================================

    pub fn question(&self, id: Uuid) -> Option<&Question> {
        self.questions.get(&id)
    }

    pub fn questions(&self) -> impl Iterator<Item = &Question> {
        self.questions.values()
    }

    pub fn put_question(&mut self, question: Question) {
        self.touch(RecordKey::Question(question.id));
        self.questions.insert(question.id, question);
    }

    pub fn change(&self, id: Uuid) -> Option<&PendingChange> {
        self.changes.get(&id)
    }

    /// Changes in creation order
    pub fn changes(&self) -> Vec<&PendingChange> {
        let mut changes: Vec<&PendingChange> = self.changes.values().collect();
        changes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        changes
    }

    /// Pending changes on `target`, oldest first
    pub fn pending_for(&self, target: &TargetRef) -> impl Iterator<Item = &PendingChange> {
        self.pending
            .get(target)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|(_, id)| self.changes.get(id))
    }

    pub fn put_change(&mut self, change: PendingChange) {
        self.touch(RecordKey::Change(change.id));
        self.set_change(change.id, Some(change));
    }

    /// Write or clear one change and keep the pending index in step
    fn set_change(&mut self, id: Uuid, change: Option<PendingChange>) {
        if let Some(old) = self.changes.remove(&id) {
            if let Some(ids) = self.pending.get_mut(&old.target) {
                ids.remove(&(old.created_at, old.id));
                if ids.is_empty() {
                    self.pending.remove(&old.target);
                }
            }
        }
        if let Some(change) = change {
            if change.status == ChangeStatus::Pending {
                self.pending
                    .entry(change.target.clone())
                    .or_default()
                    .insert((change.created_at, change.id));
            }
            self.changes.insert(id, change);
        }
    }

    // ========================================================================
    // DAG rows
    // ========================================================================

    pub fn dag_node(&self, node: DagNode) -> Option<&DagNodeStatus> {
        self.dag.get(&node)
    }

    pub fn dag(&self) -> impl Iterator<Item = &DagNodeStatus> {
        self.dag.values()
    }

    pub fn put_dag_node(&mut self, status: DagNodeStatus) {
        self.touch(RecordKey::DagNode(status.node));
        self.dag.insert(status.node, status);
    }

    // ========================================================================
    // Journal plumbing
    // ========================================================================

    /// Mark a record as written by the running commit, saving its prior value
    /// on first touch
    fn touch(&mut self, key: RecordKey) {
        if !self.undo.contains_key(&key) {
            let prior = match &key {
                RecordKey::Ontology => Prior::Ontology(Box::new(self.ontology.clone())),
                RecordKey::Entity(name) => Prior::Entity(self.entities.get(name).cloned()),
                RecordKey::Relationship(k) => Prior::Relationship(self.relationships.get(k).cloned()),
                RecordKey::Column(loc) => Prior::Column(self.columns.get(loc).cloned()),
                RecordKey::Glossary(term) => Prior::Glossary(self.glossary.get(term).cloned()),
                RecordKey::Question(id) => Prior::Question(self.questions.get(id).cloned()),
                RecordKey::Change(id) => Prior::Change(self.changes.get(id).cloned()),
                RecordKey::DagNode(node) => Prior::DagNode(self.dag.get(node).cloned()),
            };
            self.undo.insert(key.clone(), prior);
        }
        self.dirty.insert(key);
    }

    /// Discard what a commit dropped mid-write left behind
    fn settle(&mut self) {
        if !self.undo.is_empty() {
            self.rollback();
        }
    }

    /// Put back every record the running commit touched
    fn rollback(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        self.dirty.clear();
        for (key, prior) in undo {
            match (key, prior) {
                (RecordKey::Ontology, Prior::Ontology(ontology)) => self.ontology = *ontology,
                (RecordKey::Entity(name), Prior::Entity(entity)) => match entity {
                    Some(entity) => {
                        self.entities.insert(name, entity);
                    }
                    None => {
                        self.entities.remove(&name);
                    }
                },
                (RecordKey::Relationship(k), Prior::Relationship(row)) => {
                    self.set_relationship(&k, row);
                }
                (RecordKey::Column(loc), Prior::Column(column)) => match column {
                    Some(column) => {
                        self.columns.insert(loc, column);
                    }
                    None => {
                        self.columns.remove(&loc);
                    }
                },
                (RecordKey::Glossary(term), Prior::Glossary(record)) => match record {
                    Some(record) => {
                        self.glossary.insert(term, record);
                    }
                    None => {
                        self.glossary.remove(&term);
                    }
                },
                (RecordKey::Question(id), Prior::Question(question)) => match question {
                    Some(question) => {
                        self.questions.insert(id, question);
                    }
                    None => {
                        self.questions.remove(&id);
                    }
                },
                (RecordKey::Change(id), Prior::Change(change)) => self.set_change(id, change),
                (RecordKey::DagNode(node), Prior::DagNode(status)) => match status {
                    Some(status) => {
                        self.dag.insert(node, status);
                    }
                    None => {
                        self.dag.remove(&node);
                    }
                },
                (key, _) => debug!(?key, "Mismatched undo record"),
            }
        }
    }

    fn body<T: Serialize>(record: &T) -> Result<serde_json::Value, AppError> {
        serde_json::to_value(record).map_err(|e| AppError::Internal(format!("serialize record: {}", e)))
    }

    /// Journal entries for every record touched since the last commit.
    /// Records that no longer exist become deletions.
    fn drain_entries(&mut self) -> Result<Vec<JournalEntry>, AppError> {
        let ontology_id = self.ontology.id;
        let dirty = std::mem::take(&mut self.dirty);
        let mut entries = Vec::with_capacity(dirty.len());
        for key in dirty {
            let body = match &key {
                RecordKey::Ontology => Some(Self::body(&self.ontology)?),
                RecordKey::Entity(name) => self.entities.get(name).map(Self::body).transpose()?,
                RecordKey::Relationship(k) => self.relationships.get(k).map(Self::body).transpose()?,
                RecordKey::Column(loc) => self.columns.get(loc).map(Self::body).transpose()?,
                RecordKey::Glossary(term) => self.glossary.get(term).map(Self::body).transpose()?,
                RecordKey::Question(id) => self.questions.get(id).map(Self::body).transpose()?,
                RecordKey::Change(id) => self.changes.get(id).map(Self::body).transpose()?,
                RecordKey::DagNode(node) => self.dag.get(node).map(Self::body).transpose()?,
            };
            entries.push(JournalEntry { ontology_id, key, body });
        }
        Ok(entries)
    }

    /// Restore one persisted record without marking it dirty
    fn restore(&mut self, kind: RecordKind, body: serde_json::Value) -> Result<(), AppError> {
        fn decode<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, AppError> {
            serde_json::from_value(body).map_err(|e| AppError::Internal(format!("decode record: {}", e)))
        }
        match kind {
            RecordKind::Ontology => self.ontology = decode(body)?,
            RecordKind::Entity => {
                let entity: Entity = decode(body)?;
                self.entities.insert(entity.name.clone(), entity);
            }
            RecordKind::Relationship => {
                let row: Relationship = decode(body)?;
                self.set_relationship(&row.key(), Some(row));
            }
            RecordKind::Column => {
                let column: ColumnAnnotation = decode(body)?;
                self.columns.insert(column.location.clone(), column);
            }
            RecordKind::Glossary => {
                let term: GlossaryTerm = decode(body)?;
                self.glossary.insert(glossary_key(&term.term), term);
            }
            RecordKind::Question => {
                let question: Question = decode(body)?;
                self.questions.insert(question.id, question);
            }
            RecordKind::Change => {
                let change: PendingChange = decode(body)?;
                self.set_change(change.id, Some(change));
            }
            RecordKind::DagNode => {
                let status: DagNodeStatus = decode(body)?;
                self.dag.insert(status.node, status);
            }
        }
        self.dirty.clear();
        self.undo.clear();
        Ok(())
    }
}

/// Thread-safe ontology store
pub struct OntologyStore {
    ontologies: RwLock<HashMap<Uuid, Arc<Mutex<OntologyState>>>>,
    journal: Arc<dyn Journal>,
}

impl OntologyStore {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            ontologies: RwLock::new(HashMap::new()),
            journal,
        }
    }

    /// Store without durable persistence
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJournal::new()))
    }

    /// Rebuild state from the journal. Returns the number of ontologies loaded.
    pub async fn hydrate(&self) -> Result<usize, AppError> {
        let rows = self.journal.load().await?;

        let mut states: HashMap<Uuid, OntologyState> = HashMap::new();
        let mut pending: Vec<(Uuid, RecordKind, serde_json::Value)> = Vec::new();
        for (ontology_id, kind, body) in rows {
            if kind == RecordKind::Ontology {
                let ontology: Ontology = serde_json::from_value(body)
                    .map_err(|e| AppError::Internal(format!("decode ontology: {}", e)))?;
                states.insert(ontology_id, OntologyState::new(ontology));
            } else {
                pending.push((ontology_id, kind, body));
            }
        }
        for (ontology_id, kind, body) in pending {
            match states.get_mut(&ontology_id) {
                Some(state) => state.restore(kind, body)?,
                None => debug!(%ontology_id, ?kind, "Skipping orphaned record"),
            }
        }

        let count = states.len();
        let mut ontologies = self.ontologies.write().await;
        for (id, state) in states {
            ontologies.insert(id, Arc::new(Mutex::new(state)));
        }
        Ok(count)
    }

    /// Register a new ontology
    pub async fn create(&self, ontology: Ontology) -> Result<Ontology, AppError> {
        let id = ontology.id;
        let mut state = OntologyState::new(ontology.clone());
        state.dirty.insert(RecordKey::Ontology);
        let entries = state.drain_entries()?;
        self.journal.write(&entries).await?;

        let mut ontologies = self.ontologies.write().await;
        ontologies.insert(id, Arc::new(Mutex::new(state)));
        Ok(ontology)
    }

    pub async fn list(&self) -> Vec<OntologySummary> {
        let handles: Vec<_> = self.ontologies.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let mut state = handle.lock().await;
            state.settle();
            summaries.push(state.summary());
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn exists(&self, ontology_id: Uuid) -> bool {
        self.ontologies.read().await.contains_key(&ontology_id)
    }

    async fn handle(&self, ontology_id: Uuid) -> Result<Arc<Mutex<OntologyState>>, AppError> {
        self.ontologies
            .read()
            .await
            .get(&ontology_id)
            .cloned()
            .ok_or_else(|| not_found_error(format!("Ontology {} not found", ontology_id)))
    }

    /// Read-only access to one ontology
    pub async fn read<T>(
        &self,
        ontology_id: Uuid,
        f: impl FnOnce(&OntologyState) -> T,
    ) -> Result<T, AppError> {
        let handle = self.handle(ontology_id).await?;
        let mut state = handle.lock().await;
        state.settle();
        Ok(f(&state))
    }

    /// Atomic mutation of one ontology
    pub async fn commit<T>(
        &self,
        ontology_id: Uuid,
        f: impl FnOnce(&mut OntologyState) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let handle = self.handle(ontology_id).await?;
        let mut state = handle.lock().await;
        state.settle();

        let value = match f(&mut state) {
            Ok(value) => value,
            Err(e) => {
                state.rollback();
                return Err(e);
            }
        };
        let written = match state.drain_entries() {
            Ok(entries) if entries.is_empty() => Ok(()),
            Ok(entries) => self.journal.write(&entries).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            state.rollback();
            return Err(e);
        }
        state.undo.clear();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cardinality, ChangeDiff, ChangeOrigin, DiscoveryMethod, ReviewState};
    use async_trait::async_trait;

    fn rel(source: &str, target: &str, src: (&str, &str), dst: (&str, &str)) -> Relationship {
        Relationship::new(
            Uuid::nil(),
            source,
            target,
            ColumnLocation::new("public", src.0, src.1),
            ColumnLocation::new("public", dst.0, dst.1),
            Cardinality::ManyToOne,
            DiscoveryMethod::ForeignKey,
        )
    }

    #[tokio::test]
    async fn test_failed_closure_leaves_state_untouched() {
        let store = OntologyStore::in_memory();
        let ontology = store.create(Ontology::new("shop")).await.unwrap();

        let result: Result<(), AppError> = store
            .commit(ontology.id, |state| {
                state.put_entity(Entity::new(
                    ontology.id,
                    "User",
                    ColumnLocation::new("public", "users", "id"),
                ));
                Err(AppError::Validation("nope".to_string()))
            })
            .await;

        assert!(result.is_err());
        let count = store.read(ontology.id, |s| s.entities().count()).await.unwrap();
        assert_eq!(count, 0);
    }

    struct BrokenJournal;

    #[async_trait]
    impl Journal for BrokenJournal {
        async fn write(&self, entries: &[JournalEntry]) -> Result<(), AppError> {
            if entries.iter().any(|e| e.key.kind() != RecordKind::Ontology) {
                return Err(AppError::Internal("disk full".to_string()));
            }
            Ok(())
        }

        async fn load(&self) -> Result<Vec<(Uuid, RecordKind, serde_json::Value)>, AppError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_journal_write_discards_commit() {
        let store = OntologyStore::new(Arc::new(BrokenJournal));
        let ontology = store.create(Ontology::new("shop")).await.unwrap();

        let result = store
            .commit(ontology.id, |state| {
                state.put_relationship(rel("Order", "User", ("orders", "user_id"), ("users", "id")));
                Ok(())
            })
            .await;

        assert!(result.is_err());
        let inbound = store.read(ontology.id, |s| s.inbound("User").count()).await.unwrap();
        assert_eq!(inbound, 0);
    }

    #[tokio::test]
    async fn test_hydrate_restores_committed_records() {
        let journal = Arc::new(MemoryJournal::new());
        let store = OntologyStore::new(journal.clone());
        let ontology = store.create(Ontology::new("shop")).await.unwrap();
        store
            .commit(ontology.id, |state| {
                let forward = rel("Order", "User", ("orders", "user_id"), ("users", "id"));
                state.put_relationship(forward.mirror());
                state.put_relationship(forward);
                Ok(())
            })
            .await
            .unwrap();

        let restored = OntologyStore::new(journal);
        assert_eq!(restored.hydrate().await.unwrap(), 1);
        let (rows, inbound) = restored
            .read(ontology.id, |s| (s.relationships().count(), s.inbound("User").count()))
            .await
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(inbound, 1);
    }

    #[tokio::test]
    async fn test_removing_one_direction_keeps_the_other() {
        let store = OntologyStore::in_memory();
        let ontology = store.create(Ontology::new("shop")).await.unwrap();
        let forward = rel("Order", "User", ("orders", "user_id"), ("users", "id"));
        let key = forward.key();

        store
            .commit(ontology.id, |state| {
                state.put_relationship(forward.mirror());
                state.put_relationship(forward);
                state.remove_relationship(&key);
                Ok(())
            })
            .await
            .unwrap();

        let pair = store.read(ontology.id, |s| s.pair(&key)).await.unwrap();
        assert!(pair.forward.is_none());
        let reverse = pair.reverse.unwrap();
        assert_eq!(reverse.review, ReviewState::Staged);
        assert_eq!(reverse.source_entity, "User");
    }

    #[tokio::test]
    async fn test_failed_closure_restores_touched_records() {
        let store = OntologyStore::in_memory();
        let ontology = store.create(Ontology::new("shop")).await.unwrap();
        let forward = rel("Order", "User", ("orders", "user_id"), ("users", "id"));
        let key = forward.key();
        store
            .commit(ontology.id, |state| {
                state.put_entity(Entity::new(ontology.id, "User", ColumnLocation::new("public", "users", "id")));
                state.put_relationship(forward);
                Ok(())
            })
            .await
            .unwrap();

        let result: Result<(), AppError> = store
            .commit(ontology.id, |state| {
                if let Some(user) = state.entity_mut("User") {
                    user.description = Some("changed".to_string());
                }
                state.remove_relationship(&key);
                state.put_relationship(rel("Invoice", "User", ("invoices", "user_id"), ("users", "id")));
                Err(AppError::Validation("nope".to_string()))
            })
            .await;
        assert!(result.is_err());

        let (description, inbound) = store
            .read(ontology.id, |s| {
                let inbound: Vec<String> = s.inbound("User").map(|r| r.source_entity.clone()).collect();
                (s.entity("User").and_then(|e| e.description.clone()), inbound)
            })
            .await
            .unwrap();
        assert_eq!(description, None);
        assert_eq!(inbound, vec!["Order".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_index_follows_change_status() {
        let store = OntologyStore::in_memory();
        let ontology = store.create(Ontology::new("shop")).await.unwrap();
        let user = Entity::new(ontology.id, "User", ColumnLocation::new("public", "users", "id"));
        let first = PendingChange::new(
            ontology.id,
            ChangeDiff::CreateEntity { entity: user.clone() },
            ChangeOrigin::Stage { node: DagNode::EntityDiscovery },
        );
        let mut second = PendingChange::new(
            ontology.id,
            ChangeDiff::CreateEntity { entity: user },
            ChangeOrigin::Manual { author: None },
        );
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        let target = first.target.clone();

        store
            .commit(ontology.id, |state| {
                state.put_change(first.clone());
                state.put_change(second.clone());
                Ok(())
            })
            .await
            .unwrap();
        let ids = store
            .read(ontology.id, |s| s.pending_for(&target).map(|c| c.id).collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(ids, vec![first.id, second.id]);

        let result: Result<(), AppError> = store
            .commit(ontology.id, |state| {
                let mut resolved = first.clone();
                resolved.status = ChangeStatus::Rejected;
                state.put_change(resolved);
                Err(AppError::Validation("nope".to_string()))
            })
            .await;
        assert!(result.is_err());
        let pending = store.read(ontology.id, |s| s.pending_for(&target).count()).await.unwrap();
        assert_eq!(pending, 2);

        store
            .commit(ontology.id, |state| {
                let mut resolved = first.clone();
                resolved.status = ChangeStatus::Rejected;
                state.put_change(resolved);
                Ok(())
            })
            .await
            .unwrap();
        let (ids, summary_count) = store
            .read(ontology.id, |s| {
                (
                    s.pending_for(&target).map(|c| c.id).collect::<Vec<_>>(),
                    s.summary().pending_changes,
                )
            })
            .await
            .unwrap();
        assert_eq!(ids, vec![second.id]);
        assert_eq!(summary_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_ontology_is_not_found() {
        let store = OntologyStore::in_memory();
        let err = store.read(Uuid::new_v4(), |s| s.entities().count()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
