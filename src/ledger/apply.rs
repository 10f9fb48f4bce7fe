//! Diff application
//!
//! Three ways a diff touches ontology state:
//! - `write_staged`: stage output lands on the object with `review = staged`
//! - `check` + `apply`: approval writes the after-values
//! - `revert`: rejection restores the before-values or marks creations rejected
//!
//! `check` never mutates and `apply` never fails, so a failed approval
//! leaves state exactly as it was.

use chrono::Utc;

use crate::error::{conflict_error, not_found_error, validation_error, AppError};
use crate::models::{
    ChangeDiff, ChangeStatus, ColumnAnnotation, ColumnLocation, Entity, GlossaryTerm, Relationship,
    RelationshipAnnotation, RelationshipKey, ReviewState, TargetRef,
};
use crate::store::OntologyState;

fn require_location(state: &OntologyState, location: &ColumnLocation) -> Result<(), AppError> {
    match &state.ontology().snapshot {
        Some(snapshot) => snapshot.require_location(location).map(|_| ()),
        // No capture yet: nothing to check against
        None => Ok(()),
    }
}

fn require_entity<'a>(state: &'a OntologyState, name: &str) -> Result<&'a Entity, AppError> {
    state
        .entity(name)
        .filter(|e| e.is_active())
        .ok_or_else(|| not_found_error(format!("Entity {} not found", name)))
}

fn require_row<'a>(state: &'a OntologyState, key: &RelationshipKey) -> Result<&'a Relationship, AppError> {
    state
        .relationship(key)
        .ok_or_else(|| not_found_error(format!("Relationship {} not found", key)))
}

/// Non-rejected rows that still point at or away from `name`
fn referencing_rows(state: &OntologyState, name: &str) -> usize {
    state
        .relationships()
        .filter(|r| r.is_active() && (r.source_entity == name || r.target_entity == name))
        .count()
}

/// Validation for a manual proposal, before anything is recorded
pub fn check_proposal(state: &OntologyState, diff: &ChangeDiff) -> Result<(), AppError> {
    match diff {
        ChangeDiff::CreateEntity { entity } => {
            if entity.name.trim().is_empty() {
                return Err(validation_error("Entity name is required"));
            }
            if state.entity(&entity.name).is_some_and(|e| e.is_active()) {
                return Err(conflict_error(format!("Entity {} already exists", entity.name)));
            }
            require_location(state, &entity.primary_location)
        }
        ChangeDiff::CreateRelationshipPair { forward, reverse } => {
            if reverse.key() != forward.key().reversed() {
                return Err(validation_error("Reverse row must mirror the forward row"));
            }
            if state.relationship(&forward.key()).is_some() && state.relationship(&reverse.key()).is_some() {
                return Err(conflict_error(format!("Relationship {} already exists", forward.key())));
            }
            check(state, diff)
        }
        ChangeDiff::UpsertGlossaryTerm { term, after, .. } => {
            if term.trim().is_empty() || after.definition.trim().is_empty() {
                return Err(validation_error("Glossary terms need a term and a definition"));
            }
            Ok(())
        }
        _ => check(state, diff),
    }
}

/// Preconditions for applying a diff at approval time
pub fn check(state: &OntologyState, diff: &ChangeDiff) -> Result<(), AppError> {
    match diff {
        ChangeDiff::CreateEntity { entity } => require_location(state, &entity.primary_location),
        ChangeDiff::UpdateEntity { name, after, .. } => {
            require_entity(state, name)?;
            require_location(state, &after.primary_location)
        }
        ChangeDiff::DeleteEntity { name, .. } => {
            require_entity(state, name)?;
            let refs = referencing_rows(state, name);
            if refs > 0 {
                return Err(conflict_error(format!(
                    "Entity {} is referenced by {} relationship rows",
                    name, refs
                )));
            }
            Ok(())
        }
        ChangeDiff::CreateRelationshipPair { forward, .. } => {
            require_entity(state, &forward.source_entity)?;
            require_entity(state, &forward.target_entity)?;
            require_location(state, &forward.source_location)?;
            require_location(state, &forward.target_location)
        }
        ChangeDiff::AnnotateRelationship { key, .. } => {
            let row = require_row(state, key)?;
            if !row.is_active() {
                return Err(conflict_error(format!("Relationship {} was rejected", key)));
            }
            Ok(())
        }
        ChangeDiff::DeleteRelationship { key } => require_row(state, key).map(|_| ()),
        ChangeDiff::AnnotateColumn { location, .. } => require_location(state, location),
        ChangeDiff::UpsertGlossaryTerm { .. } => Ok(()),
        ChangeDiff::SetDomainSummary { after, .. } => {
            if after.summary.trim().is_empty() {
                return Err(validation_error("Domain summary is empty"));
            }
            Ok(())
        }
    }
}

/// Stage output: write the after-values with `review = staged`
pub fn write_staged(state: &mut OntologyState, diff: &ChangeDiff) {
    match diff {
        ChangeDiff::CreateEntity { entity } => {
            let mut entity = entity.clone();
            entity.review = ReviewState::Staged;
            state.put_entity(entity);
        }
        ChangeDiff::UpdateEntity { name, after, .. } => {
            if let Some(entity) = state.entity_mut(name) {
                entity.set_fields(after);
                entity.review = ReviewState::Staged;
            }
        }
        ChangeDiff::CreateRelationshipPair { forward, reverse } => {
            for row in [forward, reverse] {
                if state.relationship(&row.key()).is_none() {
                    let mut row = row.clone();
                    row.review = ReviewState::Staged;
                    state.put_relationship(row);
                }
            }
        }
        ChangeDiff::AnnotateRelationship { key, after, .. } => {
            if let Some(row) = state.relationship_mut(key) {
                row.set_annotation(after);
                row.review = ReviewState::Staged;
            }
        }
        ChangeDiff::AnnotateColumn { location, after, .. } => {
            state.put_column(ColumnAnnotation::new(location.clone(), after.clone()));
        }
        ChangeDiff::UpsertGlossaryTerm { term, after, .. } => {
            let ontology_id = state.ontology().id;
            match state.glossary_term_mut(term) {
                Some(existing) => {
                    existing.set_fields(after);
                    existing.review = ReviewState::Staged;
                }
                None => {
                    let mut record = GlossaryTerm::new(ontology_id, term.clone(), after.clone());
                    record.set_fields(after);
                    state.put_glossary_term(record);
                }
            }
        }
        ChangeDiff::SetDomainSummary { after, .. } => {
            state.ontology_mut().domain_summary = Some(after.clone());
        }
        // Deletions only ever take effect on approval
        ChangeDiff::DeleteEntity { .. } | ChangeDiff::DeleteRelationship { .. } => {}
    }
}

/// Approval: write the after-values. Call `check` first.
pub fn apply(state: &mut OntologyState, diff: &ChangeDiff) {
    match diff {
        ChangeDiff::CreateEntity { entity } => {
            // A staged copy may already carry later annotations; keep them
            let exists = state.entity(&entity.name).is_some_and(|e| e.is_active());
            if !exists {
                state.put_entity(entity.clone());
            }
        }
        ChangeDiff::UpdateEntity { name, after, .. } => {
            if let Some(entity) = state.entity_mut(name) {
                entity.set_fields(after);
            }
        }
        ChangeDiff::DeleteEntity { name, reason } => {
            if let Some(entity) = state.entity_mut(name) {
                entity.is_deleted = true;
                entity.deletion_reason = reason.clone();
                entity.updated_at = Utc::now();
            }
        }
        ChangeDiff::CreateRelationshipPair { forward, reverse } => {
            for row in [forward, reverse] {
                let exists = state.relationship(&row.key()).is_some_and(|r| r.is_active());
                if !exists {
                    state.put_relationship(row.clone());
                }
            }
        }
        ChangeDiff::AnnotateRelationship { key, after, .. } => {
            if let Some(row) = state.relationship_mut(key) {
                row.set_annotation(after);
            }
        }
        ChangeDiff::DeleteRelationship { key } => {
            state.remove_relationship(key);
        }
        ChangeDiff::AnnotateColumn { location, after, .. } => {
            state.put_column(ColumnAnnotation::new(location.clone(), after.clone()));
        }
        ChangeDiff::UpsertGlossaryTerm { term, after, .. } => {
            let ontology_id = state.ontology().id;
            match state.glossary_term_mut(term) {
                Some(existing) => existing.set_fields(after),
                None => {
                    let mut record = GlossaryTerm::new(ontology_id, term.clone(), after.clone());
                    record.set_fields(after);
                    state.put_glossary_term(record);
                }
            }
        }
        ChangeDiff::SetDomainSummary { after, .. } => {
            state.ontology_mut().domain_summary = Some(after.clone());
        }
    }
}

/// Rejection of staged stage output: restore `before`, or mark a staged
/// creation rejected in place. Dependent objects are left alone.
pub fn revert(state: &mut OntologyState, diff: &ChangeDiff) {
    match diff {
        ChangeDiff::CreateEntity { entity } => {
            if let Some(existing) = state.entity_mut(&entity.name) {
                if existing.review == ReviewState::Staged {
                    existing.review = ReviewState::Rejected;
                    existing.updated_at = Utc::now();
                }
            }
        }
        ChangeDiff::UpdateEntity { name, before, .. } => {
            if let (Some(before), Some(entity)) = (before, state.entity_mut(name)) {
                entity.set_fields(before);
            }
        }
        ChangeDiff::CreateRelationshipPair { forward, reverse } => {
            for key in [forward.key(), reverse.key()] {
                if let Some(row) = state.relationship_mut(&key) {
                    if row.review == ReviewState::Staged {
                        row.review = ReviewState::Rejected;
                        row.updated_at = Utc::now();
                    }
                }
            }
        }
        ChangeDiff::AnnotateRelationship { key, before, .. } => {
            if let Some(row) = state.relationship_mut(key) {
                let cleared = RelationshipAnnotation {
                    association: None,
                    description: None,
                };
                row.set_annotation(before.as_ref().unwrap_or(&cleared));
            }
        }
        ChangeDiff::AnnotateColumn { location, before, .. } => {
            let Some(mut column) = state.column(location).cloned() else {
                return;
            };
            match before {
                Some(before) => column.fields = before.clone(),
                None => column.review = ReviewState::Rejected,
            }
            column.updated_at = Utc::now();
            state.put_column(column);
        }
        ChangeDiff::UpsertGlossaryTerm { term, before, .. } => {
            if let Some(record) = state.glossary_term_mut(term) {
                match before {
                    Some(before) => record.set_fields(before),
                    None => record.review = ReviewState::Rejected,
                }
            }
        }
        ChangeDiff::SetDomainSummary { before, .. } => {
            state.ontology_mut().domain_summary = before.clone();
        }
        ChangeDiff::DeleteEntity { .. } | ChangeDiff::DeleteRelationship { .. } => {}
    }
}

fn overlaps(a: &TargetRef, b: &TargetRef) -> bool {
    match (a, b) {
        (TargetRef::RelationshipPair { key }, other) | (other, TargetRef::RelationshipPair { key }) => {
            other.covers_relationship(key) || other.covers_relationship(&key.reversed())
        }
        _ => a == b,
    }
}

/// After an approval: promote the target to `live` unless another pending
/// change still touches it
pub fn settle_review(state: &mut OntologyState, target: &TargetRef) {
    let still_pending = state
        .changes()
        .iter()
        .any(|c| c.status == ChangeStatus::Pending && overlaps(&c.target, target));
    if still_pending {
        return;
    }

    fn promote(review: &mut ReviewState) {
        if *review == ReviewState::Staged {
            *review = ReviewState::Live;
        }
    }

    match target {
        TargetRef::Entity { name } => {
            if let Some(entity) = state.entity_mut(name) {
                promote(&mut entity.review);
            }
        }
        TargetRef::Relationship { key } => {
            if let Some(row) = state.relationship_mut(key) {
                promote(&mut row.review);
            }
        }
        TargetRef::RelationshipPair { key } => {
            for key in [key.clone(), key.reversed()] {
                if let Some(row) = state.relationship_mut(&key) {
                    promote(&mut row.review);
                }
            }
        }
        TargetRef::Column { location } => {
            if let Some(mut column) = state.column(location).cloned() {
                promote(&mut column.review);
                state.put_column(column);
            }
        }
        TargetRef::GlossaryTerm { term } => {
            if let Some(record) = state.glossary_term_mut(term) {
                promote(&mut record.review);
            }
        }
        TargetRef::Ontology => {}
    }
}
