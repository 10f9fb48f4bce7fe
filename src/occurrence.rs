//! Entity occurrences
//!
//! Where an entity appears in the schema. Never stored: computed on read from
//! the entity's primary location plus the relationship rows that target it.

use serde::Serialize;

use crate::error::{not_found_error, AppError};
use crate::models::{ColumnLocation, Entity, RelationshipKey, ReviewState};
use crate::store::OntologyState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceKind {
    Primary,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub location: ColumnLocation,
    pub kind: OccurrenceKind,
    /// Association of the row that produced this occurrence
    pub role: Option<String>,
    pub via: Option<RelationshipKey>,
    /// Review state of the entity (primary) or the producing row
    pub review: ReviewState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityView {
    pub entity: Entity,
    pub occurrences: Vec<Occurrence>,
}

/// Occurrences of `name`: the primary location first, then one entry per
/// inbound row, rejected rows included.
pub fn occurrences_for(state: &OntologyState, name: &str) -> Result<Vec<Occurrence>, AppError> {
    let entity = state
        .entity(name)
        .ok_or_else(|| not_found_error(format!("Entity {} not found", name)))?;

    let mut occurrences = vec![Occurrence {
        location: entity.primary_location.clone(),
        kind: OccurrenceKind::Primary,
        role: None,
        via: None,
        review: entity.review,
    }];

    occurrences.extend(state.inbound(name).map(|row| Occurrence {
        location: row.source_location.clone(),
        kind: OccurrenceKind::Reference,
        role: row.association.clone(),
        via: Some(row.key()),
        review: row.review,
    }));

    Ok(occurrences)
}

pub fn entity_view(state: &OntologyState, name: &str) -> Result<EntityView, AppError> {
    let occurrences = occurrences_for(state, name)?;
    let entity = state
        .entity(name)
        .cloned()
        .ok_or_else(|| not_found_error(format!("Entity {} not found", name)))?;
    Ok(EntityView { entity, occurrences })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cardinality, DiscoveryMethod, Ontology, Relationship};
    use pretty_assertions::assert_eq;

    fn state_with_users_and_orders() -> OntologyState {
        let ontology = Ontology::new("shop");
        let mut state = OntologyState::new(ontology.clone());
        state.put_entity(Entity::new(ontology.id, "User", ColumnLocation::new("public", "users", "id")));
        state.put_entity(Entity::new(ontology.id, "Order", ColumnLocation::new("public", "orders", "id")));
        state
    }

    fn order_user_pair(state: &mut OntologyState, column: &str, forward_label: &str) {
        let mut forward = Relationship::new(
            state.ontology().id,
            "Order",
            "User",
            ColumnLocation::new("public", "orders", column),
            ColumnLocation::new("public", "users", "id"),
            Cardinality::ManyToOne,
            DiscoveryMethod::ForeignKey,
        );
        forward.association = Some(forward_label.to_string());
        let mut reverse = forward.mirror();
        reverse.association = Some("places".to_string());
        state.put_relationship(forward);
        state.put_relationship(reverse);
    }

    #[test]
    fn test_occurrences_are_primary_plus_inbound() {
        let mut state = state_with_users_and_orders();
        order_user_pair(&mut state, "user_id", "placed_by");

        let users = occurrences_for(&state, "User").unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].kind, OccurrenceKind::Primary);
        assert_eq!(users[0].role, None);
        assert_eq!(users[1].location, ColumnLocation::new("public", "orders", "user_id"));
        assert_eq!(users[1].role.as_deref(), Some("placed_by"));

        // The reverse row targets Order and surfaces at users.id
        let orders = occurrences_for(&state, "Order").unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].location, ColumnLocation::new("public", "users", "id"));
        assert_eq!(orders[1].role.as_deref(), Some("places"));
    }

    #[test]
    fn test_new_row_only_changes_its_target() {
        let mut state = state_with_users_and_orders();
        order_user_pair(&mut state, "user_id", "placed_by");
        let before_users = occurrences_for(&state, "User").unwrap().len();
        let before_orders = occurrences_for(&state, "Order").unwrap().len();

        let extra = Relationship::new(
            state.ontology().id,
            "Order",
            "User",
            ColumnLocation::new("public", "orders", "shipped_by_id"),
            ColumnLocation::new("public", "users", "id"),
            Cardinality::ManyToOne,
            DiscoveryMethod::NameMatch,
        );
        state.put_relationship(extra);

        assert_eq!(occurrences_for(&state, "User").unwrap().len(), before_users + 1);
        assert_eq!(occurrences_for(&state, "Order").unwrap().len(), before_orders);
    }

    #[test]
    fn test_unknown_entity_is_not_found() {
        let state = state_with_users_and_orders();
        assert!(matches!(occurrences_for(&state, "Invoice"), Err(AppError::NotFound(_))));
    }
}
