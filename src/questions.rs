//! Question ledger
//!
//! Stages raise questions when they are unsure; reviewers answer them. Raising
//! is bookkeeping and is written directly, outside the change ledger.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::{not_found_error, AppError};
use crate::models::{Question, QuestionAction, QuestionDraft, QuestionStatus};
use crate::store::{OntologyState, OntologyStore};

/// Add a question unless one with the same source and prompt already exists.
/// Returns the new question, or `None` for a duplicate.
pub fn raise_in(state: &mut OntologyState, draft: QuestionDraft) -> Result<Option<Question>, AppError> {
    let duplicate = state
        .questions()
        .any(|q| q.source == draft.source && q.prompt == draft.prompt);
    if duplicate {
        return Ok(None);
    }
    let question = Question::from_draft(state.ontology().id, draft)?;
    state.put_question(question.clone());
    Ok(Some(question))
}

pub struct QuestionLedger {
    store: Arc<OntologyStore>,
}

impl QuestionLedger {
    pub fn new(store: Arc<OntologyStore>) -> Self {
        Self { store }
    }

    pub async fn raise(&self, ontology_id: Uuid, draft: QuestionDraft) -> Result<Option<Question>, AppError> {
        self.store.commit(ontology_id, |state| raise_in(state, draft)).await
    }

    /// Questions ordered by priority, then age
    pub async fn list(
        &self,
        ontology_id: Uuid,
        status: Option<QuestionStatus>,
    ) -> Result<Vec<Question>, AppError> {
        self.store
            .read(ontology_id, |state| {
                let mut questions: Vec<Question> = state
                    .questions()
                    .filter(|q| status.map_or(true, |s| q.status == s))
                    .cloned()
                    .collect();
                questions.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
                questions
            })
            .await
    }

    /// Apply a lifecycle action. A rejected transition leaves the question untouched.
    pub async fn act(
        &self,
        ontology_id: Uuid,
        question_id: Uuid,
        action: QuestionAction,
    ) -> Result<Question, AppError> {
        let status = action.target_status();
        let question = self
            .store
            .commit(ontology_id, |state| {
                let mut question = state
                    .question(question_id)
                    .cloned()
                    .ok_or_else(|| not_found_error(format!("Question {} not found", question_id)))?;
                question.transition(action)?;
                state.put_question(question.clone());
                Ok(question)
            })
            .await?;

        info!(%ontology_id, %question_id, ?status, "Question updated");
        Ok(question)
    }

    pub async fn resolve(&self, ontology_id: Uuid, question_id: Uuid, answer: String) -> Result<Question, AppError> {
        self.act(ontology_id, question_id, QuestionAction::Resolve { answer }).await
    }

    pub async fn skip(&self, ontology_id: Uuid, question_id: Uuid) -> Result<Question, AppError> {
        self.act(ontology_id, question_id, QuestionAction::Skip).await
    }

    pub async fn dismiss(
        &self,
        ontology_id: Uuid,
        question_id: Uuid,
        reason: Option<String>,
    ) -> Result<Question, AppError> {
        self.act(ontology_id, question_id, QuestionAction::Dismiss { reason }).await
    }

    pub async fn escalate(
        &self,
        ontology_id: Uuid,
        question_id: Uuid,
        reason: Option<String>,
    ) -> Result<Question, AppError> {
        self.act(ontology_id, question_id, QuestionAction::Escalate { reason }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Ontology, QuestionCategory};

    async fn ledger() -> (QuestionLedger, Uuid) {
        let store = Arc::new(OntologyStore::in_memory());
        let ontology = store.create(Ontology::new("shop")).await.unwrap();
        (QuestionLedger::new(store), ontology.id)
    }

    fn draft() -> QuestionDraft {
        QuestionDraft::new("table:public.events", "Which column identifies an event?", QuestionCategory::DataQuality)
    }

    #[tokio::test]
    async fn test_raise_deduplicates_on_source_and_prompt() {
        let (ledger, ontology_id) = ledger().await;
        assert!(ledger.raise(ontology_id, draft()).await.unwrap().is_some());
        assert!(ledger.raise(ontology_id, draft()).await.unwrap().is_none());
        assert_eq!(ledger.list(ontology_id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dismiss_then_skip_conflicts_and_keeps_state() {
        let (ledger, ontology_id) = ledger().await;
        let question = ledger.raise(ontology_id, draft()).await.unwrap().unwrap();

        ledger
            .dismiss(ontology_id, question.id, Some("not relevant".to_string()))
            .await
            .unwrap();
        let err = ledger.skip(ontology_id, question.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let dismissed = ledger
            .list(ontology_id, Some(QuestionStatus::Dismissed))
            .await
            .unwrap();
        assert_eq!(dismissed.len(), 1);
        assert_eq!(dismissed[0].status_reason.as_deref(), Some("not relevant"));
    }

    #[tokio::test]
    async fn test_unknown_question_is_not_found() {
        let (ledger, ontology_id) = ledger().await;
        let err = ledger.skip(ontology_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
