//! Clarifying questions raised during discovery and enrichment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{conflict_error, validation_error, AppError};
use crate::pipeline::types::DagNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Open,
    Resolved,
    /// Deferred; can be revisited
    Skipped,
    Dismissed,
    /// Terminal for automation, flags mandatory human review
    Escalated,
}

impl QuestionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QuestionStatus::Resolved | QuestionStatus::Dismissed | QuestionStatus::Escalated
        )
    }

    pub fn parse(value: &str) -> Option<QuestionStatus> {
        match value {
            "open" => Some(QuestionStatus::Open),
            "resolved" => Some(QuestionStatus::Resolved),
            "skipped" => Some(QuestionStatus::Skipped),
            "dismissed" => Some(QuestionStatus::Dismissed),
            "escalated" => Some(QuestionStatus::Escalated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionCategory {
    Terminology,
    Relationship,
    Enumeration,
    BusinessRule,
    DataQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: Uuid,
    pub ontology_id: Uuid,
    /// Locator of what the question is about, e.g. `table:public.orders`
    pub source: String,
    pub prompt: String,
    pub category: QuestionCategory,
    /// 1 (highest) to 5
    pub priority: u8,
    pub required: bool,
    pub status: QuestionStatus,
    pub answer: Option<String>,
    pub status_reason: Option<String>,
    pub raised_by: Option<DagNode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for raising a question
#[derive(Debug, Clone)]
pub struct QuestionDraft {
    pub source: String,
    pub prompt: String,
    pub category: QuestionCategory,
    pub priority: u8,
    pub required: bool,
    pub raised_by: Option<DagNode>,
}

impl QuestionDraft {
    pub fn new(source: impl Into<String>, prompt: impl Into<String>, category: QuestionCategory) -> Self {
        Self {
            source: source.into(),
            prompt: prompt.into(),
            category,
            priority: 3,
            required: false,
            raised_by: None,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn raised_by(mut self, node: DagNode) -> Self {
        self.raised_by = Some(node);
        self
    }
}

/// Lifecycle actions a reviewer can take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QuestionAction {
    Resolve { answer: String },
    Skip,
    Dismiss { reason: Option<String> },
    Escalate { reason: Option<String> },
}

impl QuestionAction {
    pub fn target_status(&self) -> QuestionStatus {
        match self {
            QuestionAction::Resolve { .. } => QuestionStatus::Resolved,
            QuestionAction::Skip => QuestionStatus::Skipped,
            QuestionAction::Dismiss { .. } => QuestionStatus::Dismissed,
            QuestionAction::Escalate { .. } => QuestionStatus::Escalated,
        }
    }
}

impl Question {
    pub fn from_draft(ontology_id: Uuid, draft: QuestionDraft) -> Result<Self, AppError> {
        if !(1..=5).contains(&draft.priority) {
            return Err(validation_error(format!(
                "Question priority must be between 1 and 5, got {}",
                draft.priority
            )));
        }
        if draft.prompt.trim().is_empty() {
            return Err(validation_error("Question prompt is required"));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            ontology_id,
            source: draft.source,
            prompt: draft.prompt,
            category: draft.category,
            priority: draft.priority,
            required: draft.required,
            status: QuestionStatus::Open,
            answer: None,
            status_reason: None,
            raised_by: draft.raised_by,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a lifecycle action. Terminal questions reject every action and
    /// stay untouched.
    pub fn transition(&mut self, action: QuestionAction) -> Result<(), AppError> {
        if self.status.is_terminal() {
            return Err(conflict_error(format!(
                "Question {} is already {:?} and cannot change",
                self.id, self.status
            )));
        }

        let status = action.target_status();
        match action {
            QuestionAction::Resolve { answer } => {
                if answer.trim().is_empty() {
                    return Err(validation_error("An answer is required to resolve a question"));
                }
                self.answer = Some(answer);
                self.status_reason = None;
            }
            QuestionAction::Skip => {}
            QuestionAction::Dismiss { reason } | QuestionAction::Escalate { reason } => {
                self.status_reason = reason;
            }
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_question() -> Question {
        Question::from_draft(
            Uuid::new_v4(),
            QuestionDraft::new("table:public.orders", "What is an order?", QuestionCategory::Terminology),
        )
        .unwrap()
    }

    #[test]
    fn test_dismissed_then_skip_is_conflict() {
        let mut q = open_question();
        q.transition(QuestionAction::Dismiss { reason: None }).unwrap();

        let err = q.transition(QuestionAction::Skip).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(q.status, QuestionStatus::Dismissed);
    }

    #[test]
    fn test_skipped_is_revisitable() {
        let mut q = open_question();
        q.transition(QuestionAction::Skip).unwrap();
        q.transition(QuestionAction::Resolve { answer: "A purchase".to_string() }).unwrap();
        assert_eq!(q.status, QuestionStatus::Resolved);
        assert_eq!(q.answer.as_deref(), Some("A purchase"));
    }

    #[test]
    fn test_resolve_requires_answer() {
        let mut q = open_question();
        let err = q.transition(QuestionAction::Resolve { answer: "  ".to_string() }).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(q.status, QuestionStatus::Open);
    }

    #[test]
    fn test_priority_bounds() {
        let draft = QuestionDraft::new("x", "y", QuestionCategory::DataQuality).priority(6);
        assert!(Question::from_draft(Uuid::new_v4(), draft).is_err());
    }
}
