//! Test fixtures: hand-built schemas and a scripted generator

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::generation::Generator;
use crate::introspection::{Column, ForeignKey, PrimaryKey, SchemaSnapshot, Table};
use crate::models::Ontology;
use crate::pipeline::context::{CancelSignal, NodeContext};
use crate::pipeline::types::DagNode;
use crate::store::OntologyStore;

pub fn column(name: &str, data_type: &str, is_primary_key: bool) -> Column {
    Column {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable: !is_primary_key,
        default_value: None,
        is_primary_key,
        is_unique: is_primary_key,
        ordinal_position: 0,
    }
}

pub fn table(name: &str, columns: Vec<Column>) -> Table {
    let pk: Vec<String> = columns
        .iter()
        .filter(|c| c.is_primary_key)
        .map(|c| c.name.clone())
        .collect();
    let columns = columns
        .into_iter()
        .enumerate()
        .map(|(i, mut c)| {
            c.ordinal_position = i as i32 + 1;
            c
        })
        .collect();
    Table {
        name: name.to_string(),
        schema: "public".to_string(),
        columns,
        primary_key: (!pk.is_empty()).then(|| PrimaryKey {
            constraint_name: format!("{}_pkey", name),
            columns: pk,
        }),
    }
}

pub fn foreign_key(source: &str, column: &str, target: &str, target_column: &str) -> ForeignKey {
    ForeignKey {
        constraint_name: format!("{}_{}_fkey", source, column),
        source_schema: "public".to_string(),
        source_table: source.to_string(),
        source_columns: vec![column.to_string()],
        referenced_schema: "public".to_string(),
        referenced_table: target.to_string(),
        referenced_columns: vec![target_column.to_string()],
    }
}

/// `orders(id, user_id, total, status, created_at)` and `users(id, name)`
pub fn orders_users_schema() -> (Vec<Table>, Vec<ForeignKey>) {
    let orders = table(
        "orders",
        vec![
            column("id", "integer", true),
            column("user_id", "integer", false),
            column("total", "numeric", false),
            column("status", "text", false),
            column("created_at", "timestamp with time zone", false),
        ],
    );
    let users = table("users", vec![column("id", "integer", true), column("name", "text", false)]);
    (vec![orders, users], vec![foreign_key("orders", "user_id", "users", "id")])
}

/// Store holding one ontology, with `snapshot` already captured when given
pub async fn seeded_store(snapshot: Option<(Vec<Table>, Vec<ForeignKey>)>) -> (Arc<OntologyStore>, Uuid) {
    let store = Arc::new(OntologyStore::in_memory());
    let id = store.create(Ontology::new("shop")).await.unwrap().id;
    if let Some((tables, fks)) = snapshot {
        store
            .commit(id, |state| {
                state.ontology_mut().snapshot = Some(SchemaSnapshot::new(id, tables, fks));
                Ok(())
            })
            .await
            .unwrap();
    }
    (store, id)
}

pub fn node_context(store: Arc<OntologyStore>, ontology_id: Uuid, node: DagNode) -> NodeContext {
    let (events, _) = broadcast::channel(64);
    NodeContext {
        ontology_id,
        node,
        store,
        settings: PipelineConfig::default(),
        cancel: CancelSignal::never(),
        events,
    }
}

struct Rule {
    needle: String,
    replies: VecDeque<Result<String, String>>,
}

/// Generator that answers prompts by substring match. Each rule replays its
/// replies in order and repeats the last one once exhausted.
pub struct ScriptedGenerator {
    rules: Mutex<Vec<Rule>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, needle: &str, reply: impl Into<String>) -> Self {
        self.push(needle, Ok(reply.into()))
    }

    pub fn fail_on(self, needle: &str, error: &str) -> Self {
        self.push(needle, Err(error.to_string()))
    }

    fn push(self, needle: &str, reply: Result<String, String>) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.prompts().into_iter().filter(|p| p.contains(needle)).collect()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, AppError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| prompt.contains(&r.needle))
            .ok_or_else(|| AppError::Generation("no scripted reply".to_string()))?;
        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        };
        match reply {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(AppError::Generation(e)),
            None => Err(AppError::Generation("no scripted reply".to_string())),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Replies for a full run over [`orders_users_schema`]
pub fn orders_users_generator() -> ScriptedGenerator {
    ScriptedGenerator::new()
        .on(
            "Describe the business concept \"User\"",
            r#"{"description": "A customer account", "aliases": ["customer"], "confidence": 0.9, "ambiguity": null}"#,
        )
        .on(
            "Describe the business concept \"Order\"",
            r#"{"description": "A purchase placed by a user", "aliases": ["purchase"], "confidence": 0.95, "ambiguity": null}"#,
        )
        .on(
            "Order relates to User",
            r#"{"association": "placed_by", "description": "The user who placed the order", "confidence": 0.9}"#,
        )
        .on(
            "User relates to Order",
            r#"{"association": "places", "description": "Orders a user has placed", "confidence": 0.9}"#,
        )
        .on(
            "Annotate every column of public.orders",
            r#"{"columns": [
                {"name": "id", "business_name": "Order ID", "description": "Order identifier", "semantic_type": "identifier", "confidence": 0.95},
                {"name": "total", "business_name": "Order Total", "description": "Amount charged", "semantic_type": "currency", "confidence": 0.9}
            ]}"#,
        )
        .on(
            "Annotate every column of public.users",
            r#"{"columns": [{"name": "name", "business_name": "Customer Name", "description": "Display name", "semantic_type": "name", "confidence": 0.9}]}"#,
        )
        .on(
            "List the business metrics",
            r#"{"terms": [{"term": "Revenue", "definition": "Sum of order totals", "aliases": ["sales"]}]}"#,
        )
        .on(
            "computes the business term \"Revenue\"",
            r#"{"sql": "SELECT SUM(total) AS revenue FROM orders", "explanation": "Adds up order totals"}"#,
        )
        .on(
            "Summarize this domain model",
            r#"{"summary": "Users place orders.", "domains": ["sales"]}"#,
        )
}
