//! Schema Introspection Module
//!
//! Read-only facts about the target database: tables, columns, primary keys
//! and foreign keys. The pipeline never writes to the target; it only captures
//! snapshots through a [`SchemaSource`].

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

use crate::models::ColumnLocation;

/// Complete schema snapshot at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub id: Uuid,
    pub ontology_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<Table>,
    pub foreign_keys: Vec<ForeignKey>,
    pub checksum: String,
}

impl SchemaSnapshot {
    pub fn new(ontology_id: Uuid, tables: Vec<Table>, foreign_keys: Vec<ForeignKey>) -> Self {
        let checksum = Self::compute_checksum(&tables, &foreign_keys);
        Self {
            id: Uuid::new_v4(),
            ontology_id,
            captured_at: Utc::now(),
            tables,
            foreign_keys,
            checksum,
        }
    }

    /// Compute checksum from schema content
    pub fn compute_checksum(tables: &[Table], foreign_keys: &[ForeignKey]) -> String {
        let mut hasher = Sha256::new();

        // Sorted so that catalog ordering does not change the checksum
        let mut lines: BTreeSet<String> = BTreeSet::new();
        for table in tables {
            lines.insert(format!("T:{}.{}", table.schema, table.name));
            for col in &table.columns {
                lines.insert(format!(
                    "C:{}.{}.{}:{}:{}",
                    table.schema, table.name, col.name, col.data_type, col.is_primary_key
                ));
            }
        }
        for fk in foreign_keys {
            lines.insert(format!(
                "FK:{}:{}.{}({})->{}.{}({})",
                fk.constraint_name,
                fk.source_schema,
                fk.source_table,
                fk.source_columns.join(","),
                fk.referenced_schema,
                fk.referenced_table,
                fk.referenced_columns.join(",")
            ));
        }
        for line in &lines {
            hasher.update(line.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }

    pub fn table(&self, schema: &str, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.schema == schema && t.name == name)
    }

    /// Look a table up by `name` or `schema.name`, case-insensitively, the way
    /// a query author would write it.
    pub fn find_table(&self, reference: &str) -> Option<&Table> {
        let reference = reference.trim_matches('"').to_lowercase();
        match reference.rsplit_once('.') {
            Some((schema, name)) => self.tables.iter().find(|t| {
                t.schema.to_lowercase() == schema.trim_matches('"')
                    && t.name.to_lowercase() == name.trim_matches('"')
            }),
            None => self
                .tables
                .iter()
                .find(|t| t.name.to_lowercase() == reference && t.schema == "public")
                .or_else(|| self.tables.iter().find(|t| t.name.to_lowercase() == reference)),
        }
    }

    pub fn column(&self, location: &ColumnLocation) -> Option<&Column> {
        self.table(&location.schema, &location.table)?.column(&location.column)
    }

    /// Error when a location is absent; signals a hallucination or a stale snapshot
    pub fn require_location(&self, location: &ColumnLocation) -> Result<&Column, AppError> {
        self.column(location).ok_or_else(|| {
            AppError::SchemaMismatch(format!("column {} does not exist in snapshot {}", location, self.id))
        })
    }

    /// Foreign keys declared on a table
    pub fn foreign_keys_from(&self, schema: &str, table: &str) -> impl Iterator<Item = &ForeignKey> {
        let schema = schema.to_string();
        let table = table.to_string();
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.source_schema == schema && fk.source_table == table)
    }
}

/// Table representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub schema: String,
    pub columns: Vec<Column>,
    pub primary_key: Option<PrimaryKey>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns, from the constraint or the column flags
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        match &self.primary_key {
            Some(pk) if !pk.columns.is_empty() => {
                pk.columns.iter().filter_map(|name| self.column(name)).collect()
            }
            _ => self.columns.iter().filter(|c| c.is_primary_key).collect(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn location(&self, column: &str) -> ColumnLocation {
        ColumnLocation::new(&self.schema, &self.name, column)
    }
}

/// Column representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub ordinal_position: i32,
}

impl Column {
    /// Coarse type family used to decide whether two columns can join
    pub fn type_family(&self) -> &'static str {
        let t = self.data_type.to_lowercase();
        if t.contains("int") || t.contains("serial") || t.contains("numeric") || t.contains("decimal") {
            "numeric"
        } else if t.contains("uuid") {
            "uuid"
        } else if t.contains("char") || t.contains("text") {
            "text"
        } else if t.contains("time") || t.contains("date") {
            "temporal"
        } else if t.contains("bool") {
            "boolean"
        } else {
            "other"
        }
    }
}

/// Primary key constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryKey {
    pub constraint_name: String,
    pub columns: Vec<String>,
}

/// Foreign key relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub constraint_name: String,
    pub source_schema: String,
    pub source_table: String,
    pub source_columns: Vec<String>,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// Read-only source of schema facts
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn capture(&self, ontology_id: Uuid) -> Result<SchemaSnapshot, AppError>;
}

/// A fixed snapshot, for seeded ontologies and tests
pub struct StaticSchemaSource {
    tables: Vec<Table>,
    foreign_keys: Vec<ForeignKey>,
}

impl StaticSchemaSource {
    pub fn new(tables: Vec<Table>, foreign_keys: Vec<ForeignKey>) -> Self {
        Self { tables, foreign_keys }
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn capture(&self, ontology_id: Uuid) -> Result<SchemaSnapshot, AppError> {
        Ok(SchemaSnapshot::new(ontology_id, self.tables.clone(), self.foreign_keys.clone()))
    }
}

/// Schema introspector for PostgreSQL
pub struct PostgresIntrospector {
    pool: Pool,
}

impl PostgresIntrospector {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Get all tables with columns
    async fn get_tables(client: &deadpool_postgres::Client) -> Result<Vec<Table>, AppError> {
        let table_query = r#"
            SELECT
                t.table_schema,
                t.table_name
            FROM information_schema.tables t
            WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')
              AND t.table_type = 'BASE TABLE'
            ORDER BY t.table_schema, t.table_name
        "#;

        let table_rows = client.query(table_query, &[]).await?;

        let mut tables = Vec::new();

        for row in table_rows {
            let schema: String = row.get("table_schema");
            let name: String = row.get("table_name");

            let columns = Self::get_columns(client, &schema, &name).await?;
            let primary_key = Self::get_primary_key(client, &schema, &name).await?;

            tables.push(Table {
                name,
                schema,
                columns,
                primary_key,
            });
        }

        Ok(tables)
    }

    /// Get columns for a table
    async fn get_columns(
        client: &deadpool_postgres::Client,
        schema: &str,
        table: &str,
    ) -> Result<Vec<Column>, AppError> {
        let query = r#"
            SELECT
                c.column_name,
                c.data_type,
                c.is_nullable,
                c.column_default,
                c.ordinal_position,
                COALESCE(
                    (SELECT true FROM information_schema.table_constraints tc
                     JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                     WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                     LIMIT 1),
                    false
                ) as is_primary_key,
                COALESCE(
                    (SELECT true FROM information_schema.table_constraints tc
                     JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                     WHERE tc.constraint_type = 'UNIQUE'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                     LIMIT 1),
                    false
                ) as is_unique
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;

        let rows = client.query(query, &[&schema, &table]).await?;

        let columns = rows
            .iter()
            .map(|row| Column {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get::<_, String>("is_nullable") == "YES",
                default_value: row.get("column_default"),
                ordinal_position: row.get("ordinal_position"),
                is_primary_key: row.get("is_primary_key"),
                is_unique: row.get("is_unique"),
            })
            .collect();

        Ok(columns)
    }

    /// Get primary key for a table
    async fn get_primary_key(
        client: &deadpool_postgres::Client,
        schema: &str,
        table: &str,
    ) -> Result<Option<PrimaryKey>, AppError> {
        let query = r#"
            SELECT
                tc.constraint_name,
                COALESCE(array_agg(kcu.column_name::text ORDER BY kcu.ordinal_position), ARRAY[]::text[]) as columns
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = $1
                AND tc.table_name = $2
            GROUP BY tc.constraint_name
        "#;

        let rows = client.query(query, &[&schema, &table]).await?;

        if let Some(row) = rows.first() {
            let constraint_name: String = row.get("constraint_name");
            let columns: Vec<String> = row.try_get("columns").unwrap_or_default();
            Ok(Some(PrimaryKey {
                constraint_name,
                columns,
            }))
        } else {
            Ok(None)
        }
    }

    /// Get all foreign keys
    async fn get_foreign_keys(client: &deadpool_postgres::Client) -> Result<Vec<ForeignKey>, AppError> {
        let query = r#"
            SELECT
                tc.constraint_name,
                tc.table_schema as source_schema,
                tc.table_name as source_table,
                COALESCE(array_agg(kcu.column_name::text ORDER BY kcu.ordinal_position), ARRAY[]::text[]) as source_columns,
                ccu.table_schema as referenced_schema,
                ccu.table_name as referenced_table,
                COALESCE(array_agg(ccu.column_name::text ORDER BY kcu.ordinal_position), ARRAY[]::text[]) as referenced_columns
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
                AND tc.table_schema NOT IN ('pg_catalog', 'information_schema')
            GROUP BY
                tc.constraint_name,
                tc.table_schema,
                tc.table_name,
                ccu.table_schema,
                ccu.table_name
            ORDER BY tc.table_schema, tc.table_name, tc.constraint_name
        "#;

        let rows = client.query(query, &[]).await?;

        let foreign_keys = rows
            .iter()
            .map(|row| ForeignKey {
                constraint_name: row.get("constraint_name"),
                source_schema: row.get("source_schema"),
                source_table: row.get("source_table"),
                source_columns: row.try_get("source_columns").unwrap_or_default(),
                referenced_schema: row.get("referenced_schema"),
                referenced_table: row.get("referenced_table"),
                referenced_columns: row.try_get("referenced_columns").unwrap_or_default(),
            })
            .collect();

        Ok(foreign_keys)
    }
}

#[async_trait]
impl SchemaSource for PostgresIntrospector {
    /// Introspect the complete schema from a PostgreSQL database
    async fn capture(&self, ontology_id: Uuid) -> Result<SchemaSnapshot, AppError> {
        let client = self.pool.get().await?;

        let tables = Self::get_tables(&client).await?;
        let foreign_keys = Self::get_foreign_keys(&client).await?;

        let snapshot = SchemaSnapshot::new(ontology_id, tables, foreign_keys);

        debug!(
            "Introspected schema with {} tables, {} FKs",
            snapshot.tables.len(),
            snapshot.foreign_keys.len()
        );

        Ok(snapshot)
    }
}

/// Drift between two captures of the same database
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub has_drift: bool,
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub added_columns: Vec<String>,
    pub removed_columns: Vec<String>,
    pub modified_columns: Vec<String>,
}

/// Compare two schemas and detect drift
pub fn detect_drift(old: &SchemaSnapshot, new: &SchemaSnapshot) -> DriftReport {
    let mut report = DriftReport::default();
    if old.checksum == new.checksum {
        return report;
    }

    let old_tables: HashMap<String, &Table> = old.tables.iter().map(|t| (t.path(), t)).collect();
    let new_tables: HashMap<String, &Table> = new.tables.iter().map(|t| (t.path(), t)).collect();

    for (name, new_table) in &new_tables {
        let Some(old_table) = old_tables.get(name) else {
            report.added_tables.push(name.clone());
            continue;
        };
        for col in &new_table.columns {
            match old_table.column(&col.name) {
                None => report.added_columns.push(format!("{}.{}", name, col.name)),
                Some(old_col) if old_col.data_type != col.data_type || old_col.nullable != col.nullable => {
                    report.modified_columns.push(format!("{}.{}", name, col.name))
                }
                Some(_) => {}
            }
        }
        for col in &old_table.columns {
            if new_table.column(&col.name).is_none() {
                report.removed_columns.push(format!("{}.{}", name, col.name));
            }
        }
    }
    for name in old_tables.keys() {
        if !new_tables.contains_key(name) {
            report.removed_tables.push(name.clone());
        }
    }

    report.added_tables.sort();
    report.removed_tables.sort();
    report.added_columns.sort();
    report.removed_columns.sort();
    report.modified_columns.sort();
    report.has_drift = !(report.added_tables.is_empty()
        && report.removed_tables.is_empty()
        && report.added_columns.is_empty()
        && report.removed_columns.is_empty()
        && report.modified_columns.is_empty());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{column, orders_users_schema};

    #[test]
    fn test_checksum_consistency() {
        let (tables, fks) = orders_users_schema();
        let checksum1 = SchemaSnapshot::compute_checksum(&tables, &fks);

        let mut reversed = tables.clone();
        reversed.reverse();
        let checksum2 = SchemaSnapshot::compute_checksum(&reversed, &fks);

        assert_eq!(checksum1, checksum2);
    }

    #[test]
    fn test_find_table_by_name_or_path() {
        let (tables, fks) = orders_users_schema();
        let snapshot = SchemaSnapshot::new(Uuid::new_v4(), tables, fks);

        assert_eq!(snapshot.find_table("users").map(|t| t.name.as_str()), Some("users"));
        assert_eq!(snapshot.find_table("public.ORDERS").map(|t| t.name.as_str()), Some("orders"));
        assert!(snapshot.find_table("invoices").is_none());
    }

    #[test]
    fn test_require_location_reports_schema_mismatch() {
        let (tables, fks) = orders_users_schema();
        let snapshot = SchemaSnapshot::new(Uuid::new_v4(), tables, fks);

        assert!(snapshot.require_location(&ColumnLocation::new("public", "orders", "user_id")).is_ok());
        let err = snapshot
            .require_location(&ColumnLocation::new("public", "orders", "customer_id"))
            .unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch(_)));
    }

    #[test]
    fn test_detect_drift_added_column() {
        let (tables, fks) = orders_users_schema();
        let old = SchemaSnapshot::new(Uuid::new_v4(), tables.clone(), fks.clone());

        let mut changed = tables;
        changed[1].columns.push(column("email", "text", false));
        let new = SchemaSnapshot::new(old.ontology_id, changed, fks);

        let report = detect_drift(&old, &new);
        assert!(report.has_drift);
        assert_eq!(report.added_columns, vec!["public.users.email".to_string()]);
    }
}
