//! Column locations

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified column: `schema.table.column`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnLocation {
    pub schema: String,
    pub table: String,
    pub column: String,
}

impl ColumnLocation {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            column: column.into(),
        }
    }

    /// `schema.table`
    pub fn table_path(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Parse `schema.table.column`, or `table.column` in the `public` schema
    pub fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.split('.').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [schema, table, column] => Some(Self::new(*schema, *table, *column)),
            [table, column] => Some(Self::new("public", *table, *column)),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.table, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_two_and_three_parts() {
        let loc = ColumnLocation::parse("orders.user_id").unwrap();
        assert_eq!(loc, ColumnLocation::new("public", "orders", "user_id"));
        assert_eq!(loc.to_string(), "public.orders.user_id");

        let loc = ColumnLocation::parse("billing.invoices.id").unwrap();
        assert_eq!(loc.table_path(), "billing.invoices");

        assert!(ColumnLocation::parse("orders").is_none());
        assert!(ColumnLocation::parse("a..b").is_none());
    }
}
