//! Error classification
//!
//! Deterministic pattern match over database error text. Never calls
//! generation. Type mismatches are tested first because Postgres reports some
//! of them as missing functions or operators.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TypeMismatch,
    MissingColumn,
    MissingTable,
    MissingFunction,
    Syntax,
    Other,
}

static TYPE_MISMATCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)operator does not exist|invalid input syntax for type|cannot cast type|is of type .+ but expression is of type|function (sum|avg|min|max|round|abs|floor|ceil|date_trunc|date_part|extract|lower|upper|length|stddev|variance)\([^)]*\) does not exist"#,
    )
    .unwrap()
});

static MISSING_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)column "?[\w.]+"? (of relation "?\w+"? )?does not exist"#).unwrap());

static MISSING_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(relation|table) "?[\w.]+"? does not exist|missing FROM-clause entry"#).unwrap());

static MISSING_FUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)function [\w.]+\(.*\) does not exist"#).unwrap());

static SYNTAX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)syntax error|sql parser error|unterminated|expected exactly one statement"#).unwrap());

impl ErrorClass {
    pub fn classify(error: &str) -> ErrorClass {
        if TYPE_MISMATCH.is_match(error) {
            ErrorClass::TypeMismatch
        } else if MISSING_COLUMN.is_match(error) {
            ErrorClass::MissingColumn
        } else if MISSING_TABLE.is_match(error) {
            ErrorClass::MissingTable
        } else if MISSING_FUNCTION.is_match(error) {
            ErrorClass::MissingFunction
        } else if SYNTAX.is_match(error) {
            ErrorClass::Syntax
        } else {
            ErrorClass::Other
        }
    }

    /// Repair guidance included in the retry prompt
    pub fn hint(self) -> &'static str {
        match self {
            ErrorClass::TypeMismatch => {
                "A value or function argument has the wrong type. Check the column types listed above \
and add explicit casts, or aggregate a numeric column instead of a text one."
            }
            ErrorClass::MissingColumn => {
                "A referenced column does not exist. Use only the columns listed above, qualified with \
the right table alias."
            }
            ErrorClass::MissingTable => {
                "A referenced table does not exist. Use only tables from the schema, with their schema \
prefix when it is not public."
            }
            ErrorClass::MissingFunction => {
                "The function does not exist in PostgreSQL. Replace it with a built-in such as \
date_trunc, extract, coalesce or an aggregate."
            }
            ErrorClass::Syntax => {
                "The statement does not parse. Return exactly one PostgreSQL SELECT statement with no \
trailing text."
            }
            ErrorClass::Other => "Fix the error above and keep the query to a single read-only SELECT.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_postgres_messages() {
        let cases = [
            (r#"column "order_total" does not exist"#, ErrorClass::MissingColumn),
            (r#"column o.customer_id does not exist"#, ErrorClass::MissingColumn),
            (r#"relation "customers" does not exist"#, ErrorClass::MissingTable),
            ("function sum(text) does not exist", ErrorClass::TypeMismatch),
            ("operator does not exist: text = integer", ErrorClass::TypeMismatch),
            ("function datediff(unknown, unknown) does not exist", ErrorClass::MissingFunction),
            ("syntax error at or near \"FORM\"", ErrorClass::Syntax),
            ("permission denied for table orders", ErrorClass::Other),
        ];
        for (message, expected) in cases {
            assert_eq!(ErrorClass::classify(message), expected, "{}", message);
        }
    }
}
