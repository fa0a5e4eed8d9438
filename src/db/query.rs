use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::error::Error as StdError;
use std::fmt;
use tokio_postgres::{types::Type, Row};

use crate::stream::Value;

/// Categorized error types for statement failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// A driver failure with whatever context the engine reported.
#[derive(Debug, Clone)]
pub struct StructuredError {
    pub category: ErrorCategory,
    /// SQLSTATE error code (e.g., "42601" for syntax_error), empty if unknown
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    /// 1-based line and column of the error position within the statement
    pub line: Option<usize>,
    pub col: Option<usize>,
}

impl StructuredError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        StructuredError {
            category,
            code: String::new(),
            message: message.into(),
            detail: None,
            hint: None,
            table: None,
            column: None,
            constraint: None,
            line: None,
            col: None,
        }
    }

    /// An uncategorized error from a plain message.
    pub fn from_string(msg: String) -> Self {
        Self::new(ErrorCategory::Unknown, msg)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Build from a tokio_postgres error, using the statement text to turn
    /// the reported byte position into line/column.
    pub fn from_pg_error(err: &tokio_postgres::Error, sql: &str) -> Self {
        let Some(db_err) = err.as_db_error() else {
            // Non-database error (connection, protocol, etc.)
            let category = if err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            let mut structured = Self::new(category, err.to_string());
            structured.detail = err.source().map(|e| e.to_string());
            return structured;
        };

        let code = db_err.code().code().to_string();
        let position = db_err.position().and_then(|p| match p {
            tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
            tokio_postgres::error::ErrorPosition::Internal { .. } => None,
        });
        let (line, col) = match position {
            Some(pos) => byte_offset_to_line_col(sql, pos as usize),
            None => (None, None),
        };

        StructuredError {
            category: categorize_sqlstate(&code),
            code,
            message: db_err.message().to_string(),
            detail: db_err.detail().map(|s| s.to_string()),
            hint: db_err.hint().map(|s| s.to_string()),
            table: db_err.table().map(|s| s.to_string()),
            column: db_err.column().map(|s| s.to_string()),
            constraint: db_err.constraint().map(|s| s.to_string()),
            line,
            col,
        }
    }

    /// Multi-line rendering for terminal output.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if let (Some(line), Some(col)) = (self.line, self.col) {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }
        match (&self.table, &self.column) {
            (Some(table), Some(column)) => lines.push(format!("  Object: {}.{}", table, column)),
            (Some(table), None) => lines.push(format!("  Table: {}", table)),
            _ => {}
        }
        if let Some(constraint) = &self.constraint {
            lines.push(format!("  Constraint: {}", constraint));
        }

        lines.join("\n")
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for StructuredError {}

/// Convert a 1-based byte offset in a statement to (line, column), both 1-based.
fn byte_offset_to_line_col(sql: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || sql.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(sql.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in sql.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub(crate) fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // 42601 = syntax_error; the rest of class 42 is undefined objects,
        // privileges and the like
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Decode one column of a PostgreSQL row into a [`Value`].
///
/// Integer widths collapse to `Int`, `timestamptz` is normalized to UTC and
/// JSON is carried as its text form. Unlisted types are read as text.
pub fn decode_value(row: &Row, idx: usize, pg_type: &Type) -> Result<Value, tokio_postgres::Error> {
    let value = match *pg_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::Timestamp(v.naive_utc())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        _ => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_error_category_display() {
        assert_eq!(ErrorCategory::Syntax.to_string(), "Syntax Error");
        assert_eq!(ErrorCategory::Semantic.to_string(), "Semantic Error");
        assert_eq!(ErrorCategory::Execution.to_string(), "Execution Error");
        assert_eq!(ErrorCategory::Transaction.to_string(), "Transaction Error");
        assert_eq!(ErrorCategory::Connection.to_string(), "Connection Error");
        assert_eq!(ErrorCategory::Unknown.to_string(), "Error");
    }

    #[test]
    fn test_structured_error_from_string() {
        let err = StructuredError::from_string("test error".into());
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert_eq!(err.message, "test error");
        assert_eq!(err.to_string(), "test error");
        assert!(err.detail.is_none());
        assert!(err.line.is_none());
    }

    #[test]
    fn test_structured_error_display_full() {
        let mut err = StructuredError::new(ErrorCategory::Semantic, "column \"agee\" does not exist")
            .with_code("42703")
            .with_table("people")
            .with_column("agee");
        err.hint = Some("Perhaps you meant to reference the column \"age\".".into());
        err.line = Some(1);
        err.col = Some(8);
        let full = err.display_full();
        assert!(full.starts_with("Semantic Error: column"));
        assert!(full.contains("at line 1, column 8"));
        assert!(full.contains("SQLSTATE: 42703"));
        assert!(full.contains("Object: people.agee"));
        assert!(full.contains("Perhaps you meant"));
    }

    #[test]
    fn test_byte_offset_to_line_col() {
        let sql = "SELECT *\nFROM users\nWHERE id = 1";
        assert_eq!(byte_offset_to_line_col(sql, 1), (Some(1), Some(1)));
        assert_eq!(byte_offset_to_line_col(sql, 10), (Some(2), Some(1)));
        assert_eq!(byte_offset_to_line_col(sql, 21), (Some(3), Some(1)));
    }

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("42703"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("23505"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("22012"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("25001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate("4"), ErrorCategory::Unknown);
    }
}
