use std::fmt;

use crate::error::{Result, StreamError};
use crate::stream::Value;

/// SQL text with positional `?` placeholders and the values bound to them.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    pub text: String,
    pub parameters: Vec<Value>,
}

impl SqlFragment {
    pub fn new(text: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            parameters,
        }
    }

    /// A fragment without bound values.
    pub fn raw(text: impl Into<String>) -> Self {
        Self::new(text, Vec::new())
    }

    /// Check that every placeholder outside quoted regions has exactly one
    /// bound value.
    pub fn check_alignment(&self) -> Result<()> {
        let count = placeholder_offsets(&self.text).len();
        if count != self.parameters.len() {
            return Err(StreamError::TranslationInvariant(format!(
                "{} placeholders but {} parameters in `{}`",
                count,
                self.parameters.len(),
                self.text
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SqlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Byte offsets of `?` placeholders that sit outside string literals and
/// quoted identifiers. Quote characters are matched pairwise, so a doubled
/// quote inside a quoted region is handled by leaving and re-entering it.
pub fn placeholder_offsets(sql: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut closing: Option<char> = None;
    for (i, ch) in sql.char_indices() {
        match closing {
            Some(end) if ch == end => closing = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => closing = Some(ch),
                '[' => closing = Some(']'),
                '?' => offsets.push(i),
                _ => {}
            },
        }
    }
    offsets
}

/// Rewrite `?` placeholders into `$1`, `$2`, ... for engines that number
/// their parameters.
pub fn number_placeholders(sql: &str) -> String {
    let offsets = placeholder_offsets(sql);
    let mut out = String::with_capacity(sql.len() + offsets.len() * 2);
    let mut last = 0;
    for (n, offset) in offsets.iter().enumerate() {
        out.push_str(&sql[last..*offset]);
        out.push('$');
        out.push_str(&(n + 1).to_string());
        last = offset + 1;
    }
    out.push_str(&sql[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_skip_quoted_regions() {
        let sql = r#"SELECT "a?" FROM t WHERE x = ? AND y = '?' AND `z?` = ?"#;
        assert_eq!(placeholder_offsets(sql).len(), 2);
    }

    #[test]
    fn test_doubled_quotes() {
        let sql = "SELECT 'it''s ?' , ?";
        assert_eq!(placeholder_offsets(sql).len(), 1);
    }

    #[test]
    fn test_glob_brackets_are_not_placeholders() {
        assert_eq!(placeholder_offsets("x GLOB ? AND y = '[?]'").len(), 1);
    }

    #[test]
    fn test_number_placeholders() {
        assert_eq!(
            number_placeholders(r#"SELECT "?" FROM t WHERE a = ? AND b IN (?, ?)"#),
            r#"SELECT "?" FROM t WHERE a = $1 AND b IN ($2, $3)"#
        );
    }

    #[test]
    fn test_alignment_mismatch_is_invariant_error() {
        let frag = SqlFragment::new("a = ? AND b = ?", vec![Value::Int(1)]);
        let err = frag.check_alignment().unwrap_err();
        assert!(matches!(err, StreamError::TranslationInvariant(_)));
        assert!(SqlFragment::new("a = ?", vec![Value::Int(1)])
            .check_alignment()
            .is_ok());
    }
}
