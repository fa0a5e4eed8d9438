//! Declarative field predicates.
//!
//! A [`PredicateSpec`] is the unit the dialect layer translates into a WHERE
//! clause fragment. The same predicate evaluates in memory with SQL three-valued
//! logic, so a filter produces identical results whether it runs in the
//! engine or on fetched records.

use regex::Regex;
use std::cmp::Ordering;
use std::sync::Arc;

use super::value::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Like,
    StartsWith,
    EndsWith,
    Contains,
    EqualIgnoreCase,
    RegexMatch,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Between => "between",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::IsNull => "is null",
            Operator::IsNotNull => "is not null",
            Operator::Like => "like",
            Operator::StartsWith => "starts with",
            Operator::EndsWith => "ends with",
            Operator::Contains => "contains",
            Operator::EqualIgnoreCase => "equals ignore case",
            Operator::RegexMatch => "matches",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Single(Value),
    Pair(Value, Value),
    List(Vec<Value>),
}

#[derive(Debug, Clone)]
pub struct PredicateSpec {
    field: String,
    operator: Operator,
    operand: Operand,
    regex: Option<Arc<Regex>>,
}

impl PartialEq for PredicateSpec {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.operator == other.operator && self.operand == other.operand
    }
}

impl PredicateSpec {
    fn single(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            operand: Operand::Single(value.into()),
            regex: None,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, Operator::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, Operator::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, Operator::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, Operator::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, Operator::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, Operator::Ge, value)
    }

    /// Inclusive on both ends.
    pub fn between(
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator: Operator::Between,
            operand: Operand::Pair(low.into(), high.into()),
            regex: None,
        }
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::In,
            operand: Operand::List(values.into_iter().map(Into::into).collect()),
            regex: None,
        }
    }

    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::NotIn,
            operand: Operand::List(values.into_iter().map(Into::into).collect()),
            regex: None,
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::IsNull,
            operand: Operand::None,
            regex: None,
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::IsNotNull,
            operand: Operand::None,
            regex: None,
        }
    }

    /// SQL LIKE pattern: `%` and `_` are wildcards, `\` escapes.
    /// Matching is case-sensitive.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::single(field, Operator::Like, pattern.into())
    }

    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::single(field, Operator::StartsWith, prefix.into())
    }

    pub fn ends_with(field: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::single(field, Operator::EndsWith, suffix.into())
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::single(field, Operator::Contains, needle.into())
    }

    /// ASCII case-insensitive equality.
    pub fn equal_ignore_case(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::single(field, Operator::EqualIgnoreCase, value.into())
    }

    /// Regular expression match anywhere in the value.
    pub fn matches(
        field: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern)?;
        Ok(Self {
            field: field.into(),
            operator: Operator::RegexMatch,
            operand: Operand::Single(Value::Text(pattern)),
            regex: Some(Arc::new(regex)),
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    /// Every value carried by the operand, in order.
    pub fn operand_values(&self) -> Vec<&Value> {
        match &self.operand {
            Operand::None => vec![],
            Operand::Single(v) => vec![v],
            Operand::Pair(a, b) => vec![a, b],
            Operand::List(vs) => vs.iter().collect(),
        }
    }

    /// Three-valued evaluation: `None` is SQL UNKNOWN.
    pub fn evaluate(&self, record: &Record) -> Option<bool> {
        let value = record.value(&self.field);
        match (&self.operator, &self.operand) {
            (Operator::IsNull, _) => Some(value.is_null()),
            (Operator::IsNotNull, _) => Some(!value.is_null()),
            (Operator::Eq, Operand::Single(v)) => value.sql_cmp(v).map(Ordering::is_eq),
            (Operator::Ne, Operand::Single(v)) => value.sql_cmp(v).map(Ordering::is_ne),
            (Operator::Lt, Operand::Single(v)) => value.sql_cmp(v).map(Ordering::is_lt),
            (Operator::Le, Operand::Single(v)) => value.sql_cmp(v).map(Ordering::is_le),
            (Operator::Gt, Operand::Single(v)) => value.sql_cmp(v).map(Ordering::is_gt),
            (Operator::Ge, Operand::Single(v)) => value.sql_cmp(v).map(Ordering::is_ge),
            (Operator::Between, Operand::Pair(low, high)) => and3(
                value.sql_cmp(low).map(Ordering::is_ge),
                value.sql_cmp(high).map(Ordering::is_le),
            ),
            (Operator::In, Operand::List(list)) => in_list(value, list),
            (Operator::NotIn, Operand::List(list)) => in_list(value, list).map(|b| !b),
            (Operator::Like, Operand::Single(Value::Text(p))) => {
                value.as_str().map(|s| like_match(s, p))
            }
            (Operator::StartsWith, Operand::Single(Value::Text(p))) => {
                value.as_str().map(|s| s.starts_with(p.as_str()))
            }
            (Operator::EndsWith, Operand::Single(Value::Text(p))) => {
                value.as_str().map(|s| s.ends_with(p.as_str()))
            }
            (Operator::Contains, Operand::Single(Value::Text(p))) => {
                value.as_str().map(|s| s.contains(p.as_str()))
            }
            (Operator::EqualIgnoreCase, Operand::Single(Value::Text(p))) => {
                value.as_str().map(|s| s.eq_ignore_ascii_case(p))
            }
            (Operator::RegexMatch, _) => match (&self.regex, value.as_str()) {
                (Some(re), Some(s)) => Some(re.is_match(s)),
                _ => None,
            },
            _ => None,
        }
    }

    /// True only when the predicate evaluates to TRUE (UNKNOWN filters out).
    pub fn test(&self, record: &Record) -> bool {
        self.evaluate(record) == Some(true)
    }
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn in_list(value: &Value, list: &[Value]) -> Option<bool> {
    let mut unknown = false;
    for item in list {
        match value.sql_cmp(item) {
            Some(Ordering::Equal) => return Some(true),
            Some(_) => {}
            None => unknown = true,
        }
    }
    if unknown {
        None
    } else {
        Some(false)
    }
}

/// Case-sensitive LIKE with `\` as escape character. A trailing lone `\`
/// matches itself.
pub fn like_match(text: &str, pattern: &str) -> bool {
    #[derive(Clone, Copy)]
    enum Token {
        Any,
        One,
        Char(char),
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            '\\' => Token::Char(chars.next().unwrap_or('\\')),
            other => Token::Char(other),
        });
    }

    let text: Vec<char> = text.chars().collect();
    // matched[j]: the first i chars of text match the first j tokens
    let mut matched = vec![false; tokens.len() + 1];
    matched[0] = true;
    for (j, token) in tokens.iter().enumerate() {
        if matches!(token, Token::Any) {
            matched[j + 1] = matched[j];
        }
    }
    for ch in &text {
        let mut next = vec![false; tokens.len() + 1];
        for (j, token) in tokens.iter().enumerate() {
            next[j + 1] = match token {
                Token::Any => next[j] || matched[j + 1],
                Token::One => matched[j],
                Token::Char(c) => matched[j] && c == ch,
            };
        }
        matched = next;
    }
    matched[tokens.len()]
}
