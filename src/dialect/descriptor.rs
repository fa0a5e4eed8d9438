use std::collections::BTreeSet;

use crate::error::{Result, StreamError};

/// Static facts about one database engine: quoting, connection scheme,
/// schema handling and paging quirks.
#[derive(Debug, Clone, PartialEq)]
pub struct DialectDescriptor {
    name: String,
    default_port: Option<u16>,
    url_scheme: String,
    has_named_schemas: bool,
    identifier_quote: (char, char),
    string_quote: (char, char),
    schema_exclude_set: BTreeSet<String>,
    driver_name: String,
    initial_query: String,
    nulls_sort_low: bool,
    offset_without_limit: Option<String>,
}

impl DialectDescriptor {
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            default_port: None,
            url_scheme: String::new(),
            has_named_schemas: false,
            identifier_quote: None,
            string_quote: None,
            schema_exclude_set: BTreeSet::new(),
            driver_name: String::new(),
            initial_query: String::new(),
            nulls_sort_low: true,
            offset_without_limit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_port(&self) -> Option<u16> {
        self.default_port
    }

    pub fn url_scheme(&self) -> &str {
        &self.url_scheme
    }

    pub fn has_named_schemas(&self) -> bool {
        self.has_named_schemas
    }

    pub fn identifier_quote(&self) -> (char, char) {
        self.identifier_quote
    }

    pub fn string_quote(&self) -> (char, char) {
        self.string_quote
    }

    pub fn schema_exclude_set(&self) -> &BTreeSet<String> {
        &self.schema_exclude_set
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Statement run right after connecting, usually a version probe.
    pub fn initial_query(&self) -> &str {
        &self.initial_query
    }

    /// Whether the engine orders `NULL` below every value in both
    /// directions without an explicit `NULLS FIRST/LAST`.
    pub fn nulls_sort_low(&self) -> bool {
        self.nulls_sort_low
    }

    /// LIMIT value to emit when only an OFFSET is wanted, for engines that
    /// reject a bare OFFSET.
    pub fn offset_without_limit(&self) -> Option<&str> {
        self.offset_without_limit.as_deref()
    }

    /// Quote an identifier. The closing quote character is doubled.
    pub fn quote(&self, identifier: &str) -> String {
        let (start, end) = self.identifier_quote;
        let mut out = String::with_capacity(identifier.len() + 2);
        out.push(start);
        for ch in identifier.chars() {
            if ch == end {
                out.push(end);
            }
            out.push(ch);
        }
        out.push(end);
        out
    }

    /// Inverse of [`DialectDescriptor::quote`]. Input that is not wrapped in
    /// this dialect's quotes is returned unchanged.
    pub fn unquote(&self, quoted: &str) -> String {
        let (start, end) = self.identifier_quote;
        let inner = quoted
            .strip_prefix(start)
            .and_then(|rest| rest.strip_suffix(end));
        match inner {
            Some(inner) => {
                let doubled = format!("{end}{end}");
                inner.replace(&doubled, &end.to_string())
            }
            _ => quoted.to_string(),
        }
    }

    /// Render a string literal with the closing quote doubled.
    pub fn quote_string(&self, literal: &str) -> String {
        let (start, end) = self.string_quote;
        let mut out = String::with_capacity(literal.len() + 2);
        out.push(start);
        for ch in literal.chars() {
            if ch == end {
                out.push(end);
            }
            out.push(ch);
        }
        out.push(end);
        out
    }

    /// Schemas hidden from browsing (system catalogs and the like).
    pub fn is_schema_excluded(&self, name: &str) -> bool {
        self.schema_exclude_set
            .iter()
            .any(|s| s.eq_ignore_ascii_case(name))
    }
}

pub struct DescriptorBuilder {
    name: String,
    default_port: Option<u16>,
    url_scheme: String,
    has_named_schemas: bool,
    identifier_quote: Option<(char, char)>,
    string_quote: Option<(char, char)>,
    schema_exclude_set: BTreeSet<String>,
    driver_name: String,
    initial_query: String,
    nulls_sort_low: bool,
    offset_without_limit: Option<String>,
}

impl DescriptorBuilder {
    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    pub fn url_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.url_scheme = scheme.into();
        self
    }

    pub fn named_schemas(mut self, enabled: bool) -> Self {
        self.has_named_schemas = enabled;
        self
    }

    pub fn identifier_quote(mut self, start: char, end: char) -> Self {
        self.identifier_quote = Some((start, end));
        self
    }

    pub fn string_quote(mut self, start: char, end: char) -> Self {
        self.string_quote = Some((start, end));
        self
    }

    pub fn exclude_schemas<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema_exclude_set
            .extend(schemas.into_iter().map(Into::into));
        self
    }

    pub fn driver_name(mut self, driver: impl Into<String>) -> Self {
        self.driver_name = driver.into();
        self
    }

    pub fn initial_query(mut self, query: impl Into<String>) -> Self {
        self.initial_query = query.into();
        self
    }

    pub fn nulls_sort_low(mut self, low: bool) -> Self {
        self.nulls_sort_low = low;
        self
    }

    pub fn offset_without_limit(mut self, sentinel: impl Into<String>) -> Self {
        self.offset_without_limit = Some(sentinel.into());
        self
    }

    pub fn build(self) -> Result<DialectDescriptor> {
        if self.name.trim().is_empty() {
            return Err(StreamError::configuration("dialect", "empty dialect name"));
        }
        let missing = |what: &str| StreamError::configuration(&self.name, format!("missing {what}"));
        if self.url_scheme.is_empty() {
            return Err(missing("url scheme"));
        }
        if self.driver_name.is_empty() {
            return Err(missing("driver name"));
        }
        let identifier_quote = self
            .identifier_quote
            .ok_or_else(|| missing("identifier quotes"))?;
        let string_quote = self.string_quote.ok_or_else(|| missing("string quotes"))?;
        if let Some(sentinel) = &self.offset_without_limit {
            if sentinel.parse::<i128>().is_err() {
                return Err(StreamError::configuration(
                    &self.name,
                    format!("offset sentinel `{sentinel}` is not an integer"),
                ));
            }
        }
        Ok(DialectDescriptor {
            name: self.name,
            default_port: self.default_port,
            url_scheme: self.url_scheme,
            has_named_schemas: self.has_named_schemas,
            identifier_quote,
            string_quote,
            schema_exclude_set: self.schema_exclude_set,
            driver_name: self.driver_name,
            initial_query: self.initial_query,
            nulls_sort_low: self.nulls_sort_low,
            offset_without_limit: self.offset_without_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backtick() -> DialectDescriptor {
        DialectDescriptor::builder("MySQL")
            .url_scheme("mysql")
            .driver_name("mysql")
            .identifier_quote('`', '`')
            .string_quote('\'', '\'')
            .exclude_schemas(["information_schema", "mysql"])
            .build()
            .unwrap()
    }

    fn brackets() -> DialectDescriptor {
        DialectDescriptor::builder("Brackets")
            .url_scheme("br")
            .driver_name("br")
            .identifier_quote('[', ']')
            .string_quote('\'', '\'')
            .build()
            .unwrap()
    }

    #[test]
    fn test_quote_doubles_closing_quote() {
        assert_eq!(backtick().quote("a`b"), "`a``b`");
        assert_eq!(brackets().quote("a]b[c"), "[a]]b[c]");
    }

    #[test]
    fn test_unquote() {
        let d = backtick();
        assert_eq!(d.unquote("`a``b`"), "a`b");
        assert_eq!(d.unquote("plain"), "plain");
        assert_eq!(d.unquote("`"), "`");
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(backtick().quote_string("it's"), "'it''s'");
    }

    #[test]
    fn test_schema_exclusion_is_case_insensitive() {
        let d = backtick();
        assert!(d.is_schema_excluded("INFORMATION_SCHEMA"));
        assert!(!d.is_schema_excluded("app"));
    }

    #[test]
    fn test_missing_quotes_fail() {
        let err = DialectDescriptor::builder("X")
            .url_scheme("x")
            .driver_name("x")
            .string_quote('\'', '\'')
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("identifier quotes"));
    }

    #[test]
    fn test_empty_name_fails() {
        assert!(DialectDescriptor::builder(" ")
            .url_scheme("x")
            .driver_name("x")
            .identifier_quote('"', '"')
            .string_quote('\'', '\'')
            .build()
            .is_err());
    }

    #[test]
    fn test_bad_offset_sentinel_fails() {
        assert!(DialectDescriptor::builder("X")
            .url_scheme("x")
            .driver_name("x")
            .identifier_quote('"', '"')
            .string_quote('\'', '\'')
            .offset_without_limit("all")
            .build()
            .is_err());
    }

    proptest! {
        #[test]
        fn prop_quote_round_trip(s in "\\PC*") {
            for d in [backtick(), brackets()] {
                let quoted = d.quote(&s);
                prop_assert_eq!(d.unquote(&quoted), s.clone());
                prop_assert_eq!(d.quote(&d.unquote(&quoted)), quoted);
            }
        }
    }
}
