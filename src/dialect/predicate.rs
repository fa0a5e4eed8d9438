//! Per-dialect translation of [`PredicateSpec`]s into WHERE fragments and of
//! sort keys into ORDER BY terms.
//!
//! A translation is only produced when the engine evaluates the predicate
//! exactly like [`PredicateSpec::evaluate`] does in memory. Text comparisons
//! are forced to byte order, and operand kinds must match the column kind so
//! the engine applies no implicit conversion.
//!
//! Regular expressions are pushed only when they stay inside a small subset
//! the engines and the `regex` crate read the same way, see
//! [`is_portable_regex`].

use super::descriptor::DialectDescriptor;
use super::fragment::SqlFragment;
use super::Dbms;
use crate::stream::{FieldDef, FieldKind, Operand, Operator, PredicateSpec, SortKey, Value};

/// Outcome of translating one predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Expressible(SqlFragment),
    NotExpressible(&'static str),
}

impl Translation {
    pub fn is_expressible(&self) -> bool {
        matches!(self, Translation::Expressible(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PredicateView<'a> {
    dbms: Dbms,
    descriptor: &'a DialectDescriptor,
}

impl<'a> PredicateView<'a> {
    pub fn new(dbms: Dbms, descriptor: &'a DialectDescriptor) -> Self {
        Self { dbms, descriptor }
    }

    pub fn translate(&self, spec: &PredicateSpec, field: &FieldDef) -> Translation {
        let column = self.descriptor.quote(&field.column);
        let text = field.kind == FieldKind::Text;

        if !spec.operand_values().iter().all(|v| field.kind.accepts(v)) {
            return Translation::NotExpressible("operand kind does not match column kind");
        }

        match spec.operator() {
            Operator::IsNull => self.bare(format!("{column} IS NULL")),
            Operator::IsNotNull => self.bare(format!("{column} IS NOT NULL")),
            Operator::Eq | Operator::Ne => {
                let op = if spec.operator() == Operator::Eq { "=" } else { "<>" };
                self.single(spec, format!("{} {op} ?", self.compare_lhs(&column, text, false)))
            }
            Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
                let op = spec.operator().symbol();
                self.single(spec, format!("{} {op} ?", self.compare_lhs(&column, text, true)))
            }
            Operator::Between => match spec.operand() {
                Operand::Pair(low, high) => Translation::Expressible(SqlFragment::new(
                    format!("{} BETWEEN ? AND ?", self.compare_lhs(&column, text, true)),
                    vec![low.clone(), high.clone()],
                )),
                _ => Translation::NotExpressible("malformed operand"),
            },
            Operator::In | Operator::NotIn => match spec.operand() {
                Operand::List(values) if values.is_empty() => {
                    if spec.operator() == Operator::In {
                        self.bare("1 = 0".to_string())
                    } else {
                        self.bare("1 = 1".to_string())
                    }
                }
                Operand::List(values) => {
                    let not = if spec.operator() == Operator::NotIn { "NOT " } else { "" };
                    let marks = vec!["?"; values.len()].join(", ");
                    Translation::Expressible(SqlFragment::new(
                        format!("{} {not}IN ({marks})", self.compare_lhs(&column, text, false)),
                        values.clone(),
                    ))
                }
                _ => Translation::NotExpressible("malformed operand"),
            },
            Operator::Like
            | Operator::StartsWith
            | Operator::EndsWith
            | Operator::Contains
            | Operator::EqualIgnoreCase
            | Operator::RegexMatch
                if !text =>
            {
                Translation::NotExpressible("text operator on non-text column")
            }
            Operator::Like => match self.dbms {
                Dbms::Sqlite => Translation::NotExpressible("LIKE ignores ASCII case on SQLite"),
                Dbms::PostgreSql | Dbms::MySql
                    if single_text(spec).is_some_and(ends_with_lone_escape) =>
                {
                    Translation::NotExpressible("LIKE pattern ends with an escape character")
                }
                _ => self.single(spec, self.like_clause(&column)),
            },
            Operator::StartsWith | Operator::EndsWith | Operator::Contains => {
                let Some(needle) = single_text(spec) else {
                    return Translation::NotExpressible("malformed operand");
                };
                let (prefix, suffix) = match spec.operator() {
                    Operator::StartsWith => (false, true),
                    Operator::EndsWith => (true, false),
                    _ => (true, true),
                };
                match self.dbms {
                    Dbms::Sqlite => {
                        let pattern = wrap(&escape_glob(needle), "*", prefix, suffix);
                        Translation::Expressible(SqlFragment::new(
                            format!("{column} GLOB ?"),
                            vec![Value::Text(pattern)],
                        ))
                    }
                    _ => {
                        let pattern = wrap(&escape_like(needle), "%", prefix, suffix);
                        Translation::Expressible(SqlFragment::new(
                            self.like_clause(&column),
                            vec![Value::Text(pattern)],
                        ))
                    }
                }
            }
            Operator::EqualIgnoreCase => {
                let Some(value) = single_text(spec) else {
                    return Translation::NotExpressible("malformed operand");
                };
                if !value.is_ascii() {
                    return Translation::NotExpressible("case folding is ASCII only");
                }
                // PostgreSQL and MySQL fold non-ASCII letters such as the
                // Kelvin sign to ASCII. A byte length equal to the operand's
                // keeps the column ASCII.
                let n = value.len();
                let clause = match self.dbms {
                    Dbms::PostgreSql => {
                        format!("LOWER({column}) = LOWER(?) AND OCTET_LENGTH({column}) = {n}")
                    }
                    Dbms::MySql => {
                        format!("BINARY LOWER({column}) = LOWER(?) AND LENGTH({column}) = {n}")
                    }
                    Dbms::Sqlite | Dbms::Memory => format!("LOWER({column}) = LOWER(?)"),
                };
                self.single(spec, clause)
            }
            Operator::RegexMatch
                if !single_text(spec).is_some_and(is_portable_regex) =>
            {
                Translation::NotExpressible("regular expression outside the portable subset")
            }
            Operator::RegexMatch => match self.dbms {
                Dbms::PostgreSql => self.single(spec, format!("{column} ~ ?")),
                Dbms::MySql => self.single(spec, format!("REGEXP_LIKE({column}, ?, 'c')")),
                Dbms::Sqlite | Dbms::Memory => {
                    Translation::NotExpressible("no regular expression operator")
                }
            },
        }
    }

    /// One ORDER BY term. `NULL` always sorts below every value.
    pub fn order_term(&self, key: &SortKey, field: &FieldDef) -> String {
        let column = self.descriptor.quote(&field.column);
        let mut term = self.compare_lhs(&column, field.kind == FieldKind::Text, true);
        term.push_str(if key.descending { " DESC" } else { " ASC" });
        if !self.descriptor.nulls_sort_low() {
            term.push_str(if key.descending { " NULLS LAST" } else { " NULLS FIRST" });
        }
        term
    }

    /// Column expression for a comparison. `ordering` marks range
    /// comparisons and sorts, where PostgreSQL needs a byte-order collation.
    fn compare_lhs(&self, column: &str, text: bool, ordering: bool) -> String {
        match (self.dbms, text) {
            (Dbms::MySql, true) => format!("BINARY {column}"),
            (Dbms::PostgreSql, true) if ordering => format!("{column} COLLATE \"C\""),
            _ => column.to_string(),
        }
    }

    /// LIKE matching characters with case and accents significant.
    fn like_clause(&self, column: &str) -> String {
        match self.dbms {
            Dbms::MySql => format!("{column} LIKE ? COLLATE utf8mb4_bin"),
            _ => format!("{column} LIKE ?"),
        }
    }

    fn single(&self, spec: &PredicateSpec, text: String) -> Translation {
        match spec.operand() {
            Operand::Single(v) => Translation::Expressible(SqlFragment::new(text, vec![v.clone()])),
            _ => Translation::NotExpressible("malformed operand"),
        }
    }

    fn bare(&self, text: String) -> Translation {
        Translation::Expressible(SqlFragment::raw(text))
    }
}

fn single_text(spec: &PredicateSpec) -> Option<&str> {
    match spec.operand() {
        Operand::Single(Value::Text(s)) => Some(s),
        _ => None,
    }
}

/// An odd run of trailing backslashes leaves the last one escaping nothing.
/// PostgreSQL rejects such a pattern.
fn ends_with_lone_escape(pattern: &str) -> bool {
    pattern.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

/// Whether `pattern` stays inside the regular expression subset on which
/// PostgreSQL, MySQL (ICU) and the `regex` crate agree.
///
/// The subset allows ASCII alphanumerics and plain punctuation, bracket
/// classes over alphanumerics and same-class ranges (optionally negated),
/// `^` as the first character, one `*`, `+` or `?` after an atom,
/// alternation and plain groups. Everything else (`.`, `$`, escapes,
/// counted repetition, non-ASCII) reads differently across engines.
pub fn is_portable_regex(pattern: &str) -> bool {
    let mut chars = pattern.chars().peekable();
    // One entry per open group: whether its current branch is still empty.
    let mut empty = vec![true];
    let mut quantifiable = false;
    let mut first = true;
    while let Some(ch) = chars.next() {
        let mut atom = true;
        match ch {
            '^' if first => atom = false,
            '*' | '+' | '?' => {
                if !quantifiable {
                    return false;
                }
                atom = false;
            }
            '|' => match empty.last_mut() {
                Some(branch) if !*branch => {
                    *branch = true;
                    quantifiable = false;
                    first = false;
                    continue;
                }
                _ => return false,
            },
            '(' => {
                if chars.peek() == Some(&'?') {
                    return false;
                }
                empty.push(true);
                quantifiable = false;
                first = false;
                continue;
            }
            ')' => {
                if empty.len() < 2 || empty.pop() == Some(true) {
                    return false;
                }
            }
            '[' => {
                if !portable_class(&mut chars) {
                    return false;
                }
            }
            c if c.is_ascii_alphanumeric() || " -_,:;@/=#%&!<>'\"~".contains(c) => {}
            _ => return false,
        }
        if let Some(branch) = empty.last_mut() {
            *branch = false;
        }
        quantifiable = atom;
        first = false;
    }
    empty.len() == 1 && !empty[0]
}

fn portable_class(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> bool {
    if chars.peek() == Some(&'^') {
        chars.next();
    }
    let mut members = 0;
    loop {
        match chars.next() {
            Some(']') if members > 0 => return true,
            Some(lo) if lo.is_ascii_alphanumeric() => {
                if chars.peek() == Some(&'-') {
                    chars.next();
                    match chars.next() {
                        Some(hi) if same_ascii_class(lo, hi) && lo <= hi => {}
                        _ => return false,
                    }
                }
                members += 1;
            }
            _ => return false,
        }
    }
}

fn same_ascii_class(a: char, b: char) -> bool {
    (a.is_ascii_digit() && b.is_ascii_digit())
        || (a.is_ascii_lowercase() && b.is_ascii_lowercase())
        || (a.is_ascii_uppercase() && b.is_ascii_uppercase())
}

fn wrap(escaped: &str, wildcard: &str, prefix: bool, suffix: bool) -> String {
    let mut out = String::with_capacity(escaped.len() + 2);
    if prefix {
        out.push_str(wildcard);
    }
    out.push_str(escaped);
    if suffix {
        out.push_str(wildcard);
    }
    out
}

/// Escape LIKE metacharacters with `\`.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Escape GLOB metacharacters by wrapping them in a character class.
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(ch);
                out.push(']');
            }
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::registry;
    use crate::stream::{like_match, Record};

    fn view(dbms: Dbms) -> PredicateView<'static> {
        registry().unwrap().get(dbms).unwrap().predicate_view()
    }

    fn name() -> FieldDef {
        FieldDef::new("name", FieldKind::Text).column("full_name")
    }

    fn age() -> FieldDef {
        FieldDef::new("age", FieldKind::Int)
    }

    fn fragment(t: Translation) -> SqlFragment {
        match t {
            Translation::Expressible(f) => f,
            Translation::NotExpressible(reason) => panic!("not expressible: {reason}"),
        }
    }

    #[test]
    fn test_numeric_comparison() {
        let f = fragment(view(Dbms::PostgreSql).translate(&PredicateSpec::gt("age", 18), &age()));
        assert_eq!(f.text, "\"age\" > ?");
        assert_eq!(f.parameters, vec![Value::Int(18)]);
    }

    #[test]
    fn test_text_comparison_is_byte_exact() {
        let spec = PredicateSpec::ge("name", "M");
        let mysql = fragment(view(Dbms::MySql).translate(&spec, &name()));
        assert_eq!(mysql.text, "BINARY `full_name` >= ?");
        let pg = fragment(view(Dbms::PostgreSql).translate(&spec, &name()));
        assert_eq!(pg.text, "\"full_name\" COLLATE \"C\" >= ?");
        let eq = fragment(view(Dbms::PostgreSql).translate(&PredicateSpec::eq("name", "M"), &name()));
        assert_eq!(eq.text, "\"full_name\" = ?");
        assert!(pg.check_alignment().is_ok());
    }

    #[test]
    fn test_kind_mismatch_not_expressible() {
        let t = view(Dbms::PostgreSql).translate(&PredicateSpec::eq("age", "18"), &age());
        assert!(!t.is_expressible());
        let float = FieldDef::new("score", FieldKind::Float);
        assert!(view(Dbms::PostgreSql)
            .translate(&PredicateSpec::lt("score", 3), &float)
            .is_expressible());
    }

    #[test]
    fn test_null_checks_bind_nothing() {
        let f = fragment(view(Dbms::MySql).translate(&PredicateSpec::is_null("age"), &age()));
        assert_eq!(f.text, "`age` IS NULL");
        assert!(f.parameters.is_empty());
    }

    #[test]
    fn test_in_lists() {
        let v = view(Dbms::Memory);
        let f = fragment(v.translate(&PredicateSpec::is_in("age", [1, 2, 3]), &age()));
        assert_eq!(f.text, "\"age\" IN (?, ?, ?)");
        assert_eq!(f.parameters.len(), 3);
        let empty_in = fragment(v.translate(&PredicateSpec::is_in("age", Vec::<i64>::new()), &age()));
        assert_eq!(empty_in.text, "1 = 0");
        let empty_not_in =
            fragment(v.translate(&PredicateSpec::not_in("age", Vec::<i64>::new()), &age()));
        assert_eq!(empty_not_in.text, "1 = 1");
    }

    #[test]
    fn test_starts_with_escapes_like_pattern() {
        let spec = PredicateSpec::starts_with("name", "50%_\\");
        let f = fragment(view(Dbms::PostgreSql).translate(&spec, &name()));
        assert_eq!(f.text, "\"full_name\" LIKE ?");
        let Value::Text(pattern) = &f.parameters[0] else { panic!() };
        assert_eq!(pattern, "50\\%\\_\\\\%");
        assert!(like_match("50%_\\ and more", pattern));
        assert!(!like_match("50x_\\", pattern));
    }

    #[test]
    fn test_sqlite_uses_glob() {
        let spec = PredicateSpec::contains("name", "a*b?[c");
        let f = fragment(view(Dbms::Sqlite).translate(&spec, &name()));
        assert_eq!(f.text, "\"full_name\" GLOB ?");
        assert_eq!(f.parameters, vec![Value::from("*a[*]b[?][[]c*")]);
        assert!(!view(Dbms::Sqlite)
            .translate(&PredicateSpec::like("name", "a%"), &name())
            .is_expressible());
    }

    #[test]
    fn test_equal_ignore_case() {
        let spec = PredicateSpec::equal_ignore_case("name", "bob");
        let mysql = fragment(view(Dbms::MySql).translate(&spec, &name()));
        assert_eq!(
            mysql.text,
            "BINARY LOWER(`full_name`) = LOWER(?) AND LENGTH(`full_name`) = 3"
        );
        let sqlite = fragment(view(Dbms::Sqlite).translate(&spec, &name()));
        assert_eq!(sqlite.text, "LOWER(\"full_name\") = LOWER(?)");
        let non_ascii = PredicateSpec::equal_ignore_case("name", "émile");
        assert!(!view(Dbms::PostgreSql).translate(&non_ascii, &name()).is_expressible());
    }

    #[test]
    fn test_equal_ignore_case_keeps_column_ascii() {
        // LOWER on PostgreSQL maps the Kelvin sign to `k`, in memory it does not.
        let kelvin = Record::new().with("name", "\u{212A}elvin");
        let spec = PredicateSpec::equal_ignore_case("name", "kelvin");
        assert_eq!(spec.evaluate(&kelvin), Some(false));

        let pg = fragment(view(Dbms::PostgreSql).translate(&spec, &name()));
        assert_eq!(
            pg.text,
            "LOWER(\"full_name\") = LOWER(?) AND OCTET_LENGTH(\"full_name\") = 6"
        );
        assert_eq!(pg.parameters, vec![Value::from("kelvin")]);
        assert_ne!("\u{212A}elvin".len(), 6);
        assert!(pg.check_alignment().is_ok());
    }

    #[test]
    fn test_mysql_like_matches_characters() {
        let like = fragment(view(Dbms::MySql).translate(&PredicateSpec::like("name", "a_c"), &name()));
        assert_eq!(like.text, "`full_name` LIKE ? COLLATE utf8mb4_bin");
        let ends = fragment(view(Dbms::MySql).translate(&PredicateSpec::ends_with("name", "é"), &name()));
        assert_eq!(ends.text, "`full_name` LIKE ? COLLATE utf8mb4_bin");
        assert_eq!(ends.parameters, vec![Value::from("%é")]);
        // `_` is one character, not one byte.
        assert!(like_match("aéc", "a_c"));
    }

    #[test]
    fn test_like_with_trailing_escape() {
        let lone = PredicateSpec::like("name", "50\\");
        assert!(like_match("50\\", "50\\"));
        assert!(!view(Dbms::PostgreSql).translate(&lone, &name()).is_expressible());
        assert!(!view(Dbms::MySql).translate(&lone, &name()).is_expressible());
        assert!(view(Dbms::Memory).translate(&lone, &name()).is_expressible());

        let escaped = PredicateSpec::like("name", "50\\\\");
        assert!(view(Dbms::PostgreSql).translate(&escaped, &name()).is_expressible());
    }

    #[test]
    fn test_portable_regex_subset() {
        for pattern in ["^a", "ab+c", "(ab|cd)*e", "[a-f0-9]+", "[^xyz]", "^x?y", "a-b c,d"] {
            assert!(is_portable_regex(pattern), "{pattern}");
        }
        for pattern in [
            "", "\\bword\\b", "a.c", "end$", "a{2}", "a*?", "a|", "|a", "()", "(?i)a",
            "[a-Z]", "[[:alpha:]]", "[]a]", "a^", "*a", "(a", "a)", "é",
        ] {
            assert!(!is_portable_regex(pattern), "{pattern}");
        }
    }

    #[test]
    fn test_word_boundary_regex_stays_in_memory() {
        let spec = PredicateSpec::matches("name", "\\bcat\\b").unwrap();
        assert_eq!(
            view(Dbms::PostgreSql).translate(&spec, &name()),
            Translation::NotExpressible("regular expression outside the portable subset")
        );
        assert!(!view(Dbms::MySql).translate(&spec, &name()).is_expressible());
        assert_eq!(spec.evaluate(&Record::new().with("name", "a cat!")), Some(true));
    }

    #[test]
    fn test_regex_support() {
        let spec = PredicateSpec::matches("name", "^a").unwrap();
        assert_eq!(
            fragment(view(Dbms::PostgreSql).translate(&spec, &name())).text,
            "\"full_name\" ~ ?"
        );
        let mysql = fragment(view(Dbms::MySql).translate(&spec, &name()));
        assert_eq!(mysql.text, "REGEXP_LIKE(`full_name`, ?, 'c')");
        assert!(mysql.check_alignment().is_ok());
        assert!(!view(Dbms::Sqlite).translate(&spec, &name()).is_expressible());
        assert!(!view(Dbms::Memory).translate(&spec, &name()).is_expressible());
    }

    #[test]
    fn test_text_operator_on_int_column() {
        let t = view(Dbms::MySql).translate(&PredicateSpec::starts_with("age", "1"), &age());
        assert!(!t.is_expressible());
    }

    #[test]
    fn test_order_terms() {
        let asc = SortKey::asc("name");
        let desc = SortKey::desc("age");
        assert_eq!(
            view(Dbms::PostgreSql).order_term(&asc, &name()),
            "\"full_name\" COLLATE \"C\" ASC NULLS FIRST"
        );
        assert_eq!(
            view(Dbms::PostgreSql).order_term(&desc, &age()),
            "\"age\" DESC NULLS LAST"
        );
        assert_eq!(view(Dbms::MySql).order_term(&asc, &name()), "BINARY `full_name` ASC");
        assert_eq!(view(Dbms::Sqlite).order_term(&desc, &age()), "\"age\" DESC");
    }
}
