/// AST → SQL compiler.
///
/// Renders statements in a given dialect: identifiers and string literals use
/// the dialect's quotes, parameters become positional `?` placeholders, and
/// `Fragment` nodes are emitted verbatim.
use super::types::*;
use crate::dialect::DialectDescriptor;

/// Compile a statement into SQL text for `dialect`.
pub fn compile(query: &Query, dialect: &DialectDescriptor) -> String {
    match query {
        Query::Select(s) => compile_select(s, dialect),
        Query::Insert(i) => compile_insert(i, dialect),
        Query::Update(u) => compile_update(u, dialect),
    }
}

fn compile_select(select: &SelectQuery, d: &DialectDescriptor) -> String {
    let mut parts = Vec::new();

    let mut select_clause = String::from("SELECT ");
    if select.projections.is_empty() {
        select_clause.push('*');
    } else {
        let items: Vec<String> = select
            .projections
            .iter()
            .map(|item| compile_select_item(item, d))
            .collect();
        select_clause.push_str(&items.join(", "));
    }
    parts.push(select_clause);

    if !select.from.is_empty() {
        let tables: Vec<String> = select
            .from
            .iter()
            .map(|t| compile_table_ref(t, d))
            .collect();
        parts.push(format!("FROM {}", tables.join(", ")));
    }

    if let Some(ref filter) = select.filter {
        parts.push(format!("WHERE {}", compile_expr(filter, d)));
    }

    if !select.order_by.is_empty() {
        let orders: Vec<String> = select
            .order_by
            .iter()
            .map(|o| compile_order_by(o, d))
            .collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    if let Some(ref limit) = select.limit {
        parts.push(format!("LIMIT {}", compile_expr(limit, d)));
    }

    if let Some(ref offset) = select.offset {
        parts.push(format!("OFFSET {}", compile_expr(offset, d)));
    }

    parts.join(" ")
}

fn compile_select_item(item: &SelectItem, d: &DialectDescriptor) -> String {
    match item {
        SelectItem::Wildcard => "*".to_string(),
        SelectItem::Expression { expr, alias } => {
            let expr_str = compile_expr(expr, d);
            match alias {
                Some(a) => format!("{} AS {}", expr_str, d.quote(a)),
                None => expr_str,
            }
        }
    }
}

fn compile_table_ref(table: &TableRef, d: &DialectDescriptor) -> String {
    match table {
        TableRef::Table {
            schema,
            name,
            alias,
        } => {
            let mut s = match schema {
                Some(sc) if d.has_named_schemas() => format!("{}.{}", d.quote(sc), d.quote(name)),
                _ => d.quote(name),
            };
            if let Some(a) = alias {
                s.push_str(&format!(" AS {}", d.quote(a)));
            }
            s
        }
        TableRef::Subquery { query, alias } => {
            format!("({}) AS {}", compile(query, d), d.quote(alias))
        }
    }
}

fn compile_expr(expr: &Expression, d: &DialectDescriptor) -> String {
    match expr {
        Expression::Column { table, name } => match table {
            Some(t) => format!("{}.{}", d.quote(t), d.quote(name)),
            None => d.quote(name),
        },
        Expression::Literal(lit) => compile_literal(lit, d),
        Expression::BinaryOp { left, op, right } => {
            let op_str = match op {
                BinaryOperator::Eq => "=",
                BinaryOperator::NotEq => "<>",
                BinaryOperator::Lt => "<",
                BinaryOperator::LtEq => "<=",
                BinaryOperator::Gt => ">",
                BinaryOperator::GtEq => ">=",
                BinaryOperator::And => "AND",
                BinaryOperator::Or => "OR",
                BinaryOperator::Like => "LIKE",
                BinaryOperator::NotLike => "NOT LIKE",
            };
            format!(
                "{} {} {}",
                compile_expr(left, d),
                op_str,
                compile_expr(right, d)
            )
        }
        Expression::UnaryOp { op, expr } => match op {
            UnaryOperator::Not => format!("NOT {}", compile_expr(expr, d)),
            UnaryOperator::Minus => format!("-{}", compile_expr(expr, d)),
        },
        Expression::Function { name, args } | Expression::Aggregate { name, args } => {
            let args_str: Vec<String> = args.iter().map(|a| compile_expr(a, d)).collect();
            format!("{}({})", name, args_str.join(", "))
        }
        Expression::InList {
            expr,
            list,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            let items: Vec<String> = list.iter().map(|e| compile_expr(e, d)).collect();
            format!(
                "{} {}IN ({})",
                compile_expr(expr, d),
                not_str,
                items.join(", ")
            )
        }
        Expression::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            format!(
                "{} {}BETWEEN {} AND {}",
                compile_expr(expr, d),
                not_str,
                compile_expr(low, d),
                compile_expr(high, d)
            )
        }
        Expression::IsNull { expr, negated } => {
            if *negated {
                format!("{} IS NOT NULL", compile_expr(expr, d))
            } else {
                format!("{} IS NULL", compile_expr(expr, d))
            }
        }
        Expression::Wildcard => "*".to_string(),
        Expression::Parameter(_) => "?".to_string(),
        Expression::Nested(expr) => format!("({})", compile_expr(expr, d)),
        Expression::Fragment(sql) => sql.clone(),
    }
}

fn compile_literal(lit: &Literal, d: &DialectDescriptor) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{}", f),
        Literal::String(s) => d.quote_string(s),
    }
}

fn compile_order_by(order: &OrderByExpr, d: &DialectDescriptor) -> String {
    let mut s = compile_expr(&order.expr, d);
    match order.asc {
        Some(true) => s.push_str(" ASC"),
        Some(false) => s.push_str(" DESC"),
        None => {}
    }
    match order.nulls_first {
        Some(true) => s.push_str(" NULLS FIRST"),
        Some(false) => s.push_str(" NULLS LAST"),
        None => {}
    }
    s
}

fn compile_insert(insert: &InsertQuery, d: &DialectDescriptor) -> String {
    let mut s = format!("INSERT INTO {}", compile_table_ref(&insert.table, d));

    if insert.columns.is_empty() {
        s.push_str(" DEFAULT VALUES");
        return s;
    }

    let cols: Vec<String> = insert.columns.iter().map(|c| d.quote(c)).collect();
    s.push_str(&format!(" ({})", cols.join(", ")));

    let rows: Vec<String> = insert
        .values
        .iter()
        .map(|row| {
            let vals: Vec<String> = row.iter().map(|e| compile_expr(e, d)).collect();
            format!("({})", vals.join(", "))
        })
        .collect();
    s.push_str(&format!(" VALUES {}", rows.join(", ")));

    s
}

fn compile_update(update: &UpdateQuery, d: &DialectDescriptor) -> String {
    let mut s = format!("UPDATE {}", compile_table_ref(&update.table, d));

    let assigns: Vec<String> = update
        .assignments
        .iter()
        .map(|a| format!("{} = {}", d.quote(&a.column), compile_expr(&a.value, d)))
        .collect();
    s.push_str(&format!(" SET {}", assigns.join(", ")));

    if let Some(ref filter) = update.filter {
        s.push_str(&format!(" WHERE {}", compile_expr(filter, d)));
    }

    s
}
