/// SQL → AST parser.
///
/// Translates SQL text into the crate's AST using `sqlparser` as the parsing
/// frontend. Placeholders must be numbered (`$1`); statements outside the
/// single-table SELECT / INSERT / UPDATE subset are rejected.
use anyhow::{anyhow, bail, Result};
use sqlparser::ast as sp;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;

use super::types::*;

/// Parse a SQL string into AST statements.
pub fn parse_sql(sql: &str) -> Result<Vec<Query>> {
    let dialect = PostgreSqlDialect {};
    let statements =
        SqlParser::parse_sql(&dialect, sql).map_err(|e| anyhow!("SQL parse error: {}", e))?;

    statements.into_iter().map(convert_statement).collect()
}

/// Parse a single SQL statement. Returns an error if the input contains
/// more than one statement.
pub fn parse_single(sql: &str) -> Result<Query> {
    let mut queries = parse_sql(sql)?;
    if queries.len() != 1 {
        return Err(anyhow!("Expected 1 statement, found {}", queries.len()));
    }
    Ok(queries.remove(0))
}

fn convert_statement(stmt: sp::Statement) -> Result<Query> {
    match stmt {
        sp::Statement::Query(q) => convert_query(*q),
        sp::Statement::Insert(insert) => convert_insert(insert),
        sp::Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => convert_update(table, assignments, selection),
        other => bail!("Unsupported statement: {}", other),
    }
}

fn convert_query(query: sp::Query) -> Result<Query> {
    if query.with.is_some() {
        bail!("WITH is not supported");
    }

    let order_by_exprs: Vec<sp::OrderByExpr> =
        query.order_by.map(|ob| ob.exprs).unwrap_or_default();

    let mut select = match *query.body {
        sp::SetExpr::Select(select) => convert_select(*select)?,
        sp::SetExpr::Query(inner) => match convert_query(*inner)? {
            Query::Select(s) => s,
            _ => bail!("Expected SELECT"),
        },
        other => bail!("Unsupported query body: {}", other),
    };

    if !order_by_exprs.is_empty() {
        select.order_by = order_by_exprs
            .into_iter()
            .map(convert_order_by)
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(l) = query.limit {
        select.limit = Some(convert_expr(l)?);
    }
    if let Some(o) = query.offset {
        select.offset = Some(convert_expr(o.value)?);
    }
    Ok(Query::Select(select))
}

fn convert_select(select: sp::Select) -> Result<Box<SelectQuery>> {
    if select.distinct.is_some() {
        bail!("DISTINCT is not supported");
    }
    if let sp::GroupByExpr::Expressions(exprs, _) = &select.group_by {
        if !exprs.is_empty() {
            bail!("GROUP BY is not supported");
        }
    }
    if select.having.is_some() {
        bail!("HAVING is not supported");
    }

    let projections = select
        .projection
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    let from = select
        .from
        .into_iter()
        .map(|twj| {
            if !twj.joins.is_empty() {
                bail!("JOIN is not supported");
            }
            convert_table_factor(twj.relation)
        })
        .collect::<Result<Vec<_>>>()?;

    let filter = select.selection.map(convert_expr).transpose()?;

    Ok(Box::new(SelectQuery {
        projections,
        from,
        filter,
        order_by: vec![],
        limit: None,
        offset: None,
    }))
}

fn split_object_name(name: &sp::ObjectName) -> Result<(Option<String>, String)> {
    let parts: Vec<&str> = name.0.iter().map(|p| p.value.as_str()).collect();
    match parts.len() {
        1 => Ok((None, parts[0].to_string())),
        2 => Ok((Some(parts[0].to_string()), parts[1].to_string())),
        _ => bail!("Unsupported table name: {}", name),
    }
}

fn convert_table_factor(tf: sp::TableFactor) -> Result<TableRef> {
    match tf {
        sp::TableFactor::Table { name, alias, .. } => {
            let (schema, table_name) = split_object_name(&name)?;
            Ok(TableRef::Table {
                schema,
                name: table_name,
                alias: alias.map(|a| a.name.value),
            })
        }
        sp::TableFactor::Derived {
            subquery, alias, ..
        } => {
            let alias_name = alias
                .map(|a| a.name.value)
                .unwrap_or_else(|| "_subquery".into());
            Ok(TableRef::Subquery {
                query: Box::new(convert_query(*subquery)?),
                alias: alias_name,
            })
        }
        other => bail!("Unsupported table reference: {}", other),
    }
}

fn convert_select_item(item: sp::SelectItem) -> Result<SelectItem> {
    match item {
        sp::SelectItem::UnnamedExpr(expr) => Ok(SelectItem::Expression {
            expr: convert_expr(expr)?,
            alias: None,
        }),
        sp::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expression {
            expr: convert_expr(expr)?,
            alias: Some(alias.value),
        }),
        sp::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
        other => bail!("Unsupported select item: {}", other),
    }
}

fn convert_expr(expr: sp::Expr) -> Result<Expression> {
    match expr {
        sp::Expr::Identifier(ident) => Ok(Expression::Column {
            table: None,
            name: ident.value,
        }),
        sp::Expr::CompoundIdentifier(parts) => {
            let mut names: Vec<String> = parts.into_iter().map(|p| p.value).collect();
            match names.len() {
                1 => Ok(Expression::column(names.remove(0))),
                2 => {
                    let name = names.remove(1);
                    Ok(Expression::Column {
                        table: Some(names.remove(0)),
                        name,
                    })
                }
                _ => bail!("Unsupported column reference: {}", names.join(".")),
            }
        }
        sp::Expr::Value(val) => convert_value(val),
        sp::Expr::BinaryOp { left, op, right } => Ok(Expression::BinaryOp {
            left: Box::new(convert_expr(*left)?),
            op: convert_binary_op(op)?,
            right: Box::new(convert_expr(*right)?),
        }),
        sp::Expr::UnaryOp { op, expr } => Ok(Expression::UnaryOp {
            op: convert_unary_op(op)?,
            expr: Box::new(convert_expr(*expr)?),
        }),
        sp::Expr::Function(func) => convert_function(func),
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expression::InList {
            expr: Box::new(convert_expr(*expr)?),
            list: list
                .into_iter()
                .map(convert_expr)
                .collect::<Result<Vec<_>>>()?,
            negated,
        }),
        sp::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expression::Between {
            expr: Box::new(convert_expr(*expr)?),
            low: Box::new(convert_expr(*low)?),
            high: Box::new(convert_expr(*high)?),
            negated,
        }),
        sp::Expr::IsNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: false,
        }),
        sp::Expr::IsNotNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: true,
        }),
        sp::Expr::Nested(expr) => Ok(Expression::Nested(Box::new(convert_expr(*expr)?))),
        sp::Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => {
            let op = if negated {
                BinaryOperator::NotLike
            } else {
                BinaryOperator::Like
            };
            Ok(Expression::BinaryOp {
                left: Box::new(convert_expr(*expr)?),
                op,
                right: Box::new(convert_expr(*pattern)?),
            })
        }
        other => bail!("Unsupported expression: {}", other),
    }
}

fn convert_value(val: sp::Value) -> Result<Expression> {
    match val {
        sp::Value::Null => Ok(Expression::Literal(Literal::Null)),
        sp::Value::Boolean(b) => Ok(Expression::Literal(Literal::Boolean(b))),
        sp::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Expression::Literal(Literal::Integer(i)))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Expression::Literal(Literal::Float(f)))
            } else {
                bail!("Invalid number: {}", n)
            }
        }
        sp::Value::SingleQuotedString(s) => Ok(Expression::Literal(Literal::String(s))),
        sp::Value::Placeholder(p) => {
            // $1, $2, ...
            match p.strip_prefix('$').and_then(|n| n.parse::<usize>().ok()) {
                Some(idx) if idx > 0 => Ok(Expression::Parameter(idx)),
                _ => bail!("Unsupported placeholder: {}", p),
            }
        }
        other => bail!("Unsupported value: {}", other),
    }
}

fn convert_binary_op(op: sp::BinaryOperator) -> Result<BinaryOperator> {
    match op {
        sp::BinaryOperator::Eq => Ok(BinaryOperator::Eq),
        sp::BinaryOperator::NotEq => Ok(BinaryOperator::NotEq),
        sp::BinaryOperator::Lt => Ok(BinaryOperator::Lt),
        sp::BinaryOperator::LtEq => Ok(BinaryOperator::LtEq),
        sp::BinaryOperator::Gt => Ok(BinaryOperator::Gt),
        sp::BinaryOperator::GtEq => Ok(BinaryOperator::GtEq),
        sp::BinaryOperator::And => Ok(BinaryOperator::And),
        sp::BinaryOperator::Or => Ok(BinaryOperator::Or),
        _ => Err(anyhow!("Unsupported binary operator: {:?}", op)),
    }
}

fn convert_unary_op(op: sp::UnaryOperator) -> Result<UnaryOperator> {
    match op {
        sp::UnaryOperator::Not => Ok(UnaryOperator::Not),
        sp::UnaryOperator::Minus => Ok(UnaryOperator::Minus),
        _ => Err(anyhow!("Unsupported unary operator: {:?}", op)),
    }
}

fn convert_function(func: sp::Function) -> Result<Expression> {
    if func.over.is_some() {
        bail!("Window functions are not supported");
    }
    let name = func.name.to_string().to_uppercase();

    let args = match func.args {
        sp::FunctionArguments::List(arg_list) => arg_list
            .args
            .into_iter()
            .map(|a| match a {
                sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => convert_expr(e),
                sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => Ok(Expression::Wildcard),
                other => bail!("Unsupported function argument: {}", other),
            })
            .collect::<Result<Vec<_>>>()?,
        sp::FunctionArguments::None => vec![],
        sp::FunctionArguments::Subquery(_) => bail!("Subquery arguments are not supported"),
    };

    if name == "COUNT" {
        Ok(Expression::Aggregate { name, args })
    } else {
        Ok(Expression::Function { name, args })
    }
}

fn convert_order_by(order: sp::OrderByExpr) -> Result<OrderByExpr> {
    Ok(OrderByExpr {
        expr: convert_expr(order.expr)?,
        asc: order.asc,
        nulls_first: order.nulls_first,
    })
}

fn convert_insert(insert: sp::Insert) -> Result<Query> {
    let (schema, name) = split_object_name(&insert.table_name)?;
    let table = TableRef::Table {
        schema,
        name,
        alias: None,
    };

    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

    let values = match insert.source {
        Some(src) => match *src.body {
            sp::SetExpr::Values(values) => values
                .rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(convert_expr)
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?,
            other => bail!("Unsupported INSERT source: {}", other),
        },
        // DEFAULT VALUES
        None => vec![],
    };

    Ok(Query::Insert(InsertQuery {
        table,
        columns,
        values,
    }))
}

fn convert_update(
    table: sp::TableWithJoins,
    assignments: Vec<sp::Assignment>,
    selection: Option<sp::Expr>,
) -> Result<Query> {
    if !table.joins.is_empty() {
        bail!("JOIN is not supported");
    }
    let table_ref = convert_table_factor(table.relation)?;

    let assigns = assignments
        .into_iter()
        .map(|a| {
            let column = match &a.target {
                sp::AssignmentTarget::ColumnName(name) => name
                    .0
                    .last()
                    .map(|ident| ident.value.clone())
                    .ok_or_else(|| anyhow!("Empty assignment target"))?,
                other => bail!("Unsupported assignment target: {}", other),
            };
            Ok(Assignment {
                column,
                value: convert_expr(a.value)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let filter = selection.map(convert_expr).transpose()?;

    Ok(Query::Update(UpdateQuery {
        table: table_ref,
        assignments: assigns,
        filter,
    }))
}
