//! In-process engine for the Memory dialect.
//!
//! Statements go through the same AST the planner compiles from: `?`
//! placeholders are numbered, the text is parsed with [`ast::parse_single`]
//! and the result is evaluated over plain row vectors. Comparisons use SQL
//! three-valued logic, text compares by bytes and `NULL` sorts lowest unless
//! an ORDER BY term says otherwise.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::driver::{Driver, RowStream};
use super::query::{ErrorCategory, StructuredError};
use crate::ast::{
    self, BinaryOperator, Expression, InsertQuery, Literal, OrderByExpr, Query, SelectItem,
    SelectQuery, TableRef, UnaryOperator, UpdateQuery,
};
use crate::dialect::{number_placeholders, DriverVersionProvider};
use crate::stream::{like_match, EntityDef, Record, Value};

type EngineResult<T> = std::result::Result<T, StructuredError>;

/// One statement as the engine received it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone)]
struct Column {
    name: String,
    auto_increment: bool,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn position(&self, table: &str, column: &str) -> EngineResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| undefined_column(column).with_table(table))
    }

    fn next_id(&self, idx: usize) -> i64 {
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(Value::as_i64))
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    /// Assign auto-increment values to `NULL` identity cells.
    fn fill_generated(&self, row: &mut [Value]) {
        for (idx, column) in self.columns.iter().enumerate() {
            if column.auto_increment && row[idx].is_null() {
                row[idx] = Value::Int(self.next_id(idx));
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    log: Vec<ExecutedStatement>,
    fail_next: Option<String>,
}

enum Outcome {
    Rows(RowStream),
    Affected(u64),
}

#[derive(Debug, Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create (or replace) the table backing `entity`.
    pub fn create_table(&self, entity: &EntityDef) {
        let table = Table {
            columns: entity
                .fields()
                .iter()
                .map(|f| Column {
                    name: f.column.clone(),
                    auto_increment: f.auto_increment,
                })
                .collect(),
            rows: Vec::new(),
        };
        self.lock().tables.insert(entity.table().to_string(), table);
    }

    /// Append records to `entity`'s table without going through SQL.
    pub fn seed(
        &self,
        entity: &EntityDef,
        records: impl IntoIterator<Item = Record>,
    ) -> EngineResult<u64> {
        let mut state = self.lock();
        let table = state
            .tables
            .get_mut(entity.table())
            .ok_or_else(|| undefined_table(entity.table()))?;
        let mut count = 0;
        for record in records {
            let mut row: Vec<Value> = table
                .columns
                .iter()
                .map(|c| {
                    entity
                        .fields()
                        .iter()
                        .find(|f| f.column == c.name)
                        .map(|f| record.value(&f.name).clone())
                        .unwrap_or(Value::Null)
                })
                .collect();
            table.fill_generated(&mut row);
            table.rows.push(row);
            count += 1;
        }
        Ok(count)
    }

    /// Current contents of `table`, in insertion order.
    pub fn dump(&self, table: &str) -> Option<RowStream> {
        self.lock().tables.get(table).map(|t| RowStream {
            columns: t.column_names(),
            rows: t.rows.clone(),
        })
    }

    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.lock().log.clone()
    }

    pub fn clear_statements(&self) {
        self.lock().log.clear();
    }

    /// Make the next statement fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    fn run(&self, sql: &str, params: &[Value]) -> EngineResult<Outcome> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.log.push(ExecutedStatement {
            sql: sql.to_string(),
            parameters: params.to_vec(),
        });
        if let Some(message) = state.fail_next.take() {
            return Err(StructuredError::new(ErrorCategory::Execution, message));
        }

        let query = ast::parse_single(&number_placeholders(sql))
            .map_err(|e| StructuredError::new(ErrorCategory::Syntax, e.to_string()).with_code("42601"))?;
        debug!(sql, params = params.len(), "memory engine statement");

        match query {
            Query::Select(select) => select_rows(&state.tables, &select, params).map(Outcome::Rows),
            Query::Insert(insert) => {
                insert_rows(&mut state.tables, &insert, params).map(Outcome::Affected)
            }
            Query::Update(update) => {
                update_rows(&mut state.tables, &update, params).map(Outcome::Affected)
            }
        }
    }
}

impl DriverVersionProvider for MemoryDriver {
    fn driver_major_version(&self) -> Option<u32> {
        Some(1)
    }
}

impl Driver for MemoryDriver {
    async fn execute(&self, sql: &str, params: &[Value]) -> EngineResult<RowStream> {
        match self.run(sql, params)? {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Affected(_) => Ok(RowStream::default()),
        }
    }

    async fn execute_update(&self, sql: &str, params: &[Value]) -> EngineResult<u64> {
        match self.run(sql, params)? {
            Outcome::Affected(n) => Ok(n),
            Outcome::Rows(_) => Err(StructuredError::new(
                ErrorCategory::Semantic,
                "statement returns rows; use execute",
            )),
        }
    }
}

fn undefined_table(name: &str) -> StructuredError {
    StructuredError::new(
        ErrorCategory::Semantic,
        format!("relation \"{}\" does not exist", name),
    )
    .with_code("42P01")
    .with_table(name)
}

fn undefined_column(name: &str) -> StructuredError {
    StructuredError::new(
        ErrorCategory::Semantic,
        format!("column \"{}\" does not exist", name),
    )
    .with_code("42703")
    .with_column(name)
}

fn unsupported(what: impl Into<String>) -> StructuredError {
    StructuredError::new(ErrorCategory::Semantic, what).with_code("0A000")
}

fn type_error(what: impl Into<String>) -> StructuredError {
    StructuredError::new(ErrorCategory::Execution, what).with_code("42804")
}

fn table_name(table: &TableRef) -> EngineResult<&str> {
    match table {
        TableRef::Table { name, .. } => Ok(name),
        TableRef::Subquery { .. } => Err(unsupported("derived table is not a valid target")),
    }
}

/// Evaluation context: column names of the current row and bound parameters.
struct Env<'a> {
    columns: &'a [String],
    params: &'a [Value],
}

impl Env<'_> {
    fn column(&self, name: &str) -> EngineResult<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| undefined_column(name))
    }
}

fn select_rows(
    tables: &BTreeMap<String, Table>,
    select: &SelectQuery,
    params: &[Value],
) -> EngineResult<RowStream> {
    let source = match select.from.as_slice() {
        [] => RowStream {
            columns: Vec::new(),
            rows: vec![Vec::new()],
        },
        [TableRef::Table { name, .. }] => {
            let table = tables.get(name).ok_or_else(|| undefined_table(name))?;
            RowStream {
                columns: table.column_names(),
                rows: table.rows.clone(),
            }
        }
        [TableRef::Subquery { query, .. }] => match query.as_ref() {
            Query::Select(inner) => select_rows(tables, inner, params)?,
            _ => return Err(unsupported("only SELECT may appear in FROM")),
        },
        _ => return Err(unsupported("more than one table in FROM")),
    };
    let env = Env {
        columns: &source.columns,
        params,
    };

    let mut rows = Vec::with_capacity(source.rows.len());
    for row in &source.rows {
        let keep = match &select.filter {
            Some(filter) => eval(filter, &env, row)? == Value::Bool(true),
            None => true,
        };
        if keep {
            rows.push(row.as_slice());
        }
    }

    let mut output = if select.projections.iter().any(is_aggregate) {
        aggregate(&select.projections, &env, &rows)?
    } else {
        if !select.order_by.is_empty() {
            let mut keyed = rows
                .into_iter()
                .map(|row| {
                    let keys = select
                        .order_by
                        .iter()
                        .map(|o| eval(&o.expr, &env, row))
                        .collect::<EngineResult<Vec<_>>>()?;
                    Ok((keys, row))
                })
                .collect::<EngineResult<Vec<_>>>()?;
            keyed.sort_by(|(a, _), (b, _)| compare_keys(&select.order_by, a, b));
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }
        project(&select.projections, &env, &rows)?
    };

    let offset = paging_bound(select.offset.as_ref(), &env)?.unwrap_or(0);
    let limit = paging_bound(select.limit.as_ref(), &env)?;
    output.rows = std::mem::take(&mut output.rows)
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    Ok(output)
}

fn is_aggregate(item: &SelectItem) -> bool {
    matches!(
        item,
        SelectItem::Expression {
            expr: Expression::Aggregate { .. },
            ..
        }
    )
}

fn aggregate(items: &[SelectItem], env: &Env<'_>, rows: &[&[Value]]) -> EngineResult<RowStream> {
    let mut out = RowStream::default();
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        let SelectItem::Expression {
            expr: Expression::Aggregate { name, args },
            alias,
        } = item
        else {
            return Err(unsupported("plain columns mixed with aggregates"));
        };
        if name != "COUNT" {
            return Err(unsupported(format!("aggregate {} is not supported", name)));
        }
        let count = match args.as_slice() {
            [Expression::Wildcard] | [] => rows.len(),
            [arg] => {
                let mut n = 0;
                for row in rows {
                    if !eval(arg, env, row)?.is_null() {
                        n += 1;
                    }
                }
                n
            }
            _ => return Err(unsupported("COUNT takes one argument")),
        };
        out.columns
            .push(alias.clone().unwrap_or_else(|| "count".to_string()));
        values.push(Value::Int(i64::try_from(count).unwrap_or(i64::MAX)));
    }
    out.rows.push(values);
    Ok(out)
}

fn project(items: &[SelectItem], env: &Env<'_>, rows: &[&[Value]]) -> EngineResult<RowStream> {
    let mut out = RowStream::default();
    for item in items {
        match item {
            SelectItem::Wildcard => out.columns.extend(env.columns.iter().cloned()),
            SelectItem::Expression { expr, alias } => out.columns.push(match (alias, expr) {
                (Some(alias), _) => alias.clone(),
                (None, Expression::Column { name, .. }) => name.clone(),
                (None, _) => "?column?".to_string(),
            }),
        }
    }
    for row in rows {
        let mut values = Vec::with_capacity(out.columns.len());
        for item in items {
            match item {
                SelectItem::Wildcard => values.extend(row.iter().cloned()),
                SelectItem::Expression { expr, .. } => values.push(eval(expr, env, row)?),
            }
        }
        out.rows.push(values);
    }
    Ok(out)
}

fn compare_keys(order_by: &[OrderByExpr], a: &[Value], b: &[Value]) -> Ordering {
    for (term, (x, y)) in order_by.iter().zip(a.iter().zip(b)) {
        let asc = term.asc.unwrap_or(true);
        let nulls_first = term.nulls_first.unwrap_or(asc);
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if asc => x.order_cmp(y),
            (false, false) => x.order_cmp(y).reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// LIMIT / OFFSET operand. Negative or `NULL` means no bound.
fn paging_bound(expr: Option<&Expression>, env: &Env<'_>) -> EngineResult<Option<usize>> {
    let Some(expr) = expr else {
        return Ok(None);
    };
    match eval(expr, env, &[])? {
        Value::Null => Ok(None),
        Value::Int(n) if n < 0 => Ok(None),
        Value::Int(n) => Ok(Some(usize::try_from(n).unwrap_or(usize::MAX))),
        other => Err(type_error(format!(
            "LIMIT/OFFSET must be an integer, got {}",
            other
        ))),
    }
}

fn insert_rows(
    tables: &mut BTreeMap<String, Table>,
    insert: &InsertQuery,
    params: &[Value],
) -> EngineResult<u64> {
    let name = table_name(&insert.table)?;
    let table = tables.get_mut(name).ok_or_else(|| undefined_table(name))?;
    let positions = insert
        .columns
        .iter()
        .map(|c| table.position(name, c))
        .collect::<EngineResult<Vec<_>>>()?;
    let env = Env {
        columns: &[],
        params,
    };

    let defaults = [Vec::new()];
    let value_rows: &[Vec<Expression>] = if insert.columns.is_empty() {
        &defaults
    } else {
        &insert.values
    };

    let mut pending = Vec::with_capacity(value_rows.len());
    for exprs in value_rows {
        if exprs.len() != positions.len() {
            return Err(type_error(format!(
                "INSERT has {} expressions for {} target columns",
                exprs.len(),
                positions.len()
            )));
        }
        let mut row = vec![Value::Null; table.columns.len()];
        for (pos, expr) in positions.iter().zip(exprs) {
            row[*pos] = eval(expr, &env, &[])?;
        }
        pending.push(row);
    }
    for mut row in pending {
        table.fill_generated(&mut row);
        table.rows.push(row);
    }
    Ok(value_rows.len() as u64)
}

fn update_rows(
    tables: &mut BTreeMap<String, Table>,
    update: &UpdateQuery,
    params: &[Value],
) -> EngineResult<u64> {
    let name = table_name(&update.table)?;
    let table = tables.get_mut(name).ok_or_else(|| undefined_table(name))?;
    let targets = update
        .assignments
        .iter()
        .map(|a| table.position(name, &a.column))
        .collect::<EngineResult<Vec<_>>>()?;
    let columns = table.column_names();
    let env = Env {
        columns: &columns,
        params,
    };

    let mut count = 0;
    for row in table.rows.iter_mut() {
        if let Some(filter) = &update.filter {
            if eval(filter, &env, row)? != Value::Bool(true) {
                continue;
            }
        }
        let values = update
            .assignments
            .iter()
            .map(|a| eval(&a.value, &env, row))
            .collect::<EngineResult<Vec<_>>>()?;
        for (pos, value) in targets.iter().zip(values) {
            row[*pos] = value;
        }
        count += 1;
    }
    Ok(count)
}

fn truth(value: &Value) -> EngineResult<Option<bool>> {
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(type_error(format!("{} is not a boolean", other))),
    }
}

fn from_truth(t: Option<bool>) -> Value {
    t.map_or(Value::Null, Value::Bool)
}

fn eval(expr: &Expression, env: &Env<'_>, row: &[Value]) -> EngineResult<Value> {
    match expr {
        Expression::Column { name, .. } => {
            let idx = env.column(name)?;
            Ok(row.get(idx).cloned().unwrap_or(Value::Null))
        }
        Expression::Literal(lit) => Ok(match lit {
            Literal::Null => Value::Null,
            Literal::Boolean(b) => Value::Bool(*b),
            Literal::Integer(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::Text(s.clone()),
        }),
        Expression::Parameter(n) => n
            .checked_sub(1)
            .and_then(|i| env.params.get(i))
            .cloned()
            .ok_or_else(|| {
                StructuredError::new(
                    ErrorCategory::Execution,
                    format!("no value bound for parameter ${}", n),
                )
                .with_code("08P01")
            }),
        Expression::Nested(inner) => eval(inner, env, row),
        Expression::BinaryOp { left, op, right } => {
            let l = eval(left, env, row)?;
            let r = eval(right, env, row)?;
            match op {
                BinaryOperator::And => {
                    let (a, b) = (truth(&l)?, truth(&r)?);
                    Ok(from_truth(match (a, b) {
                        (Some(false), _) | (_, Some(false)) => Some(false),
                        (Some(true), Some(true)) => Some(true),
                        _ => None,
                    }))
                }
                BinaryOperator::Or => {
                    let (a, b) = (truth(&l)?, truth(&r)?);
                    Ok(from_truth(match (a, b) {
                        (Some(true), _) | (_, Some(true)) => Some(true),
                        (Some(false), Some(false)) => Some(false),
                        _ => None,
                    }))
                }
                BinaryOperator::Like | BinaryOperator::NotLike => match (&l, &r) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                    (Value::Text(text), Value::Text(pattern)) => Ok(Value::Bool(
                        like_match(text, pattern) == (*op == BinaryOperator::Like),
                    )),
                    _ => Err(type_error("LIKE requires text operands")),
                },
                cmp => Ok(from_truth(l.sql_cmp(&r).map(|ord| match cmp {
                    BinaryOperator::Eq => ord.is_eq(),
                    BinaryOperator::NotEq => ord.is_ne(),
                    BinaryOperator::Lt => ord.is_lt(),
                    BinaryOperator::LtEq => ord.is_le(),
                    BinaryOperator::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }))),
            }
        }
        Expression::UnaryOp { op, expr } => {
            let value = eval(expr, env, row)?;
            match op {
                UnaryOperator::Not => Ok(from_truth(truth(&value)?.map(|b| !b))),
                UnaryOperator::Minus => match value {
                    Value::Null => Ok(Value::Null),
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| type_error("integer out of range")),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(type_error(format!("cannot negate {}", other))),
                },
            }
        }
        Expression::Function { name, args } => {
            let [arg] = args.as_slice() else {
                return Err(unsupported(format!("{} takes one argument", name)));
            };
            let value = eval(arg, env, row)?;
            match (name.as_str(), value) {
                (_, Value::Null) => Ok(Value::Null),
                ("LOWER", Value::Text(s)) => Ok(Value::Text(s.to_ascii_lowercase())),
                ("UPPER", Value::Text(s)) => Ok(Value::Text(s.to_ascii_uppercase())),
                ("LOWER" | "UPPER", other) => {
                    Err(type_error(format!("{}({}) requires text", name, other)))
                }
                _ => Err(unsupported(format!("function {} does not exist", name)).with_code("42883")),
            }
        }
        Expression::InList {
            expr,
            list,
            negated,
        } => {
            let value = eval(expr, env, row)?;
            let mut found = Some(false);
            for item in list {
                match value.sql_cmp(&eval(item, env, row)?) {
                    Some(Ordering::Equal) => {
                        found = Some(true);
                        break;
                    }
                    Some(_) => {}
                    None => found = None,
                }
            }
            Ok(from_truth(found.map(|b| b != *negated)))
        }
        Expression::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = eval(expr, env, row)?;
            let above = value.sql_cmp(&eval(low, env, row)?).map(Ordering::is_ge);
            let below = value.sql_cmp(&eval(high, env, row)?).map(Ordering::is_le);
            let inside = match (above, below) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            };
            Ok(from_truth(inside.map(|b| b != *negated)))
        }
        Expression::IsNull { expr, negated } => {
            Ok(Value::Bool(eval(expr, env, row)?.is_null() != *negated))
        }
        Expression::Aggregate { name, .. } => Err(unsupported(format!(
            "aggregate {} is not allowed here",
            name
        ))),
        Expression::Wildcard | Expression::Fragment(_) => {
            Err(unsupported("unexpected expression"))
        }
    }
}
