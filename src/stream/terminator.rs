//! Terminal operations.
//!
//! A [`Terminator`] runs a pipeline against one engine: it plans the
//! pushdown, executes the compiled SELECT, maps rows to records and replays
//! the unpushed suffix lazily before applying the terminal action.

use tracing::{debug, trace};

use super::pipeline::{Op, Pipeline};
use super::planner::{self, compile_select, PushdownPlan, SelectShape};
use super::value::{Record, Value};
use crate::db::{ColumnMapper, Driver, EntityMapper, RowStream};
use crate::dialect::{DbmsType, SqlFragment};
use crate::error::{Result, StreamError};
use crate::stream::EntityDef;

static COLUMN_MAPPER: ColumnMapper = ColumnMapper;

pub enum TerminalAction<'f> {
    Collect,
    Count,
    FindFirst,
    /// Call back once per result, in pipeline order.
    ForEachOrdered(&'f mut (dyn FnMut(Record) + Send)),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalResult {
    Records(Vec<Record>),
    Count(u64),
    First(Option<Record>),
    /// The callback of [`TerminalAction::ForEachOrdered`] has seen every result.
    Done,
}

pub struct Terminator<'a, D> {
    dbms: &'a DbmsType,
    driver: &'a D,
    mapper: &'a dyn EntityMapper,
    pushdown: bool,
}

impl<'a, D: Driver> Terminator<'a, D> {
    pub fn new(dbms: &'a DbmsType, driver: &'a D) -> Self {
        Self {
            dbms,
            driver,
            mapper: &COLUMN_MAPPER,
            pushdown: true,
        }
    }

    pub fn with_mapper(mut self, mapper: &'a dyn EntityMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Fetch every row in primary-key order and evaluate the whole pipeline
    /// in memory. Reference behavior for the pushdown path.
    pub fn without_pushdown(mut self) -> Self {
        self.pushdown = false;
        self
    }

    pub fn plan(&self, pipeline: &Pipeline) -> Result<PushdownPlan> {
        if self.pushdown {
            planner::plan(pipeline, self.dbms)
        } else {
            Ok(PushdownPlan::in_memory(pipeline))
        }
    }

    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        action: TerminalAction<'_>,
    ) -> Result<TerminalResult> {
        let plan = self.plan(pipeline)?;
        let entity = pipeline.entity();

        if self.pushdown && plan.remaining.is_empty() {
            match action {
                TerminalAction::Count => {
                    let statement =
                        compile_select(entity, self.dbms, &plan.pushed, SelectShape::Count)?;
                    let rows = self.run(&statement).await?;
                    return Ok(TerminalResult::Count(read_count(entity, &rows)?));
                }
                TerminalAction::FindFirst => {
                    let mut pushed = plan.pushed.clone();
                    pushed.push_limit(1);
                    let statement = compile_select(entity, self.dbms, &pushed, SelectShape::Rows)?;
                    let records = self.fetch(entity, &statement).await?;
                    return Ok(TerminalResult::First(records.into_iter().next()));
                }
                _ => {}
            }
        }

        let statement = match &plan.fragment {
            Some(fragment) => fragment.clone(),
            None => compile_select(entity, self.dbms, &plan.pushed, SelectShape::Rows)?,
        };
        let records = self.fetch(entity, &statement).await?;
        debug!(
            fetched = records.len(),
            suffix = plan.remaining.len(),
            "replaying pipeline suffix"
        );
        let mut results = replay(&plan.remaining, Box::new(records.into_iter()));

        Ok(match action {
            TerminalAction::Collect => TerminalResult::Records(results.collect()),
            TerminalAction::Count => TerminalResult::Count(results.count() as u64),
            TerminalAction::FindFirst => TerminalResult::First(results.next()),
            TerminalAction::ForEachOrdered(callback) => {
                results.for_each(|record| callback(record));
                TerminalResult::Done
            }
        })
    }

    /// Collect all results.
    pub async fn collect(&self, pipeline: &Pipeline) -> Result<Vec<Record>> {
        match self.execute(pipeline, TerminalAction::Collect).await? {
            TerminalResult::Records(records) => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    pub async fn count(&self, pipeline: &Pipeline) -> Result<u64> {
        match self.execute(pipeline, TerminalAction::Count).await? {
            TerminalResult::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn find_first(&self, pipeline: &Pipeline) -> Result<Option<Record>> {
        match self.execute(pipeline, TerminalAction::FindFirst).await? {
            TerminalResult::First(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn run(&self, statement: &SqlFragment) -> Result<RowStream> {
        debug!(
            dbms = self.dbms.name(),
            sql = %statement.text,
            params = statement.parameters.len(),
            "executing statement"
        );
        self.driver
            .execute(&statement.text, &statement.parameters)
            .await
            .map_err(|cause| StreamError::Execution {
                sql: statement.text.clone(),
                parameters: statement.parameters.clone(),
                cause,
            })
    }

    async fn fetch(&self, entity: &EntityDef, statement: &SqlFragment) -> Result<Vec<Record>> {
        let rows = self.run(statement).await?;
        rows.rows
            .iter()
            .map(|row| self.mapper.row_to_entity(entity, &rows, row))
            .collect()
    }
}

fn unexpected(result: TerminalResult) -> StreamError {
    StreamError::TranslationInvariant(format!("terminal action produced {:?}", result))
}

fn read_count(entity: &EntityDef, rows: &RowStream) -> Result<u64> {
    match rows.rows.first().and_then(|row| row.first()) {
        Some(Value::Int(n)) if *n >= 0 => Ok(*n as u64),
        other => Err(StreamError::Mapping {
            entity: entity.name().to_string(),
            reason: format!("COUNT(*) returned {:?}", other),
        }),
    }
}

type Records<'p> = Box<dyn Iterator<Item = Record> + 'p>;

/// Chain the suffix operations over `source`. Nothing runs until the
/// returned iterator is polled; a sort drains its input on first poll.
fn replay<'p>(ops: &'p [Op], source: Records<'p>) -> Records<'p> {
    ops.iter().fold(source, |records, op| -> Records<'p> {
        trace!(op = %op.describe(), "replaying");
        match op {
            Op::Filter(spec) => Box::new(records.filter(move |r| spec.test(r))),
            Op::FilterWith(f) => Box::new(records.filter(move |r| (**f)(r))),
            Op::Sort(key) => sorted(records, move |a, b| key.compare(a, b)),
            Op::SortWith(cmp) => sorted(records, move |a, b| (**cmp)(a, b)),
            Op::Skip(n) => Box::new(records.skip(usize::try_from(*n).unwrap_or(usize::MAX))),
            Op::Limit(n) => Box::new(records.take(usize::try_from(*n).unwrap_or(usize::MAX))),
            Op::Map(projection) => Box::new(records.map(move |r| projection.apply(&r))),
        }
    })
}

fn sorted<'p>(
    records: Records<'p>,
    cmp: impl Fn(&Record, &Record) -> std::cmp::Ordering + 'p,
) -> Records<'p> {
    let mut input = Some(records);
    Box::new(std::iter::once(()).flat_map(move |_| {
        let mut all: Vec<Record> = input.take().map(|it| it.collect()).unwrap_or_default();
        all.sort_by(&cmp);
        all
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDriver;
    use crate::dialect::{registry, Dbms};
    use crate::stream::{FieldDef, FieldKind, PredicateSpec, SortKey};
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn memory() -> &'static DbmsType {
        registry().unwrap().get(Dbms::Memory).unwrap()
    }

    fn people() -> Arc<EntityDef> {
        Arc::new(
            EntityDef::builder("person", "people")
                .field(FieldDef::new("id", FieldKind::Int).auto_increment())
                .field(FieldDef::new("name", FieldKind::Text).nullable())
                .field(FieldDef::new("age", FieldKind::Int).nullable())
                .field(FieldDef::new("score", FieldKind::Float).nullable())
                .field(FieldDef::new("active", FieldKind::Bool).nullable())
                .field(FieldDef::new("joined", FieldKind::Date).nullable().column("joined_on"))
                .primary_key("id")
                .build()
                .unwrap(),
        )
    }

    fn driver_with(rows: &[(Option<&str>, Option<i64>)]) -> MemoryDriver {
        seeded(
            rows.iter()
                .map(|(name, age)| Record::new().with("name", *name).with("age", *age)),
        )
    }

    fn seeded(records: impl IntoIterator<Item = Record>) -> MemoryDriver {
        let driver = MemoryDriver::new();
        let entity = people();
        driver.create_table(&entity);
        driver.seed(&entity, records).unwrap();
        driver
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    fn names(records: &[Record]) -> Vec<Value> {
        records.iter().map(|r| r.value("name").clone()).collect()
    }

    #[tokio::test]
    async fn test_fully_pushed_collect() {
        let driver = driver_with(&[
            (Some("bob"), Some(40)),
            (Some("amy"), Some(12)),
            (Some("cyd"), Some(33)),
        ]);
        let p = Pipeline::new(people())
            .filter(PredicateSpec::gt("age", 18))
            .unwrap()
            .sorted(SortKey::asc("name"))
            .unwrap();
        let records = Terminator::new(memory(), &driver).collect(&p).await.unwrap();
        assert_eq!(names(&records), vec![Value::from("bob"), Value::from("cyd")]);
        assert_eq!(driver.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_map_then_filter_runs_in_memory() {
        let driver = driver_with(&[(Some("bob"), Some(40)), (Some("amy"), Some(12))]);
        let p = Pipeline::new(people())
            .sorted(SortKey::desc("age"))
            .unwrap()
            .select("dto", &["name"])
            .unwrap()
            .filter(PredicateSpec::starts_with("name", "a"))
            .unwrap();
        let records = Terminator::new(memory(), &driver).collect(&p).await.unwrap();
        assert_eq!(records, vec![Record::new().with("name", "amy")]);
        let statements = driver.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].sql.contains("ORDER BY \"age\" DESC, \"id\" ASC"));
    }

    #[tokio::test]
    async fn test_count_and_find_first_are_pushed() {
        let driver = driver_with(&[(Some("a"), Some(1)), (Some("b"), Some(2)), (Some("c"), None)]);
        let t = Terminator::new(memory(), &driver);
        let p = Pipeline::new(people()).filter(PredicateSpec::is_not_null("age")).unwrap();
        assert_eq!(t.count(&p).await.unwrap(), 2);
        assert!(driver.statements()[0].sql.starts_with("SELECT COUNT(*)"));

        let first = t
            .find_first(&p.sorted(SortKey::desc("age")).unwrap())
            .await
            .unwrap();
        assert_eq!(first.unwrap().value("name"), &Value::from("b"));
        let last = driver.statements().pop().unwrap();
        assert!(last.sql.ends_with("LIMIT ?"));
        assert_eq!(last.parameters, vec![Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_for_each_ordered_sees_pipeline_order() {
        let driver = driver_with(&[(Some("x"), Some(3)), (Some("y"), Some(1)), (Some("z"), Some(2))]);
        let p = Pipeline::new(people())
            .sorted_with(|a, b| a.value("age").order_cmp(b.value("age")))
            .limit(2);
        let mut seen = Vec::new();
        let mut callback = |r: Record| seen.push(r.value("name").clone());
        let result = Terminator::new(memory(), &driver)
            .execute(&p, TerminalAction::ForEachOrdered(&mut callback))
            .await
            .unwrap();
        assert_eq!(result, TerminalResult::Done);
        assert_eq!(seen, vec![Value::from("y"), Value::from("z")]);
    }

    #[tokio::test]
    async fn test_execution_error_carries_statement() {
        let driver = driver_with(&[]);
        driver.fail_next("connection reset");
        let p = Pipeline::new(people()).filter(PredicateSpec::eq("age", 3)).unwrap();
        let err = Terminator::new(memory(), &driver).collect(&p).await.unwrap_err();
        match err {
            StreamError::Execution {
                sql,
                parameters,
                cause,
            } => {
                assert!(sql.contains("WHERE (\"age\" = ?)"));
                assert_eq!(parameters, vec![Value::Int(3)]);
                assert_eq!(cause.message, "connection reset");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_without_pushdown_fetches_everything() {
        let driver = driver_with(&[(Some("a"), Some(1)), (Some("b"), Some(2))]);
        let p = Pipeline::new(people()).filter(PredicateSpec::eq("age", 2)).unwrap();
        let t = Terminator::new(memory(), &driver).without_pushdown();
        assert_eq!(t.count(&p).await.unwrap(), 1);
        let statements = driver.statements();
        assert!(!statements[0].sql.contains("WHERE"));
        assert!(statements[0].parameters.is_empty());
    }

    #[tokio::test]
    async fn test_nan_scores_sort_last_with_and_without_pushdown() {
        let records: Vec<Record> = (0..40)
            .map(|i| {
                let score = match i {
                    _ if i % 3 == 0 => Value::Float(f64::NAN),
                    _ if i % 7 == 1 => Value::Null,
                    _ => Value::Float(((i * 17) % 11) as f64 - 5.5),
                };
                Record::new().with("name", format!("p{i}")).with("score", score)
            })
            .collect();
        let pushed = seeded(records.clone());
        let reference = seeded(records);
        let p = Pipeline::new(people()).sorted(SortKey::asc("score")).unwrap();

        let with = Terminator::new(memory(), &pushed).collect(&p).await.unwrap();
        let without = Terminator::new(memory(), &reference)
            .without_pushdown()
            .collect(&p)
            .await
            .unwrap();
        assert_eq!(with, without);

        let scores: Vec<&Value> = with.iter().map(|r| r.value("score")).collect();
        let nulls = scores.iter().take_while(|v| v.is_null()).count();
        let nans = scores
            .iter()
            .rev()
            .take_while(|v| matches!(v, Value::Float(x) if x.is_nan()))
            .count();
        assert_eq!((nulls, nans), (4, 14));
        assert!(scores[nulls..40 - nans]
            .windows(2)
            .all(|w| w[0].sql_cmp(w[1]) != Some(std::cmp::Ordering::Greater)));
    }

    #[tokio::test]
    async fn test_int_operand_on_float_column() {
        let driver = seeded([
            Record::new().with("name", "a").with("score", 2.5),
            Record::new().with("name", "b").with("score", f64::NAN),
            Record::new().with("name", "c").with("score", 1.0),
        ]);
        let p = Pipeline::new(people()).filter(PredicateSpec::gt("score", 2)).unwrap();
        let records = Terminator::new(memory(), &driver).collect(&p).await.unwrap();
        assert_eq!(names(&records), vec![Value::from("a"), Value::from("b")]);
        assert!(driver.statements()[0].sql.contains("WHERE (\"score\" > ?)"));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Gt(i64),
        IsNull,
        In(Vec<i64>),
        Like(String),
        StartsWith(String),
        IgnoreCase(String),
        Sort(&'static str, bool),
        Skip(u64),
        Limit(u64),
        Closure(i64),
        Map,
        ScoreGt(i64),
        ScoreEq(f64),
        ScoreLe(f64),
        Active(bool),
        JoinedBetween(u32, u32),
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn arb_score() -> impl Strategy<Value = f64> {
        prop_oneof![
            Just(f64::NAN),
            Just(-0.0),
            Just(0.0),
            (-4i64..5).prop_map(|i| i as f64 * 0.5),
        ]
    }

    fn arb_step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0i64..60).prop_map(Step::Gt),
            Just(Step::IsNull),
            prop::collection::vec(0i64..60, 0..4).prop_map(Step::In),
            "[ab%_]{1,3}".prop_map(Step::Like),
            "[aAbB]{1,2}".prop_map(Step::StartsWith),
            "[aAbB]{1,3}".prop_map(Step::IgnoreCase),
            (
                prop::sample::select(vec!["name", "age", "score", "active", "joined"]),
                any::<bool>()
            )
                .prop_map(|(f, d)| Step::Sort(f, d)),
            (0u64..4).prop_map(Step::Skip),
            (0u64..6).prop_map(Step::Limit),
            (0i64..60).prop_map(Step::Closure),
            Just(Step::Map),
            (-3i64..3).prop_map(Step::ScoreGt),
            arb_score().prop_map(Step::ScoreEq),
            arb_score().prop_map(Step::ScoreLe),
            any::<bool>().prop_map(Step::Active),
            (1u32..6, 1u32..6).prop_map(|(a, b)| Step::JoinedBetween(a, b)),
        ]
    }

    fn build(steps: &[Step]) -> Pipeline {
        let mut p = Pipeline::new(people());
        for step in steps {
            p = match step {
                Step::Gt(n) => p.filter(PredicateSpec::gt("age", *n)).unwrap(),
                Step::IsNull => p.filter(PredicateSpec::is_null("age")).unwrap(),
                Step::In(vs) => p.filter(PredicateSpec::is_in("age", vs.clone())).unwrap(),
                Step::Like(s) => p.filter(PredicateSpec::like("name", s.as_str())).unwrap(),
                Step::StartsWith(s) => p.filter(PredicateSpec::starts_with("name", s.as_str())).unwrap(),
                Step::IgnoreCase(s) => p
                    .filter(PredicateSpec::equal_ignore_case("name", s.as_str()))
                    .unwrap(),
                Step::Sort(field, desc) => {
                    let key = if *desc { SortKey::desc(*field) } else { SortKey::asc(*field) };
                    p.sorted(key).unwrap()
                }
                Step::Skip(n) => p.skip(*n),
                Step::Limit(n) => p.limit(*n),
                Step::Closure(n) => {
                    let n = *n;
                    p.filter_with(move |r| r.value("age").as_i64().map_or(true, |a| a != n))
                }
                Step::Map => p
                    .select("view", &["name", "age", "score", "active", "joined"])
                    .unwrap(),
                Step::ScoreGt(n) => p.filter(PredicateSpec::gt("score", *n)).unwrap(),
                Step::ScoreEq(x) => p.filter(PredicateSpec::eq("score", *x)).unwrap(),
                Step::ScoreLe(x) => p.filter(PredicateSpec::le("score", *x)).unwrap(),
                Step::Active(b) => p.filter(PredicateSpec::eq("active", *b)).unwrap(),
                Step::JoinedBetween(a, b) => p
                    .filter(PredicateSpec::between("joined", day(*a), day(*b)))
                    .unwrap(),
            };
        }
        p
    }

    fn arb_rows() -> impl Strategy<Value = Vec<Record>> {
        prop::collection::vec(
            (
                prop::option::weighted(0.85, "[aAbB_%]{0,3}"),
                prop::option::weighted(0.8, 0i64..60),
                prop::option::weighted(0.8, arb_score()),
                prop::option::weighted(0.8, any::<bool>()),
                prop::option::weighted(0.8, (1u32..6).prop_map(day)),
            )
                .prop_map(|(name, age, score, active, joined)| {
                    Record::new()
                        .with("name", name)
                        .with("age", age)
                        .with("score", score)
                        .with("active", active)
                        .with("joined", joined)
                }),
            0..12,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(96))]

        #[test]
        fn prop_pushdown_matches_in_memory_evaluation(
            rows in arb_rows(),
            steps in prop::collection::vec(arb_step(), 0..7),
        ) {
            let rt = runtime();
            let pipeline = build(&steps);

            let pushed = seeded(rows.clone());
            let reference = seeded(rows);
            let with = Terminator::new(memory(), &pushed);
            let without = Terminator::new(memory(), &reference).without_pushdown();

            let (a, b) = rt.block_on(async {
                (with.collect(&pipeline).await, without.collect(&pipeline).await)
            });
            prop_assert_eq!(a.unwrap(), b.unwrap());

            let (a, b) = rt.block_on(async {
                (with.count(&pipeline).await, without.count(&pipeline).await)
            });
            prop_assert_eq!(a.unwrap(), b.unwrap());

            let (a, b) = rt.block_on(async {
                (with.find_first(&pipeline).await, without.find_first(&pipeline).await)
            });
            prop_assert_eq!(a.unwrap(), b.unwrap());
        }
    }
}
