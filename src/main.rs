use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use sqlstream::config::{ConnectionConfig, SavedConnections};
use sqlstream::db::{Driver, MemoryDriver, PostgresDriver};
use sqlstream::dialect::{registry, DbmsType};
use sqlstream::stream::{
    EntityDef, FieldDef, FieldKind, Pipeline, PredicateSpec, Record, SortKey, Terminator, Value,
};
use tracing::{debug, info};

/// Declarative stream pipelines compiled to dialect-aware SQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered engines
    Dialects,
    /// Print the connection URL for a saved connection or ad-hoc flags
    Url(UrlArgs),
    /// Show how a pipeline over the demo entity is split between SQL and memory
    Plan(PipelineArgs),
    /// Run a pipeline against the in-memory engine seeded with demo rows
    Demo(PipelineArgs),
    /// Connect to a saved PostgreSQL connection and run the initial query
    Check {
        /// Saved connection name
        name: String,
    },
}

#[derive(Args)]
struct UrlArgs {
    /// Use a saved connection by name
    #[arg(long = "connect", conflicts_with_all = ["dbms", "host"])]
    connect: Option<String>,
    #[arg(long, default_value = "PostgreSQL")]
    dbms: String,
    #[arg(long, default_value = "localhost")]
    host: String,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    database: Option<String>,
    /// Client driver major version
    #[arg(long = "driver-version")]
    driver_version: Option<u32>,
    /// Extra URL option as key=value
    #[arg(long = "option")]
    options: Vec<String>,
}

#[derive(Args)]
struct PipelineArgs {
    /// Engine to compile for
    #[arg(long, default_value = "PostgreSQL")]
    dbms: String,
    /// field:op[:value], op one of eq ne lt le gt ge between in notin null
    /// notnull like starts ends contains ieq regex
    #[arg(long)]
    filter: Vec<String>,
    /// field[:desc]
    #[arg(long)]
    sort: Vec<String>,
    #[arg(long)]
    skip: Vec<u64>,
    #[arg(long)]
    limit: Vec<u64>,
    /// Comma-separated fields to keep
    #[arg(long)]
    map: Vec<String>,
}

/// One pipeline flag, kept in command-line order.
enum Step {
    Filter(String),
    Sort(String),
    Skip(u64),
    Limit(u64),
    Map(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    let sub = matches.subcommand().map(|(_, m)| m);

    match cli.command {
        Command::Dialects => dialects(),
        Command::Url(args) => url(args),
        Command::Plan(args) => {
            let (dbms, pipeline) = build(&args, sub)?;
            plan(dbms, &pipeline)
        }
        Command::Demo(args) => {
            let (dbms, pipeline) = build(&args, sub)?;
            demo(dbms, &pipeline).await
        }
        Command::Check { name } => check(&name).await,
    }
}

fn dialects() -> Result<()> {
    for dbms in registry()?.iter() {
        let d = dbms.descriptor();
        let (open, close) = d.identifier_quote();
        println!("{}", d.name());
        println!("  scheme:         {}", d.url_scheme());
        match d.default_port() {
            Some(port) => println!("  default port:   {}", port),
            None => println!("  default port:   -"),
        }
        println!("  named schemas:  {}", d.has_named_schemas());
        println!("  quoting:        {}name{}", open, close);
        println!("  nulls sort low: {}", d.nulls_sort_low());
        if let Some(sentinel) = d.offset_without_limit() {
            println!("  offset only:    {}", sentinel);
        }
        if !d.initial_query().is_empty() {
            println!("  initial query:  {}", d.initial_query());
        }
    }
    Ok(())
}

fn url(args: UrlArgs) -> Result<()> {
    let config = match args.connect {
        Some(name) => saved_connection(&name)?,
        None => {
            let mut config = ConnectionConfig::new("cli", args.dbms, args.host);
            config.port = args.port;
            config.database = args.database;
            config.driver_version = args.driver_version;
            for option in &args.options {
                let (key, value) = option
                    .split_once('=')
                    .with_context(|| format!("option `{}` is not key=value", option))?;
                config.options.push((key.to_string(), value.to_string()));
            }
            config
        }
    };
    println!("{}", config.url()?);
    Ok(())
}

fn plan(dbms: &DbmsType, pipeline: &Pipeline) -> Result<()> {
    let driver = MemoryDriver::new();
    let plan = Terminator::new(dbms, &driver).plan(pipeline)?;
    let ops = pipeline.ops();

    println!("pushed ({} of {}):", plan.pushed_prefix_len, ops.len());
    for op in &ops[..plan.pushed_prefix_len] {
        println!("  {}", op.describe());
    }
    match &plan.fragment {
        Some(fragment) => {
            println!("sql: {}", fragment.text);
            let params: Vec<String> = fragment.parameters.iter().map(|v| v.to_string()).collect();
            println!("parameters: [{}]", params.join(", "));
        }
        None => println!("sql: (full scan)"),
    }
    println!("in memory:");
    for op in &plan.remaining {
        println!("  {}", op.describe());
    }
    Ok(())
}

async fn demo(dbms: &DbmsType, pipeline: &Pipeline) -> Result<()> {
    let entity = pipeline.entity();
    let driver = MemoryDriver::new();
    driver.create_table(entity);
    driver.seed(entity, demo_rows())?;

    let records = Terminator::new(dbms, &driver).collect(pipeline).await?;
    for statement in driver.statements() {
        debug!(sql = %statement.sql, parameters = ?statement.parameters, "executed");
    }
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn check(name: &str) -> Result<()> {
    let mut config = saved_connection(name)?;
    if config.password.is_empty() {
        if let Ok(pw) = std::env::var("PGPASSWORD") {
            config.password = pw;
        } else {
            let prompt = format!("Password for {}: ", config.display_string());
            config.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }

    let dbms = config.dbms_type()?;
    let driver = PostgresDriver::connect(&config).await?;
    let query = match dbms.descriptor().initial_query() {
        "" => "select version()",
        q => q,
    };
    info!(connection = %config.name, query, "running initial query");
    let rows = driver
        .execute(query, &[])
        .await
        .map_err(|e| anyhow::anyhow!(e.display_full()))?;
    for row in &rows.rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join(" | "));
    }
    println!("{}: ok", config.display_string());
    Ok(())
}

fn saved_connection(name: &str) -> Result<ConnectionConfig> {
    let saved = SavedConnections::load()?;
    match saved.find(name) {
        Some(c) => Ok(c.clone()),
        None => {
            let names: Vec<&str> = saved.connections.iter().map(|c| c.name.as_str()).collect();
            bail!(
                "no saved connection named {:?} (saved: {})",
                name,
                names.join(", ")
            )
        }
    }
}

fn demo_entity() -> Result<EntityDef> {
    Ok(EntityDef::builder("person", "people")
        .schema("app")
        .field(FieldDef::new("id", FieldKind::Int).auto_increment())
        .field(FieldDef::new("name", FieldKind::Text))
        .field(FieldDef::new("age", FieldKind::Int).nullable())
        .field(FieldDef::new("active", FieldKind::Bool))
        .field(FieldDef::new("joined", FieldKind::Date).column("joined_on"))
        .primary_key("id")
        .build()?)
}

fn demo_rows() -> Vec<Record> {
    let people: [(&str, Option<i64>, bool, (i32, u32, u32)); 8] = [
        ("ada", Some(36), true, (2019, 3, 1)),
        ("brian", Some(52), false, (2015, 7, 14)),
        ("chloe", None, true, (2021, 1, 9)),
        ("dmitri", Some(29), true, (2022, 11, 30)),
        ("Eve", Some(41), false, (2018, 5, 5)),
        ("farah", Some(29), true, (2020, 8, 21)),
        ("gus", Some(63), true, (2012, 2, 2)),
        ("hana", None, false, (2023, 6, 17)),
    ];
    people
        .iter()
        .map(|(name, age, active, (y, m, d))| {
            Record::new()
                .with("id", Value::Null)
                .with("name", *name)
                .with("age", age.map(Value::Int).unwrap_or(Value::Null))
                .with("active", *active)
                .with(
                    "joined",
                    NaiveDate::from_ymd_opt(*y, *m, *d).map_or(Value::Null, Value::Date),
                )
        })
        .collect()
}

/// Rebuild the pipeline in the order its flags were given.
fn build(
    args: &PipelineArgs,
    matches: Option<&ArgMatches>,
) -> Result<(&'static DbmsType, Pipeline)> {
    let dbms = registry()?.lookup(&args.dbms)?;
    let mut pipeline = Pipeline::new(Arc::new(demo_entity()?));
    for step in ordered_steps(args, matches) {
        pipeline = match step {
            Step::Filter(text) => pipeline.filter(parse_filter(&pipeline, &text)?)?,
            Step::Sort(text) => pipeline.sorted(match text.split_once(':') {
                Some((field, "desc")) => SortKey::desc(field),
                Some((field, "asc")) => SortKey::asc(field),
                Some((_, other)) => bail!("unknown sort direction `{}`", other),
                None => SortKey::asc(text),
            })?,
            Step::Skip(n) => pipeline.skip(n),
            Step::Limit(n) => pipeline.limit(n),
            Step::Map(fields) => {
                let fields: Vec<&str> = fields.split(',').map(str::trim).collect();
                pipeline.select(fields.join("_"), &fields)?
            }
        };
    }
    Ok((dbms, pipeline))
}

fn ordered_steps(args: &PipelineArgs, matches: Option<&ArgMatches>) -> Vec<Step> {
    let position = |id: &str| -> Vec<usize> {
        matches
            .and_then(|m| m.indices_of(id))
            .map(|i| i.collect())
            .unwrap_or_default()
    };
    let mut steps: Vec<(usize, Step)> = Vec::new();
    let mut add = |id: &str, items: Vec<Step>| {
        let indices = position(id);
        for (n, step) in items.into_iter().enumerate() {
            steps.push((indices.get(n).copied().unwrap_or(usize::MAX), step));
        }
    };
    add("filter", args.filter.iter().cloned().map(Step::Filter).collect());
    add("sort", args.sort.iter().cloned().map(Step::Sort).collect());
    add("skip", args.skip.iter().copied().map(Step::Skip).collect());
    add("limit", args.limit.iter().copied().map(Step::Limit).collect());
    add("map", args.map.iter().cloned().map(Step::Map).collect());
    steps.sort_by_key(|(i, _)| *i);
    steps.into_iter().map(|(_, step)| step).collect()
}

fn parse_filter(pipeline: &Pipeline, text: &str) -> Result<PredicateSpec> {
    let mut parts = text.splitn(3, ':');
    let field = parts.next().unwrap_or_default();
    let op = parts.next().with_context(|| format!("filter `{}` has no operator", text))?;
    let raw = parts.next();
    let kind = pipeline
        .shape()
        .field(field)
        .map(|f| f.kind)
        .with_context(|| format!("`{}` has no field `{}`", pipeline.shape().name, field))?;

    let value = || -> Result<&str> {
        raw.with_context(|| format!("filter `{}` needs a value", text))
    };
    let one = || -> Result<Value> { parse_value(kind, value()?) };
    let list = || -> Result<Vec<Value>> {
        value()?.split(',').map(|v| parse_value(kind, v.trim())).collect()
    };

    Ok(match op {
        "eq" => PredicateSpec::eq(field, one()?),
        "ne" => PredicateSpec::ne(field, one()?),
        "lt" => PredicateSpec::lt(field, one()?),
        "le" => PredicateSpec::le(field, one()?),
        "gt" => PredicateSpec::gt(field, one()?),
        "ge" => PredicateSpec::ge(field, one()?),
        "between" => match list()?.as_slice() {
            [low, high] => PredicateSpec::between(field, low.clone(), high.clone()),
            _ => bail!("between takes two comma-separated values"),
        },
        "in" => PredicateSpec::is_in(field, list()?),
        "notin" => PredicateSpec::not_in(field, list()?),
        "null" => PredicateSpec::is_null(field),
        "notnull" => PredicateSpec::is_not_null(field),
        "like" => PredicateSpec::like(field, value()?),
        "starts" => PredicateSpec::starts_with(field, value()?),
        "ends" => PredicateSpec::ends_with(field, value()?),
        "contains" => PredicateSpec::contains(field, value()?),
        "ieq" => PredicateSpec::equal_ignore_case(field, value()?),
        "regex" => PredicateSpec::matches(field, value()?)?,
        other => bail!("unknown filter operator `{}`", other),
    })
}

fn parse_value(kind: FieldKind, raw: &str) -> Result<Value> {
    if raw.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    let invalid = || format!("`{}` is not a valid {:?}", raw, kind);
    Ok(match kind {
        FieldKind::Bool => Value::Bool(raw.parse().with_context(invalid)?),
        FieldKind::Int => Value::Int(raw.parse().with_context(invalid)?),
        FieldKind::Float => Value::Float(raw.parse().with_context(invalid)?),
        FieldKind::Text => Value::Text(raw.to_string()),
        FieldKind::Date => {
            Value::Date(NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(invalid)?)
        }
        FieldKind::Timestamp => Value::Timestamp(
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").with_context(invalid)?,
        ),
    })
}
