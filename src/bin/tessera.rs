//! Command-line front end: runs, explains or parses a query against an
//! in-memory database seeded from a JSON file.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value as JsonValue;
use tessera::{
    catalog::Database,
    config::EngineConfig,
    query::{Query, QueryResult},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Run queries against an in-memory Tessera database",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Json,
        help = "Output format for results"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        env = "TESSERA_BATCH_SIZE",
        help = "Rows pulled from the engine per batch"
    )]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Execute a query and print its rows")]
    Query(RunArgs),

    #[command(about = "Show the optimized plan(s) for a query")]
    Explain(RunArgs),

    #[command(about = "Parse a query and print its AST")]
    Parse {
        #[arg(value_name = "QUERY")]
        text: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(value_name = "QUERY", required_unless_present = "plan")]
    text: Option<String>,

    #[arg(long, value_name = "FILE", conflicts_with = "text", help = "Serialized plan to run instead of query text")]
    plan: Option<PathBuf>,

    #[arg(long, value_name = "JSON", help = "Bind parameters as a JSON object")]
    bind: Option<String>,

    #[arg(long, value_name = "JSON", help = "Query options as a JSON object")]
    options: Option<String>,

    #[arg(long, value_name = "FILE", help = "JSON file mapping collection names to documents")]
    data: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TESSERA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

/// Returns whether the query succeeded.
fn run() -> Result<bool, Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = EngineConfig::default();
    if let Some(batch_size) = cli.batch_size {
        config = config.with_batch_size(batch_size);
    }
    let db = Database::with_config("cli", config);

    let result = match &cli.command {
        Command::Query(args) => build_query(&db, args)?.execute(),
        Command::Explain(args) => build_query(&db, args)?.explain(),
        Command::Parse { text } => {
            Query::new(db, text.as_str(), JsonValue::Null, JsonValue::Null).parse()
        }
    };
    emit(cli.format, &result)?;
    Ok(result.is_success())
}

fn build_query(db: &Arc<Database>, args: &RunArgs) -> Result<Query, Box<dyn Error>> {
    if let Some(path) = &args.data {
        let seeded = db.load_json(&read_json(path)?)?;
        tracing::debug!(documents = seeded, path = %path.display(), "seed data loaded");
    }
    let options = parse_json_arg(args.options.as_deref())?;
    let query = match (&args.text, &args.plan) {
        (_, Some(plan)) => Query::from_serialized(Arc::clone(db), read_json(plan)?, options),
        (Some(text), None) => Query::new(
            Arc::clone(db),
            text.as_str(),
            parse_json_arg(args.bind.as_deref())?,
            options,
        ),
        (None, None) => return Err("either QUERY or --plan is required".into()),
    };
    Ok(query)
}

fn read_json(path: &Path) -> Result<JsonValue, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

fn parse_json_arg(arg: Option<&str>) -> Result<JsonValue, Box<dyn Error>> {
    match arg {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(JsonValue::Null),
    }
}

fn emit(format: OutputFormat, result: &QueryResult) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => print_result_text(result)?,
    }
    Ok(())
}

fn print_result_text(result: &QueryResult) -> Result<(), Box<dyn Error>> {
    if !result.is_success() {
        println!("error {}: {}", result.code, result.message);
        return Ok(());
    }
    for row in result.rows.iter().flatten() {
        println!("{}", serde_json::to_string(row)?);
    }
    if let Some(stats) = &result.stats {
        println!(
            "writes_executed={} writes_ignored={} scanned_full={} scanned_index={} filtered={}",
            stats.writes_executed,
            stats.writes_ignored,
            stats.scanned_full,
            stats.scanned_index,
            stats.filtered
        );
    }
    if let Some(profile) = &result.profile {
        for (phase, secs) in &profile.0 {
            println!("{phase}: {:.3} ms", secs * 1000.0);
        }
    }
    Ok(())
}
