use text2sql::config::Settings;
use text2sql::executor::QueryResult;
use text2sql::session::{load_seeds, Session};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "text2sql")]
#[command(about = "Answer natural-language questions with staged SQL generation")]
#[command(version)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (or set DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Schema / catalog label (or set TEXT2SQL_DATA_SOURCE)
    #[arg(long, global = true)]
    data_source: Option<String>,

    /// Schema index file (or set TEXT2SQL_INDEX)
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a question to SQL, run it and print the rows
    Ask {
        question: String,

        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,

        /// Model override (or set LLM_MODEL)
        #[arg(long)]
        model: Option<String>,

        /// Skip the read-only statement check
        #[arg(long)]
        allow_unsafe: bool,

        /// Print stage transitions and token usage
        #[arg(long)]
        trace: bool,
    },
    /// Print the catalog as the prompts see it
    Schema {
        /// Print JSON instead of prompt text
        #[arg(long)]
        json: bool,
    },
    /// Schema index maintenance
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Build the index from seed questions (one per table when omitted)
    Build {
        /// JSON array of {"table", "question"}
        #[arg(long)]
        seeds: Option<PathBuf>,
    },
    /// Show the nearest index records for some text
    Search {
        text: String,

        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(url) = args.database_url {
        settings.database.url = Some(url);
    }
    if let Some(source) = args.data_source {
        settings.database.data_source = Some(source);
    }
    if let Some(index) = args.index {
        settings.retrieval.index_path = Some(index);
    }

    match args.command {
        Commands::Ask {
            question,
            format,
            model,
            allow_unsafe,
            trace,
        } => {
            if let Some(model) = model {
                settings.llm.model = model;
            }
            if allow_unsafe {
                warn!("Read-only statement check disabled");
                settings.pipeline.reject_unsafe_statements = false;
            }
            ask(settings, &question, format, trace).await
        }
        Commands::Schema { json } => print_schema(settings, json).await,
        Commands::Index { command } => match command {
            IndexCommands::Build { seeds } => build_index(settings, seeds).await,
            IndexCommands::Search { text, top_k } => search_index(settings, &text, top_k).await,
        },
    }
}

async fn ask(settings: Settings, question: &str, format: OutputFormat, trace: bool) -> Result<()> {
    let session = Session::open(settings).await?;
    let pipeline = session.pipeline()?;

    info!("Question: {}", question);
    let outcome = match pipeline.run(question).await {
        Ok(outcome) => outcome,
        Err(failure) => {
            if let Some(reason) = failure.refusal() {
                eprintln!("Refused: {}", reason);
            }
            if let Some(sql) = failure.last_sql() {
                eprintln!("Last SQL:\n{}", sql);
            }
            return Err(failure.into());
        }
    };

    eprintln!("SQL:\n{}\n", outcome.sql());
    match format {
        OutputFormat::Table => print_table(&outcome.result),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome.result)?),
        OutputFormat::Csv => print_csv(&outcome.result)?,
    }

    if trace {
        for t in &outcome.transitions {
            eprintln!("{:>8} ms  {} -> {}", t.elapsed_ms, t.from, t.to);
        }
        let usage = session.token_usage();
        eprintln!(
            "{} LLM calls, {} input tokens, {} output tokens",
            usage.calls, usage.input_tokens, usage.output_tokens
        );
    }
    Ok(())
}

async fn print_schema(settings: Settings, json: bool) -> Result<()> {
    let session = Session::open(settings).await?;
    let catalog = session.catalog();
    if json {
        println!("{}", serde_json::to_string_pretty(catalog.as_ref())?);
    } else {
        println!("Data source: {}\n", catalog.data_source);
        print!("{}", catalog.render_fields(None));
        println!("Foreign keys: {}", catalog.render_foreign_keys(None));
        println!("Primary keys: {}", catalog.render_primary_keys(None));
    }
    Ok(())
}

async fn build_index(settings: Settings, seeds: Option<PathBuf>) -> Result<()> {
    let seeds_path = seeds.or_else(|| settings.retrieval.seed_questions.clone());
    if settings.retrieval.index_path.is_none() {
        warn!("No index path configured; the index will not be saved");
    }
    let seeds = match &seeds_path {
        Some(path) => load_seeds(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Vec::new(),
    };

    let mut session = Session::open(settings).await?;
    let records = session.build_index(&seeds).await?;
    println!("Indexed {} records", records);
    Ok(())
}

async fn search_index(settings: Settings, text: &str, top_k: usize) -> Result<()> {
    let session = Session::open(settings).await?;
    for hit in session.search_index(text, top_k).await? {
        println!(
            "{:.3}  {:<24} {}",
            hit.score, hit.record.table_name, hit.record.question
        );
    }
    Ok(())
}

fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_table(result: &QueryResult) {
    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .map(|c| row.get(c).map(cell).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            rows.iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect::<Vec<_>>()
            .join(" | ")
    };

    println!("{}", line(&result.columns));
    println!("{}", widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));
    for row in &rows {
        println!("{}", line(row));
    }
    println!("({} rows, {} ms)", result.row_count, result.execution_time_ms);
}

fn print_csv(result: &QueryResult) -> Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(&result.columns)?;
    for row in &result.rows {
        writer.write_record(result.columns.iter().map(|c| row.get(c).map(cell).unwrap_or_default()))?;
    }
    writer.flush()?;
    Ok(())
}
